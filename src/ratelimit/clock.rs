//! Wall-clock abstraction so expiry can be driven by hand in tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// `from + by`, saturating at the latest representable instant.
pub fn instant_after(from: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Round up to the next whole second. Block records persist whole Unix seconds.
pub fn ceil_to_secs(instant: DateTime<Utc>) -> DateTime<Utc> {
    if instant.timestamp_subsec_nanos() == 0 {
        return instant;
    }
    instant
        .timestamp()
        .checked_add(1)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or(instant)
}

/// Source of the current instant.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = instant_after(*now, by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_all_clones() {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let clock = ManualClock::new(start);
        let other = clock.clone();

        clock.advance(Duration::from_millis(1500));

        assert_eq!(other.now(), start + chrono::Duration::milliseconds(1500));
    }

    #[test]
    fn test_ceil_to_secs() {
        let whole = DateTime::from_timestamp(100, 0).unwrap();
        assert_eq!(ceil_to_secs(whole), whole);

        let fractional = DateTime::from_timestamp(100, 1_000_000).unwrap();
        assert_eq!(ceil_to_secs(fractional), DateTime::from_timestamp(101, 0).unwrap());

        let late = DateTime::from_timestamp(100, 999_000_000).unwrap();
        assert_eq!(ceil_to_secs(late), DateTime::from_timestamp(101, 0).unwrap());
    }

    #[test]
    fn test_manual_clock_set() {
        let clock = ManualClock::default();
        let target = DateTime::from_timestamp(42, 0).unwrap();
        clock.set(target);
        assert_eq!(clock.now(), target);
    }
}

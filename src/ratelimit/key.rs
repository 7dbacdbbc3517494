//! Store key construction.

use std::fmt;

use super::class::LimitClass;

/// Prefix shared by every key this service writes.
pub const KEY_PREFIX: &str = "rate_limiter";

/// The kind of record stored for an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Requests seen in the current window
    Count,
    /// Instant a block lifts
    Blocked,
}

impl RecordKind {
    fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Count => "count",
            RecordKind::Blocked => "blocked",
        }
    }
}

/// A key that uniquely identifies one record in the counter store.
///
/// Encoded as `rate_limiter:<class>:<key>:<kind>`. The class never contains
/// `:` and the kind is always the last segment, so identities that contain
/// `:` (IPv6 literals, tokens) still decode to exactly one triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey(String);

impl StoreKey {
    /// Build the key for `(class, key, kind)`.
    pub fn new(class: LimitClass, key: &str, kind: RecordKind) -> Self {
        Self(format!(
            "{}:{}:{}:{}",
            KEY_PREFIX,
            class.as_str(),
            key,
            kind.as_str()
        ))
    }

    /// Counter record key.
    pub fn count(class: LimitClass, key: &str) -> Self {
        Self::new(class, key, RecordKind::Count)
    }

    /// Block record key.
    pub fn blocked(class: LimitClass, key: &str) -> Self {
        Self::new(class, key, RecordKind::Blocked)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(
            StoreKey::count(LimitClass::Ip, "1.2.3.4").as_str(),
            "rate_limiter:ip:1.2.3.4:count"
        );
        assert_eq!(
            StoreKey::blocked(LimitClass::Token, "abc123").as_str(),
            "rate_limiter:token:abc123:blocked"
        );
    }

    #[test]
    fn test_classes_do_not_collide() {
        let ip = StoreKey::count(LimitClass::Ip, "1.2.3.4");
        let token = StoreKey::count(LimitClass::Token, "1.2.3.4");
        assert_ne!(ip, token);
    }

    #[test]
    fn test_kinds_do_not_collide() {
        let count = StoreKey::count(LimitClass::Ip, "::1");
        let blocked = StoreKey::blocked(LimitClass::Ip, "::1");
        assert_ne!(count, blocked);
        assert_eq!(count.as_str(), "rate_limiter:ip:::1:count");
    }

    #[test]
    fn test_key_is_deterministic() {
        assert_eq!(
            StoreKey::new(LimitClass::Token, "t", RecordKind::Count),
            StoreKey::count(LimitClass::Token, "t")
        );
    }
}

//! In-process counter store.
//!
//! Records live in a sharded concurrent map. Every read and write for one key
//! goes through that key's shard lock, which makes increment-and-read a
//! single indivisible step for concurrent callers in the same process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

use super::backend::{CounterStore, StoreError, StoreResult};
use super::class::LimitClass;
use super::clock::{ceil_to_secs, instant_after, Clock, SystemClock};
use super::key::StoreKey;

#[derive(Debug, Clone, Copy)]
struct Record {
    value: i64,
    expires_at: DateTime<Utc>,
}

impl Record {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Counter store for single-process deployments.
pub struct MemoryStore {
    records: DashMap<String, Record>,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Create a store that expires records against the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that expires records against the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
            closed: AtomicBool::new(false),
        }
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            debug!(removed = removed, "Purged expired rate limit records");
        }
        removed
    }

    /// Number of records currently held, live or not yet purged.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Read a live record, dropping it if it has already expired.
    fn live_record(&self, key: &StoreKey, now: DateTime<Utc>) -> Option<Record> {
        let record = self.records.get(key.as_str()).map(|r| *r)?;
        if record.is_expired(now) {
            self.records
                .remove_if(key.as_str(), |_, r| r.is_expired(now));
            return None;
        }
        Some(record)
    }

    fn block_instant(key: &StoreKey, record: Record) -> StoreResult<DateTime<Utc>> {
        DateTime::from_timestamp(record.value, 0).ok_or_else(|| StoreError::Malformed {
            key: key.to_string(),
            value: record.value.to_string(),
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get_count(&self, key: &str, class: LimitClass) -> StoreResult<u64> {
        self.ensure_open()?;
        let store_key = StoreKey::count(class, key);
        match self.live_record(&store_key, self.clock.now()) {
            Some(record) => u64::try_from(record.value).map_err(|_| StoreError::Malformed {
                key: store_key.to_string(),
                value: record.value.to_string(),
            }),
            None => Ok(0),
        }
    }

    async fn increment_count(
        &self,
        key: &str,
        class: LimitClass,
        window: Duration,
    ) -> StoreResult<u64> {
        self.ensure_open()?;
        let now = self.clock.now();
        let store_key = StoreKey::count(class, key);

        // The entry guard holds the shard lock across reset, increment and read.
        let mut record = self
            .records
            .entry(store_key.into_string())
            .or_insert_with(|| Record {
                value: 0,
                expires_at: instant_after(now, window),
            });
        if record.is_expired(now) {
            *record = Record {
                value: 0,
                expires_at: instant_after(now, window),
            };
        }
        record.value += 1;
        let count = record.value;
        drop(record);

        trace!(key = %key, class = %class, count = count, "Incremented window count");
        Ok(count as u64)
    }

    async fn set_blocked(
        &self,
        key: &str,
        class: LimitClass,
        block_until: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.ensure_open()?;
        let now = self.clock.now();
        if block_until <= now {
            return Err(StoreError::InvalidDuration { block_until });
        }
        // Value and expiry must agree on the persisted whole second.
        let block_until = ceil_to_secs(block_until);

        self.records.insert(
            StoreKey::blocked(class, key).into_string(),
            Record {
                value: block_until.timestamp(),
                expires_at: block_until,
            },
        );
        Ok(())
    }

    async fn is_blocked(
        &self,
        key: &str,
        class: LimitClass,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        self.ensure_open()?;
        let now = self.clock.now();
        let store_key = StoreKey::blocked(class, key);
        let Some(record) = self.live_record(&store_key, now) else {
            return Ok(None);
        };
        let until = Self::block_instant(&store_key, record)?;
        Ok((until > now).then_some(until))
    }

    async fn get_block_until(
        &self,
        key: &str,
        class: LimitClass,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        self.ensure_open()?;
        let store_key = StoreKey::blocked(class, key);
        self.live_record(&store_key, self.clock.now())
            .map(|record| Self::block_instant(&store_key, record))
            .transpose()
    }

    async fn close(&self) -> StoreResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.records.clear();
            debug!("Memory store closed");
        }
        Ok(())
    }
}

//! Counter store trait for abstracting shared and in-process backends.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::class::LimitClass;

/// Errors raised by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("Store connection error: {0}")]
    Connection(String),

    /// A command against the store failed
    #[error("Store command failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored value could not be parsed
    #[error("Malformed value {value:?} stored under {key}")]
    Malformed { key: String, value: String },

    /// A block was requested with an expiry that is not in the future
    #[error("Block expiry {block_until} is not in the future")]
    InvalidDuration { block_until: DateTime<Utc> },

    /// The caller's deadline elapsed before the store answered
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store has been closed
    #[error("Store is closed")]
    Closed,
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Trait for counter store implementations.
///
/// Every operation is scoped to an `(identity, class)` pair. Implementations
/// are shared by all concurrent evaluations and must provide the atomicity
/// described on each method themselves; callers never lock around them.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current window count, or 0 if no counter record exists.
    async fn get_count(&self, key: &str, class: LimitClass) -> StoreResult<u64>;

    /// Atomically increment the window count and return the new value.
    ///
    /// The first increment of a fresh window sets the record to expire after
    /// `window` as part of the same operation. No two concurrent callers may
    /// observe the same post-increment value.
    async fn increment_count(
        &self,
        key: &str,
        class: LimitClass,
        window: Duration,
    ) -> StoreResult<u64>;

    /// Record a block lifting at `block_until`, expiring at that instant.
    ///
    /// Fails with [`StoreError::InvalidDuration`] if `block_until` is not
    /// strictly in the future.
    async fn set_blocked(
        &self,
        key: &str,
        class: LimitClass,
        block_until: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// The instant a live block lifts, or `None` if absent or expired.
    async fn is_blocked(&self, key: &str, class: LimitClass)
        -> StoreResult<Option<DateTime<Utc>>>;

    /// Raw read of the recorded block instant, without comparing it to now.
    async fn get_block_until(
        &self,
        key: &str,
        class: LimitClass,
    ) -> StoreResult<Option<DateTime<Utc>>>;

    /// Release underlying connections. Calling it again is a no-op.
    async fn close(&self) -> StoreResult<()>;
}

//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::backend::{CounterStore, StoreError};
use super::class::LimitClass;
use super::clock::{ceil_to_secs, instant_after};
use super::policy::{LimitPolicies, WINDOW};

/// Errors that can occur while evaluating a request.
#[derive(Debug, Error)]
pub enum LimiterError {
    /// The limit class is not one of the known classes
    #[error("Invalid rate limit class: {0}")]
    InvalidClass(String),

    /// A block was computed with an expiry that is not in the future
    #[error("Block expiry {block_until} is not in the future")]
    InvalidDuration { block_until: DateTime<Utc> },

    /// The counter store failed or could not be reached
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LimiterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidDuration { block_until } => {
                LimiterError::InvalidDuration { block_until }
            }
            other => LimiterError::Store(other),
        }
    }
}

/// The outcome of evaluating one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u32,
    /// When the caller's budget resets
    pub reset_time: DateTime<Utc>,
    /// When the active block lifts, if denied
    pub block_until: Option<DateTime<Utc>>,
}

impl Decision {
    fn admit(remaining: u32, reset_time: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_time,
            block_until: None,
        }
    }

    fn deny(block_until: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_time: block_until,
            block_until: Some(block_until),
        }
    }
}

/// The fixed-window decision engine.
///
/// Holds no mutable state of its own: counters and blocks live in the
/// injected store, and all serialization between concurrent evaluations is
/// delegated to the store's atomic increment. Cheap to clone.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    policies: LimitPolicies,
}

impl RateLimiter {
    /// Create a new rate limiter over a shared store.
    pub fn new(store: Arc<dyn CounterStore>, policies: LimitPolicies) -> Self {
        Self { store, policies }
    }

    /// The policies this limiter was built with.
    pub fn policies(&self) -> &LimitPolicies {
        &self.policies
    }

    /// Evaluate a request for an identity under a class given by name.
    ///
    /// Unknown class names fail with [`LimiterError::InvalidClass`] before
    /// the store is touched.
    pub async fn evaluate(
        &self,
        key: &str,
        class: &str,
        now: DateTime<Utc>,
    ) -> Result<Decision, LimiterError> {
        let class: LimitClass = class.parse()?;
        self.check(key, class, now).await
    }

    /// Like [`evaluate`](Self::evaluate), bounded by a deadline.
    pub async fn evaluate_with_timeout(
        &self,
        key: &str,
        class: &str,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Decision, LimiterError> {
        let class: LimitClass = class.parse()?;
        self.check_with_timeout(key, class, now, timeout).await
    }

    /// Like [`check`](Self::check), bounded by a deadline.
    ///
    /// An expired deadline is reported as a store failure, never as a denial.
    pub async fn check_with_timeout(
        &self,
        key: &str,
        class: LimitClass,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Decision, LimiterError> {
        match tokio::time::timeout(timeout, self.check(key, class, now)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(key = %key, class = %class, timeout = ?timeout, "Rate limit check timed out");
                Err(LimiterError::Store(StoreError::Timeout(timeout)))
            }
        }
    }

    /// Evaluate one request for `key` under `class` at `now`.
    ///
    /// Every call that is not short-circuited by an active block consumes one
    /// unit of the window's budget, so repeated calls are not idempotent.
    pub async fn check(
        &self,
        key: &str,
        class: LimitClass,
        now: DateTime<Utc>,
    ) -> Result<Decision, LimiterError> {
        trace!(key = %key, class = %class, "Checking rate limit");

        if let Some(block_until) = self.store.is_blocked(key, class).await.map_err(store_failure)? {
            if block_until > now {
                trace!(key = %key, class = %class, block_until = %block_until, "Identity is blocked");
                return Ok(Decision::deny(block_until));
            }
        }

        let policy = self.policies.policy_for(class);
        let threshold = u64::from(policy.requests_per_second);

        let count = self
            .store
            .increment_count(key, class, WINDOW)
            .await
            .map_err(store_failure)?;

        if count <= threshold {
            // `count` is at most `threshold`, which came from a u32.
            let remaining = (threshold - count) as u32;
            return Ok(Decision::admit(remaining, instant_after(now, WINDOW)));
        }

        let block_until = ceil_to_secs(instant_after(now, policy.block_duration()));

        if count == threshold + 1 {
            // Only the caller that crossed the threshold writes the block.
            self.store
                .set_blocked(key, class, block_until)
                .await
                .map_err(store_failure)?;

            debug!(
                key = %key,
                class = %class,
                count = count,
                limit = threshold,
                block_until = %block_until,
                "Rate limit exceeded, identity blocked"
            );
            return Ok(Decision::deny(block_until));
        }

        // Lost the race to the caller that is writing the block.
        let recorded = self
            .store
            .get_block_until(key, class)
            .await
            .map_err(store_failure)?
            .filter(|until| *until > now);

        // With no live record, either the block write is still in flight or it
        // failed. The computed instant is only enforced in the first case.
        debug!(key = %key, class = %class, count = count, "Rate limit exceeded");
        Ok(Decision::deny(recorded.unwrap_or(block_until)))
    }
}

fn store_failure(err: StoreError) -> LimiterError {
    warn!(error = %err, "Counter store failure");
    err.into()
}

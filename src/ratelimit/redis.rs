//! Redis-backed counter store.
//!
//! One connection manager is opened at startup and shared by every
//! evaluation. Counters rely on Redis' native `INCR` and key expiry, so any
//! number of processes pointed at the same server see one counter per key.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use super::backend::{CounterStore, StoreError, StoreResult};
use super::class::LimitClass;
use super::clock::ceil_to_secs;
use super::key::StoreKey;

/// Increment a counter and set its expiry in one server-side step.
///
/// The expiry is only applied when the increment created the key, so a
/// window is never stretched by later requests and no observer can see a
/// counter without a TTL.
const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return current
"#;

/// How long to wait for the initial `PING` before giving up.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Counter store backed by a shared Redis server.
pub struct RedisStore {
    /// `None` once the store has been closed.
    conn: RwLock<Option<ConnectionManager>>,
    increment: Script,
}

impl RedisStore {
    /// Connect to Redis and verify the server answers a `PING`.
    pub async fn connect(url: &str, connect_timeout: Duration) -> StoreResult<Self> {
        let client = Client::open(url)
            .map_err(|e| StoreError::Connection(format!("Invalid Redis URL: {e}")))?;

        let mut conn = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Timeout(connect_timeout))?
            .map_err(|e| StoreError::Connection(format!("Failed to connect to Redis: {e}")))?;

        let _: String = tokio::time::timeout(connect_timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout(connect_timeout))?
            .map_err(|e| StoreError::Connection(format!("Failed to ping Redis server: {e}")))?;

        info!("Connected to Redis counter store");

        Ok(Self {
            conn: RwLock::new(Some(conn)),
            increment: Script::new(INCREMENT_SCRIPT),
        })
    }

    /// Clone out the shared connection. Clones multiplex over one socket.
    fn connection(&self) -> StoreResult<ConnectionManager> {
        self.conn.read().clone().ok_or(StoreError::Closed)
    }

    async fn read_block_until(&self, key: &str, class: LimitClass) -> StoreResult<Option<DateTime<Utc>>> {
        let store_key = StoreKey::blocked(class, key);
        let mut conn = self.connection()?;
        let raw: Option<String> = conn.get(store_key.as_str()).await?;
        raw.map(|value| parse_block_until(&store_key, value)).transpose()
    }
}

fn parse_block_until(key: &StoreKey, value: String) -> StoreResult<DateTime<Utc>> {
    value
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| StoreError::Malformed {
            key: key.to_string(),
            value,
        })
}

fn parse_count(key: &StoreKey, value: String) -> StoreResult<u64> {
    value.trim().parse::<u64>().map_err(|_| StoreError::Malformed {
        key: key.to_string(),
        value,
    })
}

/// Milliseconds from `now` until `until`, if strictly positive.
fn ttl_millis(now: DateTime<Utc>, until: DateTime<Utc>) -> Option<u64> {
    let millis = (until - now).num_milliseconds();
    u64::try_from(millis).ok().filter(|ms| *ms > 0)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get_count(&self, key: &str, class: LimitClass) -> StoreResult<u64> {
        let store_key = StoreKey::count(class, key);
        let mut conn = self.connection()?;
        let raw: Option<String> = conn.get(store_key.as_str()).await?;
        match raw {
            Some(value) => parse_count(&store_key, value),
            None => Ok(0),
        }
    }

    async fn increment_count(
        &self,
        key: &str,
        class: LimitClass,
        window: Duration,
    ) -> StoreResult<u64> {
        let store_key = StoreKey::count(class, key);
        let mut conn = self.connection()?;
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);

        let count: i64 = self
            .increment
            .key(store_key.as_str())
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await?;

        u64::try_from(count).map_err(|_| StoreError::Malformed {
            key: store_key.to_string(),
            value: count.to_string(),
        })
    }

    async fn set_blocked(
        &self,
        key: &str,
        class: LimitClass,
        block_until: DateTime<Utc>,
    ) -> StoreResult<()> {
        let now = Utc::now();
        if block_until <= now {
            return Err(StoreError::InvalidDuration { block_until });
        }
        // The value is whole seconds, so the TTL runs to that same second.
        let block_until = ceil_to_secs(block_until);
        let ttl_ms = ttl_millis(now, block_until)
            .ok_or(StoreError::InvalidDuration { block_until })?;

        let store_key = StoreKey::blocked(class, key);
        let mut conn = self.connection()?;
        let () = conn
            .pset_ex(store_key.as_str(), block_until.timestamp(), ttl_ms)
            .await?;

        debug!(key = %store_key, ttl_ms = ttl_ms, "Block record written");
        Ok(())
    }

    async fn is_blocked(
        &self,
        key: &str,
        class: LimitClass,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let now = Utc::now();
        Ok(self
            .read_block_until(key, class)
            .await?
            .filter(|until| *until > now))
    }

    async fn get_block_until(
        &self,
        key: &str,
        class: LimitClass,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        self.read_block_until(key, class).await
    }

    async fn close(&self) -> StoreResult<()> {
        // Dropping the last manager clone closes the socket.
        if self.conn.write().take().is_some() {
            info!("Redis counter store closed");
        }
        Ok(())
    }
}

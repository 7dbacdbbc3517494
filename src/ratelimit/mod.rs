//! Rate limiting logic and the counter stores it runs against.

mod backend;
mod class;
mod clock;
mod key;
mod limiter;
mod memory;
mod policy;
mod redis;

pub use backend::{CounterStore, StoreError, StoreResult};
pub use class::LimitClass;
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{RecordKind, StoreKey, KEY_PREFIX};
pub use limiter::{Decision, LimiterError, RateLimiter};
pub use memory::MemoryStore;
pub use policy::{ClassPolicy, LimitPolicies, WINDOW};
pub use self::redis::{RedisStore, DEFAULT_CONNECT_TIMEOUT};

//! HTTP boundary: identity extraction, the rate limit middleware and the server.

mod extract;
mod middleware;
mod server;

pub use extract::{extract_identity, ExtractError, Identity, API_KEY_HEADER};
pub use middleware::{rate_limit, RateLimitState, BLOCKED_MESSAGE, REMAINING_HEADER, RESET_HEADER};
pub use server::HttpServer;

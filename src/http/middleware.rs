//! Rate limiting middleware for HTTP requests.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};

use super::extract::extract_identity;
use crate::ratelimit::{Decision, LimiterError, RateLimiter};

/// Requests left in the current window.
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
/// When the current window resets, RFC 3339.
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// Body text returned with a 429.
pub const BLOCKED_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// State shared by every invocation of the middleware.
#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: RateLimiter,
    /// Deadline for one check against the store
    pub timeout: Duration,
}

impl RateLimitState {
    pub fn new(limiter: RateLimiter, timeout: Duration) -> Self {
        Self { limiter, timeout }
    }
}

#[derive(Serialize)]
struct BlockedBody {
    error: &'static str,
    block_until: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn rfc3339(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Check the caller's budget before handing the request on.
///
/// Over-budget callers get a 429. Store failures get a 500 so clients can
/// tell an unhealthy limiter apart from an exhausted budget.
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let identity = match extract_identity(request.headers(), peer) {
        Ok(identity) => identity,
        Err(e) => {
            debug!(error = %e, "Could not identify caller");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let result = state
        .limiter
        .check_with_timeout(&identity.key, identity.class, Utc::now(), state.timeout)
        .await;

    match result {
        Ok(decision) if decision.allowed => {
            let mut response = next.run(request).await;
            add_rate_limit_headers(&mut response, &decision);
            response
        }
        Ok(decision) => {
            debug!(key = %identity.key, class = %identity.class, "Request rejected by rate limit");
            too_many_requests(&decision)
        }
        Err(LimiterError::InvalidClass(class)) => {
            warn!(class = %class, "Unknown rate limit class");
            (StatusCode::BAD_REQUEST, format!("invalid rate limit class: {class}")).into_response()
        }
        Err(err) => {
            error!(key = %identity.key, class = %identity.class, error = %err, "Rate limit check failed");
            internal_error()
        }
    }
}

fn add_rate_limit_headers(response: &mut Response, decision: &Decision) {
    let headers = response.headers_mut();
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    if let Ok(reset) = HeaderValue::from_str(&rfc3339(decision.reset_time)) {
        headers.insert(RESET_HEADER, reset);
    }
}

fn too_many_requests(decision: &Decision) -> Response {
    let block_until = decision.block_until.unwrap_or(decision.reset_time);
    let body = BlockedBody {
        error: BLOCKED_MESSAGE,
        block_until: rfc3339(block_until),
    };
    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
}

fn internal_error() -> Response {
    let body = ErrorBody {
        error: "internal server error".to_string(),
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc3339_uses_whole_seconds() {
        let instant = DateTime::from_timestamp(1_700_000_000, 123_000_000).unwrap();
        assert_eq!(rfc3339(instant), "2023-11-14T22:13:20Z");
    }

    #[test]
    fn test_allowed_headers() {
        let decision = Decision {
            allowed: true,
            remaining: 4,
            reset_time: DateTime::from_timestamp(1_700_000_001, 0).unwrap(),
            block_until: None,
        };
        let mut response = StatusCode::OK.into_response();

        add_rate_limit_headers(&mut response, &decision);

        assert_eq!(response.headers()[REMAINING_HEADER], "4");
        assert_eq!(response.headers()[RESET_HEADER], "2023-11-14T22:13:21Z");
    }
}

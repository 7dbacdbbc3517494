//! HTTP server implementation.

use std::net::SocketAddr;
use std::time::Duration;

use axum::routing::get;
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{rate_limit, RateLimitState};
use crate::error::Result;
use crate::ratelimit::RateLimiter;

/// HTTP server fronting the application with the rate limiter.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Limiter and store deadline shared with the middleware
    state: RateLimitState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, limiter: RateLimiter, store_timeout: Duration) -> Self {
        Self {
            addr,
            state: RateLimitState::new(limiter, store_timeout),
        }
    }

    /// The application routes, every one behind the rate limiter.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(hello))
            .layer(middleware::from_fn_with_state(self.state.clone(), rate_limit))
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        let app = self.router();

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}

async fn hello() -> Json<Value> {
    Json(json!({ "message": "Hello, world! You are not rate limited." }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{API_KEY_HEADER, BLOCKED_MESSAGE, REMAINING_HEADER, RESET_HEADER};
    use crate::ratelimit::{
        ClassPolicy, CounterStore, LimitClass, LimitPolicies, MemoryStore, StoreError,
        StoreResult,
    };
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use chrono::{DateTime, Utc};
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn create_test_server(store: Arc<dyn CounterStore>) -> HttpServer {
        let limiter = RateLimiter::new(
            store,
            LimitPolicies {
                ip: ClassPolicy::new(2, 60),
                token: ClassPolicy::new(3, 60),
            },
        );
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        HttpServer::new(addr, limiter, Duration::from_millis(200))
    }

    fn request_from(ip: &str) -> Request<Body> {
        let mut request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let peer: SocketAddr = format!("{ip}:40000").parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(peer));
        request
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_allowed_request_has_headers() {
        let app = create_test_server(Arc::new(MemoryStore::new())).router();

        let response = app.oneshot(request_from("192.0.2.1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[REMAINING_HEADER], "1");
        assert!(response.headers().contains_key(RESET_HEADER));
        let body = json_body(response).await;
        assert_eq!(body["message"], "Hello, world! You are not rate limited.");
    }

    #[tokio::test]
    async fn test_over_limit_returns_429() {
        let app = create_test_server(Arc::new(MemoryStore::new())).router();

        for _ in 0..2 {
            let response = app.clone().oneshot(request_from("192.0.2.2")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(request_from("192.0.2.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(!response.headers().contains_key(REMAINING_HEADER));
        let body = json_body(response).await;
        assert_eq!(body["error"], BLOCKED_MESSAGE);
        let block_until = body["block_until"].as_str().unwrap();
        let block_until = DateTime::parse_from_rfc3339(block_until).unwrap();
        assert!(block_until.with_timezone(&Utc) > Utc::now());

        // Another caller is unaffected
        let response = app.oneshot(request_from("192.0.2.3")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_token_uses_token_policy() {
        let app = create_test_server(Arc::new(MemoryStore::new())).router();

        let request = Request::builder()
            .uri("/")
            .header(API_KEY_HEADER, "secret-token")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[REMAINING_HEADER], "2");
    }

    #[tokio::test]
    async fn test_unidentifiable_request_is_400() {
        let app = create_test_server(Arc::new(MemoryStore::new())).router();

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    struct UnreachableStore;

    #[async_trait]
    impl CounterStore for UnreachableStore {
        async fn get_count(&self, _: &str, _: LimitClass) -> StoreResult<u64> {
            Err(StoreError::Connection("refused".into()))
        }

        async fn increment_count(&self, _: &str, _: LimitClass, _: Duration) -> StoreResult<u64> {
            Err(StoreError::Connection("refused".into()))
        }

        async fn set_blocked(&self, _: &str, _: LimitClass, _: DateTime<Utc>) -> StoreResult<()> {
            Err(StoreError::Connection("refused".into()))
        }

        async fn is_blocked(&self, _: &str, _: LimitClass) -> StoreResult<Option<DateTime<Utc>>> {
            Err(StoreError::Connection("refused".into()))
        }

        async fn get_block_until(&self, _: &str, _: LimitClass) -> StoreResult<Option<DateTime<Utc>>> {
            Err(StoreError::Connection("refused".into()))
        }

        async fn close(&self) -> StoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_store_failure_is_500_not_429() {
        let app = create_test_server(Arc::new(UnreachableStore)).router();

        let response = app.oneshot(request_from("192.0.2.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], "internal server error");
    }

    #[test]
    fn test_server_creation() {
        let _server = create_test_server(Arc::new(MemoryStore::new()));
    }
}

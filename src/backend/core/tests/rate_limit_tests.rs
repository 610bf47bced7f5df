//! Integration tests for the rate limiting middleware.
//!
//! Tests cover, over the full tower stack:
//! - Quota headers on admitted and rejected responses
//! - The 429 response body shape
//! - Whitelist bypass
//! - Key strategies (per-endpoint vs per-client budgets)
//! - Admission refunds (skip-successful / skip-failed)
//! - Fail-open behavior under a broken counter store

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use tower::ServiceExt;

use common::FailingStore;
use driftbox_core::middleware::{
    KeyStrategy, RateLimitConfig, RateLimitLayer, SlidingWindowLimiter,
};
use driftbox_core::store::{CounterStore, MemoryStore};

fn app_with_store(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Router {
    let limiter = Arc::new(SlidingWindowLimiter::new(store));
    Router::new()
        .route("/files", get(|| async { "ok" }))
        .route("/logs", get(|| async { "ok" }))
        .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .layer(RateLimitLayer::new(limiter, config))
}

fn app(config: RateLimitConfig) -> Router {
    app_with_store(Arc::new(MemoryStore::new()), config)
}

fn request(path: &str, ip: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("x-real-ip", ip)
        .body(Body::empty())
        .unwrap()
}

fn header_i64(response: &axum::response::Response, name: &str) -> i64 {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing header {}", name))
        .to_str()
        .unwrap()
        .parse()
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn quota_headers_on_admitted_response() {
    let app = app(RateLimitConfig::builder().max_requests(3).build());

    let response = app.oneshot(request("/files", "1.1.1.1")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_i64(&response, "x-ratelimit-limit"), 3);
    assert_eq!(header_i64(&response, "x-ratelimit-remaining"), 2);
    assert!(header_i64(&response, "x-ratelimit-reset") >= 0);
}

#[tokio::test]
async fn exceeding_the_limit_returns_429_with_structured_body() {
    let app = app(
        RateLimitConfig::builder()
            .max_requests(1)
            .window_ms(60_000)
            .message("slow down")
            .build(),
    );

    let first = app
        .clone()
        .oneshot(request("/files", "1.1.1.1"))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let denied = app.oneshot(request("/files", "1.1.1.1")).await.unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_i64(&denied, "x-ratelimit-remaining"), 0);
    assert!(header_i64(&denied, "retry-after") >= 1);

    let body = body_json(denied).await;
    assert_eq!(body["error"], "Too Many Requests");
    assert_eq!(body["message"], "slow down");
    assert!(body["retryAfter"].is_number());
}

#[tokio::test]
async fn window_slides_in_real_time() {
    let app = app(
        RateLimitConfig::builder()
            .max_requests(1)
            .window_ms(200)
            .build(),
    );

    let first = app
        .clone()
        .oneshot(request("/files", "1.1.1.1"))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let denied = app
        .clone()
        .oneshot(request("/files", "1.1.1.1"))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

    tokio::time::sleep(Duration::from_millis(250)).await;

    let readmitted = app.oneshot(request("/files", "1.1.1.1")).await.unwrap();
    assert_eq!(readmitted.status(), StatusCode::OK);
}

#[tokio::test]
async fn whitelisted_clients_bypass_entirely() {
    let app = app(
        RateLimitConfig::builder()
            .max_requests(1)
            .whitelist(vec!["9.9.9.9".to_string()])
            .build(),
    );

    for _ in 0..5 {
        let response = app
            .clone()
            .oneshot(request("/files", "9.9.9.9"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        // Bypassed requests carry no quota headers.
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
}

#[tokio::test]
async fn budgets_are_separate_per_client() {
    let app = app(RateLimitConfig::builder().max_requests(1).build());

    let ok = app
        .clone()
        .oneshot(request("/files", "1.1.1.1"))
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);

    let denied = app
        .clone()
        .oneshot(request("/files", "1.1.1.1"))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

    let other_client = app.oneshot(request("/files", "2.2.2.2")).await.unwrap();
    assert_eq!(other_client.status(), StatusCode::OK);
}

#[tokio::test]
async fn default_strategy_budgets_per_endpoint() {
    let app = app(RateLimitConfig::builder().max_requests(1).build());

    let files = app
        .clone()
        .oneshot(request("/files", "1.1.1.1"))
        .await
        .unwrap();
    assert_eq!(files.status(), StatusCode::OK);

    // A different path has its own budget under IpAndPath.
    let logs = app.oneshot(request("/logs", "1.1.1.1")).await.unwrap();
    assert_eq!(logs.status(), StatusCode::OK);
}

#[tokio::test]
async fn ip_only_strategy_shares_budget_across_endpoints() {
    let app = app(
        RateLimitConfig::builder()
            .max_requests(1)
            .key_strategy(KeyStrategy::IpOnly)
            .build(),
    );

    let files = app
        .clone()
        .oneshot(request("/files", "1.1.1.1"))
        .await
        .unwrap();
    assert_eq!(files.status(), StatusCode::OK);

    let logs = app.oneshot(request("/logs", "1.1.1.1")).await.unwrap();
    assert_eq!(logs.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn successful_requests_are_refunded_when_configured() {
    let app = app(
        RateLimitConfig::builder()
            .max_requests(1)
            .window_ms(60_000)
            .skip_successful_requests(true)
            .build(),
    );

    // Every 2xx admission is rolled back, so a budget of one request
    // admits an arbitrary sequence of successes.
    for _ in 0..4 {
        let response = app
            .clone()
            .oneshot(request("/files", "1.1.1.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn failed_requests_are_refunded_when_configured() {
    let app = app(
        RateLimitConfig::builder()
            .max_requests(1)
            .window_ms(60_000)
            .skip_failed_requests(true)
            .build(),
    );

    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(request("/broken", "1.1.1.1"))
            .await
            .unwrap();
        // The handler's 500 comes through, never a 429: each failed
        // response refunds its admission.
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    // Successful requests still consume the budget.
    let ok = app
        .clone()
        .oneshot(request("/files", "1.1.1.1"))
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);

    let denied = app.oneshot(request("/broken", "1.1.1.1")).await.unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn custom_denied_handler_replaces_default_response() {
    let app = app(
        RateLimitConfig::builder()
            .max_requests(1)
            .handler(Arc::new(|_admission| {
                (StatusCode::SERVICE_UNAVAILABLE, "come back later").into_response()
            }))
            .build(),
    );

    let _ = app
        .clone()
        .oneshot(request("/files", "1.1.1.1"))
        .await
        .unwrap();
    let denied = app.oneshot(request("/files", "1.1.1.1")).await.unwrap();

    assert_eq!(denied.status(), StatusCode::SERVICE_UNAVAILABLE);
    // Standard headers still apply to the custom response.
    assert_eq!(header_i64(&denied, "x-ratelimit-remaining"), 0);
}

#[tokio::test]
async fn headers_can_be_disabled() {
    let app = app(
        RateLimitConfig::builder()
            .max_requests(3)
            .standard_headers(false)
            .build(),
    );

    let response = app.oneshot(request("/files", "1.1.1.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-ratelimit-limit").is_none());
}

#[tokio::test]
async fn broken_store_fails_open() {
    let app = app_with_store(
        Arc::new(FailingStore),
        RateLimitConfig::builder().max_requests(1).build(),
    );

    for _ in 0..5 {
        let response = app
            .clone()
            .oneshot(request("/files", "1.1.1.1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

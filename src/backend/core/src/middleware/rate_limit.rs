//! Sliding-window rate limiting middleware.
//!
//! Features:
//! - Sliding window admission control (trailing interval, not fixed
//!   clock buckets) backed by the shared counter store
//! - Per-client identifiers: IP + path, IP only, prefixed composites,
//!   or a caller-supplied key function
//! - Whitelist bypass for trusted clients
//! - Standard X-RateLimit headers and a structured 429 body
//! - Admission rollback: successful and/or failed responses can be
//!   refunded so they do not count against quota
//! - Fail-open when the counter store is unreachable
//!
//! # Example
//!
//! ```rust,ignore
//! use driftbox_core::middleware::{RateLimitConfig, RateLimitLayer, SlidingWindowLimiter};
//!
//! let limiter = Arc::new(SlidingWindowLimiter::new(store));
//! let config = RateLimitConfig::builder()
//!     .max_requests(100)
//!     .window_ms(60_000)
//!     .skip_successful_requests(true)
//!     .build();
//!
//! let app = Router::new()
//!     .route("/api/files", get(list_files))
//!     .layer(RateLimitLayer::new(limiter, config));
//! ```

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use futures::future::BoxFuture;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::SocketAddr,
    sync::Arc,
    task::{Context, Poll},
};
use tower::{Layer, Service};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RateLimitSettings;
use crate::error::Result;
use crate::store::CounterStore;

/// Rollback records must outlive the downstream handler, and nothing more.
const ROLLBACK_TTL_SECS: u64 = 60;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Response builder invoked instead of the default 429 body.
pub type DeniedHandler = Arc<dyn Fn(&Admission) -> Response + Send + Sync>;

/// How the per-client identifier is derived from a request.
#[derive(Clone)]
pub enum KeyStrategy {
    /// `{ip}:{path}`: separate budgets per endpoint (default)
    IpAndPath,
    /// `{ip}`: one budget across all endpoints
    IpOnly,
    /// `{prefix}:{ip}`: shared budget for a class of endpoints
    Prefixed(String),
    /// Caller-supplied key function
    Custom(Arc<dyn Fn(&Request<Body>) -> String + Send + Sync>),
}

impl KeyStrategy {
    fn resolve(&self, ip: &str, request: &Request<Body>) -> String {
        match self {
            Self::IpAndPath => format!("{}:{}", ip, request.uri().path()),
            Self::IpOnly => ip.to_string(),
            Self::Prefixed(prefix) => format!("{}:{}", prefix, ip),
            Self::Custom(f) => f(request),
        }
    }
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IpAndPath => write!(f, "IpAndPath"),
            Self::IpOnly => write!(f, "IpOnly"),
            Self::Prefixed(prefix) => write!(f, "Prefixed({:?})", prefix),
            Self::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Rate limiting configuration.
#[derive(Clone)]
pub struct RateLimitConfig {
    /// Sliding window size in milliseconds
    pub window_ms: u64,

    /// Maximum admitted requests per window
    pub max_requests: u32,

    /// Identifier derivation strategy
    pub key_strategy: KeyStrategy,

    /// Refund admissions for responses with status < 400
    pub skip_successful_requests: bool,

    /// Refund admissions for responses with status >= 400
    pub skip_failed_requests: bool,

    /// Client identities exempt from rate limiting
    pub whitelist: Vec<String>,

    /// Emit X-RateLimit-* headers
    pub standard_headers: bool,

    /// Message included in the 429 body
    pub message: String,

    /// Custom denied-response builder; replaces the default 429 body
    pub handler: Option<DeniedHandler>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 100,
            key_strategy: KeyStrategy::IpAndPath,
            skip_successful_requests: false,
            skip_failed_requests: false,
            whitelist: Vec::new(),
            standard_headers: true,
            message: "Too many requests, please try again later.".to_string(),
            handler: None,
        }
    }
}

impl fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("window_ms", &self.window_ms)
            .field("max_requests", &self.max_requests)
            .field("key_strategy", &self.key_strategy)
            .field("skip_successful_requests", &self.skip_successful_requests)
            .field("skip_failed_requests", &self.skip_failed_requests)
            .field("whitelist", &self.whitelist)
            .field("standard_headers", &self.standard_headers)
            .field("message", &self.message)
            .field("handler", &self.handler.as_ref().map(|_| ".."))
            .finish()
    }
}

impl RateLimitConfig {
    /// Create a new builder for rate limit configuration.
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }

    /// Create a configuration from the application settings.
    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self {
            window_ms: settings.window_ms,
            max_requests: settings.max_requests,
            whitelist: settings.whitelist.clone(),
            ..Default::default()
        }
    }

    fn refunds_any(&self) -> bool {
        self.skip_successful_requests || self.skip_failed_requests
    }
}

/// Builder for rate limit configuration.
#[derive(Debug, Default)]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    pub fn window_ms(mut self, window_ms: u64) -> Self {
        self.config.window_ms = window_ms;
        self
    }

    pub fn max_requests(mut self, max_requests: u32) -> Self {
        self.config.max_requests = max_requests;
        self
    }

    pub fn key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.config.key_strategy = strategy;
        self
    }

    pub fn skip_successful_requests(mut self, skip: bool) -> Self {
        self.config.skip_successful_requests = skip;
        self
    }

    pub fn skip_failed_requests(mut self, skip: bool) -> Self {
        self.config.skip_failed_requests = skip;
        self
    }

    pub fn whitelist(mut self, whitelist: Vec<String>) -> Self {
        self.config.whitelist = whitelist;
        self
    }

    pub fn standard_headers(mut self, enabled: bool) -> Self {
        self.config.standard_headers = enabled;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.config.message = message.into();
        self
    }

    pub fn handler(mut self, handler: DeniedHandler) -> Self {
        self.config.handler = Some(handler);
        self
    }

    pub fn build(self) -> RateLimitConfig {
        self.config
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Admission Result
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of a rate limit check.
#[derive(Debug, Clone)]
pub struct Admission {
    /// Whether the request is allowed
    pub allowed: bool,

    /// Configured limit
    pub limit: u32,

    /// Remaining requests in the current window
    pub remaining: u32,

    /// Epoch milliseconds at which the window frees a slot
    pub reset_at_ms: i64,

    /// Token identifying this admission in the window set, present only
    /// when a record was actually written (needed for rollback)
    pub member_id: Option<String>,
}

impl Admission {
    /// Whole seconds until the window resets, rounded up, never negative.
    pub fn seconds_until_reset(&self, now_ms: i64) -> i64 {
        ((self.reset_at_ms - now_ms).max(0) + 999) / 1000
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sliding Window Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// A provisional admission that may be refunded once the response
/// outcome is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRecord {
    pub identifier: String,
    pub member_id: String,
    pub admitted_at_ms: i64,
}

/// Sliding-window admission control backed by the shared counter store.
///
/// Each identifier owns a score-ordered set of admission timestamps;
/// the count of members inside the trailing window decides admission.
/// The remove-expired / count / insert sequence is not transactional:
/// concurrent requests near the quota boundary can over-admit slightly,
/// which the window corrects as it slides.
pub struct SlidingWindowLimiter {
    store: Arc<dyn CounterStore>,
}

impl SlidingWindowLimiter {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    /// Check whether a request for `identifier` is admitted.
    ///
    /// Fails open: a store error admits the request with a full
    /// remaining quota and no member id, since nothing was recorded.
    pub async fn check(&self, identifier: &str, max_requests: u32, window_ms: u64) -> Admission {
        let now_ms = Utc::now().timestamp_millis();
        match self.admit(identifier, max_requests, window_ms, now_ms).await {
            Ok(admission) => {
                counter!(
                    "rate_limit_checks_total",
                    "backend" => self.store.name(),
                    "allowed" => if admission.allowed { "true" } else { "false" }
                )
                .increment(1);
                admission
            }
            Err(e) => {
                warn!(identifier, error = %e, "Rate limit check failed, failing open");
                counter!(
                    "rate_limit_checks_total",
                    "backend" => self.store.name(),
                    "allowed" => "fail_open"
                )
                .increment(1);
                Admission {
                    allowed: true,
                    limit: max_requests,
                    remaining: max_requests,
                    reset_at_ms: now_ms + window_ms as i64,
                    member_id: None,
                }
            }
        }
    }

    /// The admission decision at an explicit instant.
    ///
    /// The window is the half-open interval `(now - window_ms, now]`:
    /// a member whose timestamp equals the window start is expired.
    async fn admit(
        &self,
        identifier: &str,
        max_requests: u32,
        window_ms: u64,
        now_ms: i64,
    ) -> Result<Admission> {
        let key = window_key(identifier);
        let window_start = now_ms - window_ms as i64;

        self.store.zrembyscore(&key, 0, window_start).await?;
        let count = self.store.zcard(&key).await?;

        if count < max_requests as u64 {
            let member_id = format!("{}-{}", now_ms, member_suffix());
            self.store.zadd(&key, &member_id, now_ms).await?;
            self.store
                .expire(&key, window_ms.div_ceil(1000) as i64 + 1)
                .await?;

            return Ok(Admission {
                allowed: true,
                limit: max_requests,
                remaining: max_requests - count as u32 - 1,
                reset_at_ms: now_ms + window_ms as i64,
                member_id: Some(member_id),
            });
        }

        // Denied: derive the reset from the oldest surviving admission
        // so callers get an accurate retry-after.
        let oldest = self.store.zrange_withscores(&key, 0, 0).await?;
        let reset_at_ms = oldest
            .first()
            .map(|(_, score)| score + window_ms as i64)
            .unwrap_or(now_ms + window_ms as i64);

        Ok(Admission {
            allowed: false,
            limit: max_requests,
            remaining: 0,
            reset_at_ms,
            member_id: None,
        })
    }

    /// Remove a specific admission from an identifier's window.
    pub async fn rollback(&self, identifier: &str, member_id: &str) -> Result<bool> {
        let removed = self.store.zrem(&window_key(identifier), member_id).await?;
        Ok(removed > 0)
    }

    /// Persist a rollback record under a request-scoped token.
    pub async fn stash_rollback(&self, token: &str, record: &RollbackRecord) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        self.store
            .set_ex(&rollback_key(token), &raw, ROLLBACK_TTL_SECS)
            .await
    }

    /// Consume a rollback record, undoing the admission if `refund` is set.
    ///
    /// Best-effort: a failed rollback only over-counts the caller,
    /// never under-counts, so errors are logged and swallowed.
    pub async fn settle_rollback(&self, token: &str, refund: bool) {
        let key = rollback_key(token);

        if refund {
            match self.store.get(&key).await {
                Ok(Some(raw)) => match serde_json::from_str::<RollbackRecord>(&raw) {
                    Ok(record) => {
                        match self.rollback(&record.identifier, &record.member_id).await {
                            Ok(removed) => {
                                counter!("rate_limit_rollbacks_total").increment(1);
                                debug!(
                                    identifier = %record.identifier,
                                    member_id = %record.member_id,
                                    removed,
                                    "Refunded admission"
                                );
                            }
                            Err(e) => {
                                warn!(identifier = %record.identifier, error = %e, "Admission rollback failed")
                            }
                        }
                    }
                    Err(e) => warn!(token, error = %e, "Undecodable rollback record"),
                },
                Ok(None) => {}
                Err(e) => warn!(token, error = %e, "Rollback record lookup failed"),
            }
        }

        if let Err(e) = self.store.del(&[key]).await {
            warn!(token, error = %e, "Rollback record cleanup failed");
        }
    }
}

fn window_key(identifier: &str) -> String {
    format!("rate_limit:{}", identifier)
}

fn rollback_key(token: &str) -> String {
    format!("rate_limit:rollback:{}", token)
}

/// Random suffix distinguishing admissions recorded in the same millisecond.
fn member_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client IP Extraction
// ═══════════════════════════════════════════════════════════════════════════════

/// Proxy headers consulted for the client IP, in priority order.
const CLIENT_IP_HEADERS: [&str; 6] = [
    "cf-connecting-ip",
    "x-real-ip",
    "x-forwarded-for",
    "x-client-ip",
    "true-client-ip",
    "x-cluster-client-ip",
];

/// Extract the client IP from proxy headers and connection info.
pub fn client_ip(headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> String {
    for name in CLIENT_IP_HEADERS {
        if let Some(value) = headers.get(name) {
            if let Ok(s) = value.to_str() {
                // X-Forwarded-For can list multiple hops; only the
                // first is the client.
                let candidate = s.split(',').next().unwrap_or(s).trim();
                if !candidate.is_empty() {
                    return candidate.to_string();
                }
            }
        }
    }

    remote_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer and Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Rate limiting layer for Tower.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<SlidingWindowLimiter>,
    config: Arc<RateLimitConfig>,
}

impl RateLimitLayer {
    /// Create a new rate limit layer.
    pub fn new(limiter: Arc<SlidingWindowLimiter>, config: RateLimitConfig) -> Self {
        Self {
            limiter,
            config: Arc::new(config),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            config: self.config.clone(),
        }
    }
}

/// Rate limiting service.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<SlidingWindowLimiter>,
    config: Arc<RateLimitConfig>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        let config = self.config.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let remote_addr = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0);
            let ip = client_ip(request.headers(), remote_addr);

            if config.whitelist.iter().any(|entry| entry == &ip) {
                counter!("rate_limit_bypass_total").increment(1);
                return inner.call(request).await;
            }

            let identifier = config.key_strategy.resolve(&ip, &request);
            let admission = limiter
                .check(&identifier, config.max_requests, config.window_ms)
                .await;
            let now_ms = Utc::now().timestamp_millis();

            if !admission.allowed {
                counter!("rate_limit_rejected_total").increment(1);
                debug!(identifier = %identifier, "Request rejected by rate limiter");

                let retry_after = admission.seconds_until_reset(now_ms);
                let mut response = match &config.handler {
                    Some(handler) => handler(&admission),
                    None => denied_response(&config.message, retry_after),
                };
                if config.standard_headers {
                    apply_quota_headers(response.headers_mut(), &admission, now_ms);
                    response
                        .headers_mut()
                        .insert("Retry-After", HeaderValue::from(retry_after));
                }
                return Ok(response);
            }

            // Provisional admissions that may be refunded are recorded
            // under a request-scoped token before downstream runs.
            let rollback_token = match (&admission.member_id, config.refunds_any()) {
                (Some(member_id), true) => {
                    let token = Uuid::new_v4().to_string();
                    let record = RollbackRecord {
                        identifier: identifier.clone(),
                        member_id: member_id.clone(),
                        admitted_at_ms: now_ms,
                    };
                    match limiter.stash_rollback(&token, &record).await {
                        Ok(()) => Some(token),
                        Err(e) => {
                            warn!(identifier = %identifier, error = %e, "Failed to record provisional admission");
                            None
                        }
                    }
                }
                _ => None,
            };

            let mut response = inner.call(request).await?;

            if config.standard_headers {
                apply_quota_headers(response.headers_mut(), &admission, now_ms);
            }

            if let Some(token) = rollback_token {
                let status = response.status().as_u16();
                let refund = (config.skip_successful_requests && status < 400)
                    || (config.skip_failed_requests && status >= 400);
                limiter.settle_rollback(&token, refund).await;
            }

            Ok(response)
        })
    }
}

/// Set the standard quota headers. Reset values are seconds until the
/// window resets, not absolute timestamps.
fn apply_quota_headers(headers: &mut HeaderMap, admission: &Admission, now_ms: i64) {
    headers.insert("X-RateLimit-Limit", HeaderValue::from(admission.limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(admission.remaining));
    headers.insert(
        "X-RateLimit-Reset",
        HeaderValue::from(admission.seconds_until_reset(now_ms)),
    );
}

/// The default 429 response.
fn denied_response(message: &str, retry_after_secs: i64) -> Response {
    let body = serde_json::json!({
        "error": "Too Many Requests",
        "message": message,
        "retryAfter": retry_after_secs,
    });
    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

//! Distributed per-route rate limiting
//!
//! Every instance counts admissions in the shared cache store, so the limit
//! holds across the whole fleet. Each `(route, client)` pair gets a fixed
//! window counter keyed by the window index; the counter is created with an
//! expiry, so idle clients need no cleanup.
//!
//! If the counter store cannot be reached the request is admitted and the
//! failure is logged.

use crate::cache::CacheStore;
use crate::common::metrics::METRICS;
use crate::common::utils::{host_of, timestamp_now_millis};
use crate::common::{Error, Result};
use axum::{
    body::Body,
    extract::{ConnectInfo, MatchedPath, State},
    http::{HeaderMap, HeaderValue, Request, Response, StatusCode},
    middleware::Next,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Header set by CDNs / WAFs in front of the service
pub const TRUE_CLIENT_IP: &str = "true-client-ip";
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// When false the limiter admits everything
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Requests per window for routes without an override (0 = unlimited)
    #[serde(rename = "default", default = "default_limit")]
    pub default_limit: u32,

    /// Window length in seconds
    #[serde(default = "default_window")]
    pub window_secs: u64,

    /// Route template (e.g. `/api/v1/users/:id`) -> requests per window
    #[serde(default)]
    pub routes: HashMap<String, u32>,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_enabled() -> bool {
    true
}
fn default_limit() -> u32 {
    100
}
fn default_window() -> u64 {
    60
}
fn default_key_prefix() -> String {
    "limit".to_string()
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            default_limit: default_limit(),
            window_secs: default_window(),
            routes: HashMap::new(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl RateLimitConfig {
    /// Effective limit for `route`: its override if configured, else the default
    pub fn limit_for(&self, route: &str) -> u32 {
        self.routes
            .get(route)
            .copied()
            .unwrap_or(self.default_limit)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_secs == 0 {
            return Err(Error::InvalidConfig(
                "rate_limit.window_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Request is allowed; `limit == 0` means the route is unlimited
    Allowed { remaining: u32, limit: u32 },
    /// Request is rate limited until the current window ends
    Limited { retry_after: Duration, limit: u32 },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

/// Shared rate limiter state
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CacheStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CacheStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admission decision for one request
    pub async fn allow(&self, route: &str, client: &str) -> bool {
        self.check(route, client).await.is_allowed()
    }

    pub async fn check(&self, route: &str, client: &str) -> RateLimitResult {
        self.check_at(route, client, timestamp_now_millis()).await
    }

    /// Check against the window containing `now_ms` (Unix millis)
    pub async fn check_at(&self, route: &str, client: &str, now_ms: u64) -> RateLimitResult {
        let limit = self.config.limit_for(route);
        if !self.config.enabled || limit == 0 {
            return RateLimitResult::Allowed {
                remaining: limit,
                limit,
            };
        }

        let window_ms = self.config.window_secs.max(1) * 1000;
        let window_idx = now_ms / window_ms;
        let key = format!(
            "{}:{}:{}:{}",
            self.config.key_prefix, route, client, window_idx
        );

        match self.store.incr_with_expiry(&key, self.config.window()).await {
            Ok(count) if count <= u64::from(limit) => {
                METRICS.ratelimit_allowed.inc();
                RateLimitResult::Allowed {
                    remaining: limit - count as u32,
                    limit,
                }
            }
            Ok(count) => {
                METRICS.ratelimit_rejected.inc();
                tracing::debug!(route = %route, client = %client, count, limit, "Rate limited");
                RateLimitResult::Limited {
                    retry_after: Duration::from_millis(window_ms - now_ms % window_ms),
                    limit,
                }
            }
            Err(e) => {
                METRICS.ratelimit_fail_open.inc();
                tracing::warn!(
                    route = %route,
                    client = %client,
                    error = %e,
                    "Rate limit store unavailable, admitting request"
                );
                RateLimitResult::Allowed {
                    remaining: limit,
                    limit,
                }
            }
        }
    }
}

/// Client identity: `True-Client-IP`, then the first `X-Forwarded-For` hop,
/// then the connection's address. The first non-empty signal wins.
pub fn client_identity(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(ip) = header(TRUE_CLIENT_IP) {
        return ip.to_string();
    }
    if let Some(first) = header(FORWARDED_FOR)
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
    {
        return host_of(first).to_string();
    }
    match remote {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

/// Whole seconds until the window ends, rounded up
fn retry_after_secs(retry_after: Duration) -> u64 {
    let millis = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
    millis.div_ceil(1000).max(1)
}

/// Axum middleware: rejects with `429` once the route's window is exhausted
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_identity(request.headers(), remote);
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    match limiter.check(&route, &client).await {
        RateLimitResult::Allowed { remaining, limit } => {
            let mut response = next.run(request).await;
            if limit > 0 {
                let headers = response.headers_mut();
                headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
                headers.insert("X-RateLimit-Remaining", HeaderValue::from(remaining));
            }
            response
        }
        RateLimitResult::Limited { retry_after, limit } => {
            let mut response = Response::new(Body::from("Too Many Requests"));
            *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;

            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u32));
            headers.insert("Retry-After", HeaderValue::from(retry_after_secs(retry_after)));
            response
        }
    }
}

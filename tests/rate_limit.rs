//! Distributed rate limiting: windows, overrides, fail-open, HTTP surface

use axum::{
    body::Body, extract::Path, http::Request, http::StatusCode, middleware, routing::get, Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;
use usermesh::cache::MemoryCacheStore;
use usermesh::common::ratelimit::rate_limit_middleware;
use usermesh::common::{RateLimitConfig, RateLimitResult, RateLimiter};

const NOW: u64 = 1_700_000_000_000;

fn config(default_limit: u32, routes: &[(&str, u32)]) -> RateLimitConfig {
    RateLimitConfig {
        default_limit,
        routes: routes
            .iter()
            .map(|(r, l)| (r.to_string(), *l))
            .collect::<HashMap<_, _>>(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_limit_plus_one_rejected_then_next_window() {
    let limiter = RateLimiter::new(Arc::new(MemoryCacheStore::new()), config(5, &[]));
    let window_start = NOW - NOW % 60_000;

    for _ in 0..5 {
        assert!(limiter.check_at("/api/v1/users/1", "203.0.113.5", window_start).await.is_allowed());
    }
    assert!(!limiter
        .check_at("/api/v1/users/1", "203.0.113.5", window_start + 59_000)
        .await
        .is_allowed());

    // other clients and routes have their own counters
    assert!(limiter.check_at("/api/v1/users/1", "198.51.100.7", window_start).await.is_allowed());
    assert!(limiter.check_at("/api/v1/login", "203.0.113.5", window_start).await.is_allowed());

    assert!(limiter
        .check_at("/api/v1/users/1", "203.0.113.5", window_start + 60_000)
        .await
        .is_allowed());
}

#[tokio::test]
async fn test_shared_store_limits_across_instances() {
    let store = Arc::new(MemoryCacheStore::new());
    let a = RateLimiter::new(store.clone(), config(4, &[]));
    let b = RateLimiter::new(store, config(4, &[]));

    let mut admitted = 0;
    for i in 0..10 {
        let limiter = if i % 2 == 0 { &a } else { &b };
        if limiter.check_at("/login", "c", NOW).await.is_allowed() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 4);
}

#[tokio::test]
async fn test_route_override_and_disabled() {
    let limiter = RateLimiter::new(
        Arc::new(MemoryCacheStore::new()),
        config(100, &[("/api/v1/login", 2)]),
    );
    assert!(limiter.check_at("/api/v1/login", "c", NOW).await.is_allowed());
    assert!(limiter.check_at("/api/v1/login", "c", NOW).await.is_allowed());
    match limiter.check_at("/api/v1/login", "c", NOW).await {
        RateLimitResult::Limited { limit, retry_after } => {
            assert_eq!(limit, 2);
            assert!(retry_after.as_millis() > 0);
        }
        other => panic!("expected limited, got {:?}", other),
    }

    let disabled = RateLimiter::new(
        Arc::new(MemoryCacheStore::new()),
        RateLimitConfig {
            enabled: false,
            ..config(1, &[])
        },
    );
    for _ in 0..10 {
        assert!(disabled.allow("/x", "c").await);
    }
}

#[tokio::test]
async fn test_fails_open_when_store_unreachable() {
    let store = Arc::new(MemoryCacheStore::new());
    store.set_available(false);
    let limiter = RateLimiter::new(store, config(1, &[]));
    for _ in 0..20 {
        assert!(limiter.allow("/api/v1/users/1", "c").await);
    }
}

fn app_with(limit: u32, routes: &[(&str, u32)]) -> Router {
    let limiter = Arc::new(RateLimiter::new(
        Arc::new(MemoryCacheStore::new()),
        config(limit, routes),
    ));
    Router::new()
        .route("/api/v1/ping", get(|| async { "pong" }))
        .route(
            "/api/v1/users/:id",
            get(|Path(id): Path<u64>| async move { id.to_string() }),
        )
        .route_layer(middleware::from_fn_with_state(limiter, rate_limit_middleware))
}

fn app(limit: u32) -> Router {
    app_with(limit, &[])
}

fn request(client: &str) -> Request<Body> {
    get_path("/api/v1/ping", client)
}

fn get_path(path: &str, client: &str) -> Request<Body> {
    Request::get(path)
        .header("X-Forwarded-For", client)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_middleware_headers_and_429() {
    let app = app(2);

    let first = app.clone().oneshot(request("203.0.113.5")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["X-RateLimit-Limit"], "2");
    assert_eq!(first.headers()["X-RateLimit-Remaining"], "1");

    let second = app.clone().oneshot(request("203.0.113.5")).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["X-RateLimit-Remaining"], "0");

    let third = app.clone().oneshot(request("203.0.113.5")).await.unwrap();
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(third.headers()["X-RateLimit-Remaining"], "0");
    let retry_after: u64 = third.headers()["Retry-After"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));

    // a different client is unaffected
    let other = app.oneshot(request("198.51.100.7")).await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_path_parameters_share_one_window() {
    let app = app_with(100, &[("/api/v1/users/:id", 3)]);

    let mut statuses = Vec::new();
    for id in 1..=6 {
        let response = app
            .clone()
            .oneshot(get_path(&format!("/api/v1/users/{}", id), "203.0.113.5"))
            .await
            .unwrap();
        statuses.push(response.status());
    }
    assert_eq!(
        statuses,
        vec![
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::OK,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::TOO_MANY_REQUESTS,
        ]
    );

    // the template override does not leak onto other routes
    let ping = app.oneshot(request("203.0.113.5")).await.unwrap();
    assert_eq!(ping.status(), StatusCode::OK);
    assert_eq!(ping.headers()["X-RateLimit-Limit"], "100");
}

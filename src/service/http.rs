//! HTTP surfaces
//!
//! Public API (rate limited, traced):
//! - `POST /api/v1/users`
//! - `GET  /api/v1/users/:id` (with `Cache-Control`)
//! - `PUT  /api/v1/users/:id/profile`
//! - `GET  /api/v1/users/:id/friends`
//! - `POST /api/v1/users/:id/friends`
//! - `GET  /health`, `GET /metrics`
//!
//! Internal RPC (served on the registered address):
//! - `GET /internal/v1/users/:id`
//! - `GET /internal/health`

use crate::common::metrics::METRICS;
use crate::common::ratelimit::rate_limit_middleware;
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::{Error, HttpCacheConfig, RateLimiter};
use crate::service::users::{ProfileUpdate, Registration, UserId, UserService};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub users: Arc<UserService>,
    pub node_id: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct AddFriendRequest {
    friend_id: UserId,
}

async fn register(
    State(state): State<AppState>,
    Json(registration): Json<Registration>,
) -> Result<impl IntoResponse, Error> {
    let user = state.users.register(registration).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
) -> Result<impl IntoResponse, Error> {
    let user = state.users.get_user(id).await?;
    Ok(Json(user))
}

async fn update_profile(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
    Json(update): Json<ProfileUpdate>,
) -> Result<impl IntoResponse, Error> {
    let user = state.users.update_profile(id, update).await?;
    Ok(Json(user))
}

async fn list_friends(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
) -> Result<impl IntoResponse, Error> {
    let friends = state.users.list_friends(id).await?;
    Ok(Json(json!({ "user_id": id, "friends": friends })))
}

async fn add_friend(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
    Json(req): Json<AddFriendRequest>,
) -> Result<impl IntoResponse, Error> {
    state.users.add_friend(id, req.friend_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "node_id": state.node_id,
        "version": crate::VERSION,
        "uptime_secs": METRICS.uptime_seconds(),
    }))
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.to_prometheus(),
    )
}

/// Marks successful GET responses cacheable per user: shared caches must key
/// on the caller's credentials.
async fn cache_control_middleware(
    State(cache_control): State<HeaderValue>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }
    let mut response = next.run(request).await;
    if response.status().is_success() {
        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, cache_control);
        headers.insert(header::VARY, HeaderValue::from_static("Authorization, Cookie"));
    }
    response
}

/// Public router. Only `/api` routes count against the rate limit.
pub fn public_router(
    state: AppState,
    limiter: Arc<RateLimiter>,
    http_cache: &HttpCacheConfig,
) -> Router {
    let cache_control = HeaderValue::from_str(&http_cache.header_value())
        .unwrap_or_else(|_| HeaderValue::from_static("no-cache"));
    let profile = Router::new()
        .route("/api/v1/users/:id", get(get_user))
        .route_layer(middleware::from_fn_with_state(
            cache_control,
            cache_control_middleware,
        ));

    let api = Router::new()
        .merge(profile)
        .route("/api/v1/users", post(register))
        .route("/api/v1/users/:id/profile", put(update_profile))
        .route(
            "/api/v1/users/:id/friends",
            get(list_friends).post(add_friend),
        )
        .route_layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));

    Router::new()
        .merge(api)
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn(request_tracing_middleware))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

/// Router for calls from other instances
pub fn internal_router(state: AppState) -> Router {
    Router::new()
        .route("/internal/v1/users/:id", get(get_user))
        .route("/internal/health", get(health))
        .layer(middleware::from_fn(request_tracing_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStore;
    use crate::common::RateLimitConfig;
    use crate::service::users::{MemoryUserStore, User};
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app() -> Router {
        let cache = Arc::new(MemoryCacheStore::new());
        let users = Arc::new(UserService::new(
            Arc::new(MemoryUserStore::new()),
            cache.clone(),
            Duration::from_secs(900),
            4,
        ));
        users.create_user(User::new(1, "ada", "ada@example.com")).await.unwrap();
        let limiter = Arc::new(RateLimiter::new(cache, RateLimitConfig::default()));
        public_router(
            AppState {
                users,
                node_id: "test".into(),
            },
            limiter,
            &HttpCacheConfig::default(),
        )
    }

    fn register_request(body: &'static str) -> Request<Body> {
        Request::post("/api/v1/users")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_get_user_and_not_found() {
        let app = app().await;
        let ok = app
            .clone()
            .oneshot(Request::get("/api/v1/users/1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(ok.headers()["X-RateLimit-Limit"], "100");
        assert!(ok.headers().contains_key("X-Request-ID"));

        let missing = app
            .oneshot(Request::get("/api/v1/users/2").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_not_rate_limited() {
        let app = app().await;
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!resp.headers().contains_key("X-RateLimit-Limit"));
    }

    #[tokio::test]
    async fn test_update_profile() {
        let app = app().await;
        let resp = app
            .oneshot(
                Request::put("/api/v1/users/1/profile")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"nickname":"countess","age":36}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let user: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(user["nickname"], "countess");
        assert_eq!(user["age"], 36);
    }

    #[tokio::test]
    async fn test_register_then_read() {
        let app = app().await;
        let created = app
            .clone()
            .oneshot(register_request(
                r#"{"name":"grace","email":"grace@example.com","password":"cobol"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let body = axum::body::to_bytes(created.into_body(), usize::MAX).await.unwrap();
        let user: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(user["status"], "active");
        assert!(user.get("password").is_none());
        assert!(user.get("password_hash").is_none());
        let id = user["id"].as_u64().unwrap();

        let fetched = app
            .clone()
            .oneshot(
                Request::get(format!("/api/v1/users/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(fetched.status(), StatusCode::OK);

        let duplicate = app
            .oneshot(register_request(
                r#"{"name":"grace","email":"grace@example.com","password":"again"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_profile_read_cache_headers() {
        let app = app().await;
        let ok = app
            .clone()
            .oneshot(Request::get("/api/v1/users/1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(
            ok.headers()[header::CACHE_CONTROL],
            "private, max-age=60, stale-while-revalidate=30"
        );
        assert_eq!(ok.headers()[header::VARY], "Authorization, Cookie");

        let missing = app
            .clone()
            .oneshot(Request::get("/api/v1/users/99").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(!missing.headers().contains_key(header::CACHE_CONTROL));

        let update = app
            .oneshot(
                Request::put("/api/v1/users/1/profile")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"age":37}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(update.status(), StatusCode::OK);
        assert!(!update.headers().contains_key(header::CACHE_CONTROL));
    }

    #[tokio::test]
    async fn test_rate_limit_keys_on_route_template() {
        let cache = Arc::new(MemoryCacheStore::new());
        let users = Arc::new(UserService::new(
            Arc::new(MemoryUserStore::new()),
            cache.clone(),
            Duration::from_secs(900),
            4,
        ));
        let config = RateLimitConfig {
            default_limit: 2,
            routes: [("/api/v1/users/:id".to_string(), 1)].into_iter().collect(),
            ..Default::default()
        };
        let app = public_router(
            AppState {
                users,
                node_id: "test".into(),
            },
            Arc::new(RateLimiter::new(cache, config)),
            &HttpCacheConfig::default(),
        );

        let mut statuses = Vec::new();
        for id in 1..=5 {
            let resp = app
                .clone()
                .oneshot(
                    Request::get(format!("/api/v1/users/{}", id))
                        .header("True-Client-IP", "1.2.3.4")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            statuses.push(resp.status());
        }
        assert_eq!(statuses[0], StatusCode::NOT_FOUND);
        assert!(statuses[1..]
            .iter()
            .all(|s| *s == StatusCode::TOO_MANY_REQUESTS));
    }
}

//! Admission middleware for axum routers.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::keys::{route_of, KeyPolicy};
use crate::config::RateLimitingConfig;
use crate::ratelimit::{Decision, LimiterSet, RateLimitInfo};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Shared state for [`admission_middleware`].
#[derive(Clone)]
pub struct AdmissionState {
    limiters: Arc<LimiterSet>,
    policy: KeyPolicy,
    skip_paths: Arc<HashSet<String>>,
}

impl AdmissionState {
    pub fn new(
        limiters: Arc<LimiterSet>,
        policy: KeyPolicy,
        skip_paths: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            limiters,
            policy,
            skip_paths: Arc::new(skip_paths.into_iter().collect()),
        }
    }

    /// Build the state from configuration, starting the limiters'
    /// reclaimers.
    pub fn from_config(config: &RateLimitingConfig) -> Self {
        Self::new(
            Arc::new(LimiterSet::from_config(config)),
            config.key_type.into(),
            config.skip_paths.iter().cloned(),
        )
    }

    pub fn limiters(&self) -> &Arc<LimiterSet> {
        &self.limiters
    }

    pub fn policy(&self) -> KeyPolicy {
        self.policy
    }

    fn is_exempt(&self, path: &str) -> bool {
        self.skip_paths.contains(path)
    }
}

/// Body returned with a 429 response.
#[derive(Debug, Serialize)]
pub struct RateLimitRejection {
    pub error: &'static str,
    pub message: String,
    pub retry_after: u64,
}

impl RateLimitRejection {
    pub fn new(retry_after: u64) -> Self {
        Self {
            error: "rate_limit_exceeded",
            message: format!(
                "Too many requests. Retry after {} seconds.",
                retry_after
            ),
            retry_after,
        }
    }
}

/// Rate limiting middleware.
///
/// Exempt paths and requests without a derivable key pass straight
/// through. Everything else is checked against the limiter for its route;
/// quota headers are attached to every checked response and denied
/// requests are answered with 429 without reaching the handler.
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    req: Request,
    next: Next,
) -> Response {
    if state.is_exempt(req.uri().path()) {
        return next.run(req).await;
    }

    let Some(key) = state.policy.derive(&req).filter(|key| !key.is_empty()) else {
        debug!(path = %req.uri().path(), policy = ?state.policy, "No rate limit key, skipping");
        return next.run(req).await;
    };

    let route = route_of(&req).to_string();
    let limiter = state.limiters.select(&route);
    let Decision { allowed, info } = limiter.allow(&key);

    trace!(
        key = %key,
        route = %route,
        scoped = state.limiters.has_route(&route),
        allowed = allowed,
        remaining = info.remaining,
        "Admission decision"
    );

    if !allowed {
        let retry_after = info.retry_after_secs(limiter.now());
        warn!(
            key = %key,
            route = %route,
            retry_after = retry_after,
            "Rate limit exceeded"
        );

        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(RateLimitRejection::new(retry_after)),
        )
            .into_response();
        let headers = response.headers_mut();
        insert_quota_headers(headers, &info);
        headers.insert(axum::http::header::RETRY_AFTER, HeaderValue::from(retry_after));
        return response;
    }

    let mut response = next.run(req).await;
    insert_quota_headers(response.headers_mut(), &info);
    response
}

fn insert_quota_headers(headers: &mut HeaderMap, info: &RateLimitInfo) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(info.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(info.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(info.reset_epoch_secs()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::AuthenticatedUser;
    use crate::ratelimit::{Limiter, ManualClock, SlidingWindowLimiter, TokenBucketLimiter};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::routing::get;
    use axum::Router;
    use http_body_util::BodyExt;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    const TTL: Duration = Duration::from_secs(600);

    fn app(state: AdmissionState) -> Router {
        Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/api/x", get(|| async { "x" }))
            .route("/api/login", get(|| async { "login" }))
            .layer(axum::middleware::from_fn_with_state(
                state,
                admission_middleware,
            ))
    }

    fn token_bucket_state(burst: u32, policy: KeyPolicy) -> AdmissionState {
        let limiter: Arc<dyn Limiter> = Arc::new(TokenBucketLimiter::with_clock(
            60,
            burst,
            TTL,
            Arc::new(ManualClock::default()),
        ));
        AdmissionState::new(
            Arc::new(LimiterSet::single(limiter)),
            policy,
            vec!["/health".to_string()],
        )
    }

    fn get_from(path: &str, ip: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(path)
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    fn header(response: &Response, name: &str) -> Option<String> {
        response
            .headers()
            .get(name)
            .map(|v| v.to_str().unwrap().to_string())
    }

    #[tokio::test]
    async fn test_allowed_request_carries_quota_headers() {
        let app = app(token_bucket_state(5, KeyPolicy::Ip));

        let response = app.oneshot(get_from("/api/x", "203.0.113.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-limit").as_deref(), Some("5"));
        assert_eq!(header(&response, "x-ratelimit-remaining").as_deref(), Some("4"));
        let reset: i64 = header(&response, "x-ratelimit-reset").unwrap().parse().unwrap();
        assert!(reset > 0);
        assert!(header(&response, "retry-after").is_none());
    }

    #[tokio::test]
    async fn test_denied_request_gets_429_and_body() {
        let app = app(token_bucket_state(2, KeyPolicy::Ip));

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(get_from("/api/x", "203.0.113.4"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.oneshot(get_from("/api/x", "203.0.113.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&response, "x-ratelimit-remaining").as_deref(), Some("0"));
        let retry_after: u64 = header(&response, "retry-after").unwrap().parse().unwrap();
        assert!(retry_after >= 1);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "rate_limit_exceeded");
        assert_eq!(json["retry_after"], retry_after);
        assert!(json["message"].as_str().unwrap().contains("Retry after"));
    }

    #[tokio::test]
    async fn test_denied_request_never_reaches_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new()
            .route(
                "/api/x",
                get(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        "x"
                    }
                }),
            )
            .layer(axum::middleware::from_fn_with_state(
                token_bucket_state(1, KeyPolicy::Ip),
                admission_middleware,
            ));

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(get_from("/api/x", "203.0.113.4"))
                .await
                .unwrap();
            statuses.push(response.status());
        }

        assert_eq!(
            statuses,
            vec![
                StatusCode::OK,
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::TOO_MANY_REQUESTS
            ]
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_after_uses_limiter_clock() {
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let limiter: Arc<dyn Limiter> =
            Arc::new(TokenBucketLimiter::with_clock(60, 1, TTL, clock.clone()));
        let state = AdmissionState::new(
            Arc::new(LimiterSet::single(limiter)),
            KeyPolicy::Ip,
            Vec::new(),
        );
        let app = app(state);

        let first = app.clone().oneshot(get_from("/api/x", "10.0.0.1")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        clock.advance(Duration::from_millis(500));
        let denied = app.oneshot(get_from("/api/x", "10.0.0.1")).await.unwrap();

        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header(&denied, "retry-after").as_deref(), Some("60"));
        let body = denied.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["retry_after"], 60);
    }

    #[tokio::test]
    async fn test_skip_paths_never_limited() {
        let app = app(token_bucket_state(1, KeyPolicy::Ip));

        for _ in 0..20 {
            let response = app
                .clone()
                .oneshot(get_from("/health", "203.0.113.4"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(header(&response, "x-ratelimit-limit").is_none());
        }

        let first = app
            .clone()
            .oneshot(get_from("/api/x", "203.0.113.4"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.oneshot(get_from("/api/x", "203.0.113.4")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_clients_limited_independently() {
        let app = app(token_bucket_state(1, KeyPolicy::Ip));

        let a = app.clone().oneshot(get_from("/api/x", "10.0.0.1")).await.unwrap();
        let a_again = app.clone().oneshot(get_from("/api/x", "10.0.0.1")).await.unwrap();
        let b = app.oneshot(get_from("/api/x", "10.0.0.2")).await.unwrap();

        assert_eq!(a.status(), StatusCode::OK);
        assert_eq!(a_again.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(b.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_request_without_key_is_not_limited() {
        let app = app(token_bucket_state(1, KeyPolicy::Ip));

        for _ in 0..5 {
            let req = HttpRequest::builder()
                .uri("/api/x")
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(req).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(header(&response, "x-ratelimit-limit").is_none());
        }
    }

    #[tokio::test]
    async fn test_user_policy_uses_authenticated_identity() {
        let app = app(token_bucket_state(1, KeyPolicy::User));

        let as_user = |id: &str, ip: &str| {
            let mut req = get_from("/api/x", ip);
            req.extensions_mut()
                .insert(AuthenticatedUser(id.to_string()));
            req
        };

        // Same user from two addresses shares one quota.
        let first = app.clone().oneshot(as_user("42", "10.0.0.1")).await.unwrap();
        let second = app.clone().oneshot(as_user("42", "10.0.0.2")).await.unwrap();
        let other_user = app.oneshot(as_user("7", "10.0.0.1")).await.unwrap();

        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(other_user.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_endpoint_limits_are_route_scoped() {
        let clock = Arc::new(ManualClock::default());
        let default: Arc<dyn Limiter> =
            Arc::new(TokenBucketLimiter::with_clock(60, 10, TTL, clock.clone()));
        let login: Arc<dyn Limiter> =
            Arc::new(TokenBucketLimiter::with_clock(60, 1, TTL, clock));
        let limiters = LimiterSet::new(
            default,
            HashMap::from([("/api/login".to_string(), login)]),
        );
        let state = AdmissionState::new(Arc::new(limiters), KeyPolicy::Endpoint, Vec::new());
        let app = app(state);

        let login_ok = app.clone().oneshot(get_from("/api/login", "10.0.0.1")).await.unwrap();
        let login_denied = app.clone().oneshot(get_from("/api/login", "10.0.0.1")).await.unwrap();
        let other = app.oneshot(get_from("/api/x", "10.0.0.1")).await.unwrap();

        assert_eq!(login_ok.status(), StatusCode::OK);
        assert_eq!(header(&login_ok, "x-ratelimit-limit").as_deref(), Some("1"));
        assert_eq!(login_denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(other.status(), StatusCode::OK);
        assert_eq!(header(&other, "x-ratelimit-limit").as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn test_sliding_window_behind_middleware() {
        let limiter: Arc<dyn Limiter> = Arc::new(SlidingWindowLimiter::new(
            3,
            Duration::from_secs(60),
            TTL,
        ));
        let state = AdmissionState::new(
            Arc::new(LimiterSet::single(limiter)),
            KeyPolicy::Ip,
            Vec::new(),
        );
        let app = app(state);

        for expected_remaining in ["2", "1", "0"] {
            let response = app
                .clone()
                .oneshot(get_from("/api/x", "10.0.0.1"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                header(&response, "x-ratelimit-remaining").as_deref(),
                Some(expected_remaining)
            );
        }

        let response = app.oneshot(get_from("/api/x", "10.0.0.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_concurrent_requests_admit_exactly_burst() {
        let app = app(token_bucket_state(5, KeyPolicy::Ip));

        let responses = futures::future::join_all(
            (0..30).map(|_| app.clone().oneshot(get_from("/api/x", "10.0.0.9"))),
        )
        .await;

        let ok = responses
            .into_iter()
            .map(|r| r.unwrap().status())
            .filter(|status| *status == StatusCode::OK)
            .count();
        assert_eq!(ok, 5);
    }
}

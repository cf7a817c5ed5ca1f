//! Axum middleware applying the throttle to inbound requests.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use tracing::info;

use super::client::{client_id, route_category};
use crate::throttle::{CategoryRule, Decision, RequestThrottle};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// State shared by the throttle middleware.
#[derive(Clone)]
pub struct BoundaryState {
    pub throttle: Arc<RequestThrottle>,
    /// Throttle non-API paths under the default category
    pub protect_all_paths: bool,
}

/// Wrap a router so that every request passes the throttle first.
pub fn throttled(router: Router, state: BoundaryState) -> Router {
    router.layer(middleware::from_fn_with_state(state, throttle_requests))
}

/// Throttle one request, either rejecting it or tagging the forwarded response.
pub async fn throttle_requests(
    State(state): State<BoundaryState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(category) = route_category(request.uri().path(), state.protect_all_paths) else {
        return next.run(request).await;
    };

    let client = client_id(request.headers());
    let rule = state.throttle.rule(category);

    match state.throttle.check(category, &client).await {
        Decision::Denied { retry_after_secs } => {
            info!(
                category = %category,
                client = %client,
                path = %request.uri().path(),
                retry_after_secs,
                "Request throttled"
            );
            let reset = state.throttle.clock().now().timestamp() as u64 + rule.window_secs;
            too_many_requests(&rule, retry_after_secs, reset)
        }
        Decision::Allowed { remaining } => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(rule.limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
            response
        }
    }
}

fn too_many_requests(rule: &CategoryRule, retry_after_secs: u64, reset: u64) -> Response {
    let headers = [
        (RETRY_AFTER, HeaderValue::from(retry_after_secs)),
        (X_RATELIMIT_LIMIT, HeaderValue::from(rule.limit)),
        (X_RATELIMIT_REMAINING, HeaderValue::from(0u64)),
        (X_RATELIMIT_RESET, HeaderValue::from(reset)),
    ];
    let body = Json(serde_json::json!({
        "error": "Too many requests",
        "retryAfter": retry_after_secs,
    }));

    (StatusCode::TOO_MANY_REQUESTS, headers, body).into_response()
}

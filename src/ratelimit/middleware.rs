//! Axum middleware enforcing a [`RateLimitPolicy`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use super::RateLimitPolicy;

pub static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Length of the API-key prefix used as a client identity.
const KEY_PREFIX_LEN: usize = 20;

/// Identify the caller: an API key prefix first, then the first hop of
/// `X-Forwarded-For`, then the transport peer address.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>, api_key_prefix: &str) -> String {
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if let Some(token) = bearer {
        if !api_key_prefix.is_empty() && token.starts_with(api_key_prefix) {
            let prefix: String = token.chars().take(KEY_PREFIX_LEN).collect();
            return format!("key:{prefix}");
        }
    }

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(first_hop) = forwarded {
        return first_hop.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn whole_secs(d: Duration) -> u64 {
    d.as_secs_f64().ceil() as u64
}

fn header_value(n: impl ToString) -> HeaderValue {
    // Decimal digits are always valid header bytes.
    HeaderValue::from_str(&n.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

/// Admit or reject a request, attaching `X-RateLimit-*` headers either way.
pub async fn rate_limit_middleware(
    State(policy): State<Arc<RateLimitPolicy>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if !policy.is_enabled() || policy.is_exempt(&path) {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_id = client_identity(request.headers(), peer, policy.api_key_prefix());
    let limiter = policy.limiter_for(&path);
    let decision = limiter.is_allowed(&client_id).await;
    let now = chrono::Utc::now().timestamp().max(0) as u64;

    if !decision.allowed {
        let retry_after = whole_secs(decision.retry_after.unwrap_or(limiter.window()));
        warn!(client_id = %client_id, path = %path, retry_after, "request rejected by rate limit");

        let body = Json(json!({
            "error": "Rate limit exceeded",
            "detail": format!("Too many requests. Please retry after {retry_after} seconds"),
            "retry_after": retry_after,
        }));
        let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
        let headers = response.headers_mut();
        headers.insert(axum::http::header::RETRY_AFTER, header_value(retry_after));
        headers.insert(X_RATELIMIT_LIMIT.clone(), header_value(limiter.limit()));
        headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from_static("0"));
        headers.insert(X_RATELIMIT_RESET.clone(), header_value(now + retry_after));
        return response;
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(X_RATELIMIT_LIMIT.clone(), header_value(limiter.limit()));
    headers.insert(X_RATELIMIT_REMAINING.clone(), header_value(decision.remaining));
    headers.insert(
        X_RATELIMIT_RESET.clone(),
        header_value(now + whole_secs(limiter.window())),
    );
    response
}

//! Admin API authentication.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;
use tracing::warn;

/// Header carrying the admin token.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Gate admin routes on `X-Admin-Token`, compared in constant time.
///
/// With no token configured the admin API is closed: every request gets
/// `403`. A missing or wrong token gets `401`.
pub async fn admin_auth_middleware(
    State(admin_token): State<Option<Arc<str>>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = admin_token else {
        warn!(path = %request.uri().path(), "admin request refused, no admin token configured");
        return reject(StatusCode::FORBIDDEN, "admin API is disabled");
    };

    let provided = request
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    match provided {
        Some(token) if bool::from(token.as_bytes().ct_eq(expected.as_bytes())) => next.run(request).await,
        _ => {
            warn!(path = %request.uri().path(), "admin request refused, bad or missing token");
            reject(StatusCode::UNAUTHORIZED, "admin token required")
        }
    }
}

fn reject(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

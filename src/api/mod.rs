//! API layer -- axum routes, handlers, and middleware.

pub mod auth;
pub mod metrics;
mod routes;
pub mod state;

use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use self::auth::admin_auth_middleware;
use self::metrics::http_metrics_middleware;
use self::state::AppState;
use crate::ratelimit::middleware::rate_limit_middleware;

/// Build the application router with all API routes behind the rate limiter.
pub fn router(state: AppState) -> Router {
    let rate_limits = state.rate_limits.clone();
    let http_metrics = state.http_metrics.clone();
    let admin = routes::admin_routes()
        .route_layer(from_fn_with_state(state.admin_token.clone(), admin_auth_middleware));
    Router::new()
        .route("/health", get(routes::health))
        .route("/metrics", get(routes::metrics))
        .route("/metrics/prometheus", get(routes::prometheus_metrics))
        .nest("/api/v1", routes::api_routes())
        .nest("/api/v1/admin", admin)
        .fallback(fallback)
        .layer(from_fn_with_state(rate_limits, rate_limit_middleware))
        .layer(from_fn_with_state(http_metrics, http_metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}

//! API route definitions.

use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use super::state::AppState;
use crate::pipeline::Alert;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/alerts", post(process_alert))
        .route("/alerts/batch", post(batch_process))
        .route("/alerts/enqueue", post(enqueue_alert))
}

/// Routes nested under `/api/v1/admin`, behind the admin token.
pub fn admin_routes() -> Router<AppState> {
    Router::new().route("/rate-limit/{client_id}", delete(reset_rate_limit))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let readiness = state.pipeline.readiness().await;
    let status = if readiness.ready { "ok" } else { "degraded" };
    Json(json!({
        "data": {
            "status": status,
            "version": env!("CARGO_PKG_VERSION"),
            "services": readiness.services,
            "worker_running": state.manager.is_running(),
        },
        "meta": meta()
    }))
}

pub async fn metrics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "pipeline": state.pipeline.metrics().snapshot(),
            "queue": {
                "size": state.manager.queue_size(),
                "capacity": state.manager.queue_capacity(),
            }
        },
        "meta": meta()
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    let snapshot = state.pipeline.metrics().snapshot();
    match state.http_metrics.render(&snapshot, state.manager.queue_size()) {
        Ok(body) => ([(CONTENT_TYPE, state.http_metrics.content_type())], body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode prometheus metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

async fn process_alert(State(state): State<AppState>, Json(alert): Json<Alert>) -> Json<Value> {
    let result = state.pipeline.process_alert(&alert).await;
    Json(json!({ "data": result, "meta": meta() }))
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    alerts: Vec<Alert>,
}

async fn batch_process(State(state): State<AppState>, Json(request): Json<BatchRequest>) -> Json<Value> {
    let results = state.pipeline.batch_process(&request.alerts).await;
    let failed = results.iter().filter(|r| r.is_failed()).count();
    Json(json!({
        "data": results,
        "meta": { "total": request.alerts.len(), "failed": failed }
    }))
}

async fn enqueue_alert(State(state): State<AppState>, Json(alert): Json<Alert>) -> Response {
    let alert_id = alert.id.clone();
    match state.manager.try_enqueue(alert) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "data": { "alert_id": alert_id, "queued": true },
                "meta": { "queue_size": state.manager.queue_size() }
            })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string(), "alert_id": alert_id })),
        )
            .into_response(),
    }
}

async fn reset_rate_limit(State(state): State<AppState>, Path(client_id): Path<String>) -> Json<Value> {
    let reset = state.rate_limits.reset_client(&client_id).await;
    info!(client_id = %client_id, reset, "rate limit reset requested");
    Json(json!({ "data": { "client_id": client_id, "reset": reset } }))
}

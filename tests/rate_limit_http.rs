//! HTTP surface: rate-limit middleware and handlers, driven through the
//! full router with `tower::ServiceExt::oneshot`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    response::Response,
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use alertpipe::api::{self, state::AppState};
use alertpipe::client::retry::RetryPolicy;
use alertpipe::config::{EndpointConfig, LimitSpec, PipelineConfig, RateLimitConfig, ServicesConfig};
use alertpipe::events::EventBus;
use alertpipe::pipeline::AlertPipeline;
use alertpipe::ratelimit::{RateLimitPolicy, ENQUEUE_PATH};

const ADMIN_TOKEN: &str = "ops-admin-7f3c";

/// Collaborators all point at a port nothing listens on.
async fn app(rate_limit: RateLimitConfig, queue_capacity: usize) -> (Router, AppState) {
    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let mut endpoint = EndpointConfig::with_base_url(&format!("http://{closed}"));
    endpoint.timeout_secs = 1.0;
    endpoint.health_timeout_secs = 0.5;
    let services = ServicesConfig {
        detection: endpoint.clone(),
        triage: endpoint.clone(),
        enrichment: endpoint.clone(),
        case_management: endpoint,
    };
    let config = PipelineConfig {
        enable_ml: false,
        queue_capacity,
        ..PipelineConfig::default()
    };

    let pipeline =
        AlertPipeline::from_config(&services, RetryPolicy::none(), config, Arc::new(EventBus::new())).unwrap();
    let policy = Arc::new(RateLimitPolicy::from_config(&rate_limit));
    let state = AppState::new(Arc::new(pipeline), policy)
        .unwrap()
        .with_admin_token(Some(ADMIN_TOKEN.to_string()));
    (api::router(state.clone()), state)
}

fn limits(default: u32, enqueue: u32) -> RateLimitConfig {
    RateLimitConfig {
        default: Some(LimitSpec::new(default, 60)),
        endpoints: Some(BTreeMap::from([(ENQUEUE_PATH.to_string(), LimitSpec::new(enqueue, 60))])),
        ..RateLimitConfig::default()
    }
}

fn request(method: Method, uri: &str, client: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", client);
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn get(uri: &str, client: &str) -> Request<Body> {
    request(Method::GET, uri, client, None)
}

fn admin_reset(client_id: &str, caller: &str, token: Option<&str>) -> Request<Body> {
    let builder = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/api/v1/admin/rate-limit/{client_id}"))
        .header("x-forwarded-for", caller);
    let builder = match token {
        Some(token) => builder.header("x-admin-token", token),
        None => builder,
    };
    builder.body(Body::empty()).unwrap()
}

fn header(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .map(|v| v.to_str().unwrap().to_string())
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_admission_headers_then_429() {
    let (app, _) = app(limits(3, 50), 10).await;

    for expected_remaining in ["2", "1", "0"] {
        let response = app.clone().oneshot(get("/api/v1/unknown", "203.0.113.5")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(header(&response, "x-ratelimit-limit").as_deref(), Some("3"));
        assert_eq!(header(&response, "x-ratelimit-remaining").as_deref(), Some(expected_remaining));
        assert!(header(&response, "x-ratelimit-reset").is_some());
    }

    let response = app.clone().oneshot(get("/api/v1/unknown", "203.0.113.5")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, "x-ratelimit-remaining").as_deref(), Some("0"));
    let retry_after: u64 = header(&response, "retry-after").unwrap().parse().unwrap();
    assert!(retry_after > 0 && retry_after <= 60);

    let body = json_body(response).await;
    assert_eq!(body["error"], "Rate limit exceeded");
    assert_eq!(body["retry_after"], retry_after);
    assert!(body["detail"].as_str().unwrap().contains("retry after"));
}

#[tokio::test]
async fn test_clients_do_not_share_budget() {
    let (app, _) = app(limits(1, 50), 10).await;

    let first = app.clone().oneshot(get("/api/v1/unknown", "198.51.100.1")).await.unwrap();
    assert_eq!(first.status(), StatusCode::NOT_FOUND);
    let blocked = app.clone().oneshot(get("/api/v1/unknown", "198.51.100.1")).await.unwrap();
    assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);

    let other = app.clone().oneshot(get("/api/v1/unknown", "198.51.100.2")).await.unwrap();
    assert_eq!(other.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_api_key_prefix_identifies_client() {
    let (app, _) = app(limits(1, 50), 10).await;
    let call = |token: &str, forwarded: &str| {
        Request::builder()
            .uri("/api/v1/unknown")
            .header("authorization", format!("Bearer {token}"))
            .header("x-forwarded-for", forwarded)
            .body(Body::empty())
            .unwrap()
    };

    // Same 20-character prefix, different source addresses: one budget.
    let first = app
        .clone()
        .oneshot(call("aisoc_0123456789abcdXXXX", "192.0.2.1"))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::NOT_FOUND);
    let second = app
        .clone()
        .oneshot(call("aisoc_0123456789abcdYYYY", "192.0.2.2"))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_health_and_metrics_are_exempt() {
    let (app, _) = app(limits(1, 1), 10).await;

    for _ in 0..3 {
        let response = app.clone().oneshot(get("/health", "203.0.113.7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(header(&response, "x-ratelimit-limit").is_none());
    }

    let health = json_body(app.clone().oneshot(get("/health", "203.0.113.7")).await.unwrap()).await;
    assert_eq!(health["data"]["status"], "degraded");
    assert_eq!(health["data"]["services"]["triage"], false);

    for _ in 0..3 {
        let response = app.clone().oneshot(get("/metrics", "203.0.113.7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn test_endpoint_limit_is_separate_from_default() {
    let (app, _) = app(limits(100, 2), 10).await;
    let enqueue = || {
        request(
            Method::POST,
            ENQUEUE_PATH,
            "203.0.113.8",
            Some(json!({"id": "q-1", "rule": {"description": "Port scan", "level": 6}})),
        )
    };

    for _ in 0..2 {
        let response = app.clone().oneshot(enqueue()).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(header(&response, "x-ratelimit-limit").as_deref(), Some("2"));
    }
    let response = app.clone().oneshot(enqueue()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // The default tier still admits the same client elsewhere.
    let response = app.clone().oneshot(get("/api/v1/unknown", "203.0.113.8")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(header(&response, "x-ratelimit-limit").as_deref(), Some("100"));
}

#[tokio::test]
async fn test_enqueue_rejects_when_queue_full() {
    let disabled = RateLimitConfig {
        enabled: false,
        ..RateLimitConfig::default()
    };
    let (app, state) = app(disabled, 1).await;
    let alert = json!({"id": "full-1"});

    let accepted = app
        .clone()
        .oneshot(request(Method::POST, ENQUEUE_PATH, "192.0.2.9", Some(alert.clone())))
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::ACCEPTED);
    assert!(header(&accepted, "x-ratelimit-limit").is_none());

    let rejected = app
        .clone()
        .oneshot(request(Method::POST, ENQUEUE_PATH, "192.0.2.9", Some(alert)))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(rejected).await["error"], "alert queue is full");
    assert_eq!(state.manager.queue_size(), 1);
}

#[tokio::test]
async fn test_admin_reset_restores_budget() {
    let (app, _) = app(limits(1, 50), 10).await;

    app.clone().oneshot(get("/api/v1/unknown", "203.0.113.9")).await.unwrap();
    let blocked = app.clone().oneshot(get("/api/v1/unknown", "203.0.113.9")).await.unwrap();
    assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);

    let reset = app
        .clone()
        .oneshot(admin_reset("203.0.113.9", "10.0.0.1", Some(ADMIN_TOKEN)))
        .await
        .unwrap();
    assert_eq!(reset.status(), StatusCode::OK);
    assert_eq!(json_body(reset).await["data"]["reset"], true);

    let again = app.clone().oneshot(get("/api/v1/unknown", "203.0.113.9")).await.unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_reset_requires_token() {
    let (app, _) = app(limits(100, 50), 10).await;

    let missing = app.clone().oneshot(admin_reset("203.0.113.20", "10.0.0.2", None)).await.unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(missing).await["error"], "admin token required");

    let wrong = app
        .clone()
        .oneshot(admin_reset("203.0.113.20", "10.0.0.2", Some("ops-admin-0000")))
        .await
        .unwrap();
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_admin_reset_disabled_without_configured_token() {
    let (_, state) = app(limits(100, 50), 10).await;
    let app = api::router(state.with_admin_token(None));

    let response = app
        .oneshot(admin_reset("203.0.113.21", "10.0.0.3", Some(ADMIN_TOKEN)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_throttled_client_cannot_reset_itself() {
    let (app, state) = app(limits(100, 1), 10).await;
    let client = "198.51.100.7";
    let mut admitted = 0;

    for i in 0..5 {
        let enqueue = request(Method::POST, ENQUEUE_PATH, client, Some(json!({"id": format!("self-{i}")})));
        if app.clone().oneshot(enqueue).await.unwrap().status() == StatusCode::ACCEPTED {
            admitted += 1;
        }
        let reset = app.clone().oneshot(admin_reset(client, client, None)).await.unwrap();
        assert_eq!(reset.status(), StatusCode::UNAUTHORIZED);
    }

    assert_eq!(admitted, 1);
    assert_eq!(state.manager.queue_size(), 1);
}

#[tokio::test]
async fn test_prometheus_exposition() {
    let (app, _) = app(limits(1, 50), 10).await;

    app.clone().oneshot(get("/api/v1/unknown", "203.0.113.30")).await.unwrap();
    let limited = app.clone().oneshot(get("/api/v1/unknown", "203.0.113.30")).await.unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);

    // Exempt: scraping never consumes the client's budget.
    let response = app
        .clone()
        .oneshot(get("/metrics/prometheus", "203.0.113.30"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(header(&response, "content-type").unwrap().starts_with("text/plain"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains(r#"status="404""#), "{text}");
    assert!(text.contains(r#"status="429""#), "{text}");
    assert!(text.contains("alertpipe_request_duration_seconds_bucket"));
    assert!(text.contains(r#"alertpipe_pipeline_alerts{outcome="completed"} 0"#));
    assert!(text.contains("alertpipe_queue_size 0"));
}

#[tokio::test]
async fn test_process_alert_degrades_without_collaborators() {
    let disabled = RateLimitConfig {
        enabled: false,
        ..RateLimitConfig::default()
    };
    let (app, state) = app(disabled, 10).await;
    let alert = json!({
        "id": "wazuh-77",
        "rule": {"description": "Multiple authentication failures", "level": 4},
        "agent": {"name": "db-02"}
    });

    let response = app
        .clone()
        .oneshot(request(Method::POST, "/api/v1/alerts", "192.0.2.10", Some(alert)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let result = &body["data"];
    assert_eq!(result["alert_id"], "wazuh-77");
    assert_eq!(result["final_status"], "completed");
    assert_eq!(result["stages"]["ml_detection"]["status"], "skipped");
    assert_eq!(result["stages"]["triage_analysis"]["fallback"], true);
    assert_eq!(result["stages"]["triage_analysis"]["severity"], "low");
    assert!(result["stages"]["context_enrichment"]["error"].is_string());
    assert!(result["stages"].get("case_creation").is_none());

    assert_eq!(state.pipeline.metrics().total_processed(), 1);
    let metrics = json_body(app.clone().oneshot(get("/metrics", "192.0.2.10")).await.unwrap()).await;
    assert_eq!(metrics["data"]["pipeline"]["total_processed"], 1);
    assert_eq!(metrics["data"]["queue"]["capacity"], 10);
}

#[tokio::test]
async fn test_batch_endpoint_returns_positional_results() {
    let disabled = RateLimitConfig {
        enabled: false,
        ..RateLimitConfig::default()
    };
    let (app, _) = app(disabled, 10).await;
    let batch = json!({"alerts": [{"id": "b-1"}, {"id": ""}, {"id": "b-3"}]});

    let response = app
        .clone()
        .oneshot(request(Method::POST, "/api/v1/alerts/batch", "192.0.2.11", Some(batch)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["alert_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["b-1", "", "b-3"]);
    assert_eq!(body["data"][1]["final_status"], "failed");
    assert_eq!(body["meta"]["failed"], 1);
}

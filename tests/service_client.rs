//! ServiceClient against a local HTTP server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use alertpipe::client::collaborators::{
    CaseRecord, CaseService, Collaborator, DetectionService, EnrichmentService, HttpCases, HttpDetection,
    HttpEnrichment,
};
use alertpipe::client::retry::RetryPolicy;
use alertpipe::client::{ServiceClient, ServiceError};
use alertpipe::config::EndpointConfig;

#[derive(Clone, Default)]
struct Counters {
    flaky: Arc<AtomicUsize>,
    broken: Arc<AtomicUsize>,
    rejected: Arc<AtomicUsize>,
}

async fn spawn_server() -> (SocketAddr, Counters) {
    let counters = Counters::default();
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        // Fails twice with 503, then succeeds.
        .route(
            "/flaky",
            get(|State(c): State<Counters>| async move {
                let n = c.flaky.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"detail": "warming up"})))
                } else {
                    (StatusCode::OK, Json(json!({"attempt": n})))
                }
            }),
        )
        .route(
            "/broken",
            get(|State(c): State<Counters>| async move {
                c.broken.fetch_add(1, Ordering::SeqCst);
                (StatusCode::INTERNAL_SERVER_ERROR, "boom")
            }),
        )
        .route(
            "/reject",
            post(|State(c): State<Counters>, Json(_body): Json<Value>| async move {
                c.rejected.fetch_add(1, Ordering::SeqCst);
                (StatusCode::UNPROCESSABLE_ENTITY, "features must not be empty")
            }),
        )
        .route("/garbage", get(|| async { "this is not json" }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({}))
            }),
        )
        .route(
            "/echo",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                Json(json!({"body": body, "authorization": auth}))
            }),
        )
        .route(
            "/predict",
            post(|Json(body): Json<Value>| async move {
                Json(json!({
                    "prediction": "ATTACK",
                    "confidence": 0.97,
                    "probabilities": {"ATTACK": 0.97, "BENIGN": 0.03},
                    "model_used": body["model_name"],
                    "inference_time_ms": 0.8
                }))
            }),
        )
        .route(
            "/retrieve",
            post(|Json(body): Json<Value>| async move {
                let top_k = body["top_k"].as_u64().unwrap_or(0);
                let results: Vec<Value> = (0..top_k)
                    .map(|i| json!({"document": format!("doc {i}"), "metadata": {}, "distance": 0.2}))
                    .collect();
                Json(json!({"results": results}))
            }),
        )
        // TheHive answers with both `_id` and `id`.
        .route(
            "/api/case",
            post(|| async { Json(json!({"_id": "~81920", "id": "~81920", "title": "SSH brute force"})) }),
        )
        .with_state(counters.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, counters)
}

fn endpoint(base: String) -> EndpointConfig {
    EndpointConfig {
        timeout_secs: 0.5,
        health_timeout_secs: 0.5,
        ..EndpointConfig::with_base_url(&base)
    }
}

fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::new(attempts, Duration::from_millis(10), 2.0)
}

#[tokio::test]
async fn test_server_errors_are_retried_until_success() {
    let (addr, counters) = spawn_server().await;
    let client = ServiceClient::new("flaky", &endpoint(format!("http://{addr}")), fast_retry(3)).unwrap();

    let body: Value = client.get("/flaky").await.unwrap();

    assert_eq!(body["attempt"], 3);
    assert_eq!(counters.flaky.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_persistent_server_error_propagates_after_attempts() {
    let (addr, counters) = spawn_server().await;
    let client = ServiceClient::new("broken", &endpoint(format!("http://{addr}")), fast_retry(3)).unwrap();

    let err = client.get::<Value>("/broken").await.unwrap_err();

    assert!(matches!(err, ServiceError::Status { status: 500, ref body } if body == "boom"));
    assert_eq!(counters.broken.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let (addr, counters) = spawn_server().await;
    let client = ServiceClient::new("reject", &endpoint(format!("http://{addr}")), fast_retry(3)).unwrap();

    let err = client.post::<_, Value>("/reject", &json!({"features": []})).await.unwrap_err();

    assert_eq!(err.status(), Some(422));
    assert_eq!(counters.rejected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_malformed_body_is_reported() {
    let (addr, _) = spawn_server().await;
    let client = ServiceClient::new("garbage", &endpoint(format!("http://{addr}")), fast_retry(3)).unwrap();

    let err = client.get::<Value>("/garbage").await.unwrap_err();

    assert!(matches!(err, ServiceError::Malformed(_)));
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let (addr, _) = spawn_server().await;
    let client = ServiceClient::new("slow", &endpoint(format!("http://{addr}")), RetryPolicy::none()).unwrap();

    let err = client.get::<Value>("/slow").await.unwrap_err();

    assert!(matches!(err, ServiceError::Timeout(_)), "got {err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_bearer_token_is_sent() {
    let (addr, _) = spawn_server().await;
    let mut cfg = endpoint(format!("http://{addr}"));
    cfg.api_key = Some("hive-secret".to_string());
    let client = ServiceClient::new("echo", &cfg, RetryPolicy::none()).unwrap();

    let body: Value = client.post("/echo", &json!({"title": "x"})).await.unwrap();

    assert_eq!(body["authorization"], "Bearer hive-secret");
    assert_eq!(body["body"]["title"], "x");
}

#[tokio::test]
async fn test_health_check() {
    let (addr, _) = spawn_server().await;
    let up = ServiceClient::new("up", &endpoint(format!("http://{addr}")), RetryPolicy::none()).unwrap();
    assert!(up.health_check().await);

    // Bind then drop to get a port nothing listens on.
    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let down = ServiceClient::new("down", &endpoint(format!("http://{closed}")), RetryPolicy::none()).unwrap();
    assert!(!down.health_check().await);
}

#[tokio::test]
async fn test_typed_collaborators_over_http() {
    let (addr, _) = spawn_server().await;
    let base = format!("http://{addr}");

    let detection = HttpDetection::new(ServiceClient::new("detection", &endpoint(base.clone()), RetryPolicy::none()).unwrap());
    let prediction = detection.predict(&[1.0, 2.0], "random_forest").await.unwrap();
    assert_eq!(prediction.prediction, "ATTACK");
    assert_eq!(prediction.model_used.as_deref(), Some("random_forest"));
    assert_eq!(prediction.probabilities["BENIGN"], 0.03);
    assert!(detection.health_check().await);
    assert_eq!(detection.name(), "detection");

    let enrichment =
        HttpEnrichment::new(ServiceClient::new("enrichment", &endpoint(base.clone()), RetryPolicy::none()).unwrap());
    let docs = enrichment.retrieve("brute force", "mitre_attack", 2).await.unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[1].document, "doc 1");
    assert_eq!(docs[0].distance, Some(0.2));

    let cases = HttpCases::new(
        ServiceClient::new("case_management", &endpoint(format!("{base}/api")), RetryPolicy::none()).unwrap(),
    );
    let record = CaseRecord {
        title: "SSH brute force".to_string(),
        description: "d".to_string(),
        severity: 3,
        tags: vec!["automated".to_string()],
        tlp: 2,
        pap: 2,
        custom_fields: Default::default(),
    };
    let id = cases.create_case(&record).await.unwrap();
    assert_eq!(id, "~81920");
    assert_eq!(cases.case_url(&id), format!("{base}/api/case/~81920"));
}

#[tokio::test]
async fn test_connection_cap_queues_instead_of_failing() {
    let (addr, _) = spawn_server().await;
    let mut cfg = endpoint(format!("http://{addr}"));
    cfg.max_connections = 1;
    let client = Arc::new(ServiceClient::new("capped", &cfg, RetryPolicy::none()).unwrap());

    let calls = (0..8).map(|i| {
        let client = client.clone();
        async move { client.post::<_, Value>("/echo", &json!({"n": i})).await }
    });
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(|r| r.is_ok()));
}

//! Prometheus metrics for the HTTP surface.
//!
//! Request counts and latencies are recorded by [`http_metrics_middleware`];
//! pipeline counters and the queue depth are copied into gauges at scrape time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::Request,
    middleware::Next,
    response::Response,
};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::pipeline::MetricsSnapshot;

/// Metric name prefix.
pub const NAMESPACE: &str = "alertpipe";

/// Endpoint label for requests no route matched.
const UNMATCHED: &str = "unmatched";

const LATENCY_BUCKETS: [f64; 8] = [0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Per-router metric registry.
pub struct HttpMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    pipeline_alerts: IntGaugeVec,
    queue_size: IntGauge,
}

impl HttpMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None)?;

        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "HTTP requests handled"),
            &["method", "endpoint", "status"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "HTTP request latency").buckets(LATENCY_BUCKETS.to_vec()),
            &["method", "endpoint"],
        )?;
        let pipeline_alerts = IntGaugeVec::new(
            Opts::new("pipeline_alerts", "Pipeline runs finished, by outcome"),
            &["outcome"],
        )?;
        let queue_size = IntGauge::new("queue_size", "Alerts waiting for the background worker")?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(pipeline_alerts.clone()))?;
        registry.register(Box::new(queue_size.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            pipeline_alerts,
            queue_size,
        })
    }

    pub fn observe(&self, method: &str, endpoint: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        self.requests_total
            .with_label_values(&[method, endpoint, status.as_str()])
            .inc();
        self.request_duration
            .with_label_values(&[method, endpoint])
            .observe(elapsed.as_secs_f64());
    }

    /// Text exposition of every metric, with pipeline gauges refreshed.
    pub fn render(&self, pipeline: &MetricsSnapshot, queue_size: usize) -> prometheus::Result<Vec<u8>> {
        self.pipeline_alerts
            .with_label_values(&["completed"])
            .set(gauge(pipeline.total_processed));
        self.pipeline_alerts
            .with_label_values(&["failed"])
            .set(gauge(pipeline.total_failed));
        self.queue_size.set(gauge(queue_size as u64));

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

fn gauge(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Count and time every request, labelled by its route template.
pub async fn http_metrics_middleware(
    State(metrics): State<Arc<HttpMetrics>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().as_str().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED.to_string());

    let started = Instant::now();
    let response = next.run(request).await;
    metrics.observe(&method, &endpoint, response.status().as_u16(), started.elapsed());
    response
}

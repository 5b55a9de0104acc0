use std::sync::Arc;

use anyhow::{Context, Result};

use super::metrics::HttpMetrics;
use crate::pipeline::{AlertPipeline, PipelineManager};
use crate::ratelimit::RateLimitPolicy;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<AlertPipeline>,
    pub manager: Arc<PipelineManager>,
    pub rate_limits: Arc<RateLimitPolicy>,
    pub http_metrics: Arc<HttpMetrics>,
    /// `X-Admin-Token` value for `/api/v1/admin`; admin routes are refused when unset.
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(pipeline: Arc<AlertPipeline>, rate_limits: Arc<RateLimitPolicy>) -> Result<Self> {
        let manager = Arc::new(PipelineManager::new(pipeline.clone()));
        let http_metrics = Arc::new(HttpMetrics::new().context("failed to register HTTP metrics")?);
        Ok(Self {
            pipeline,
            manager,
            rate_limits,
            http_metrics,
            admin_token: None,
        })
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty()).map(Arc::from);
        self
    }
}

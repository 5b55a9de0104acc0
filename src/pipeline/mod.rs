//! Alert processing pipeline: stage orchestration, metrics, and the
//! queue-driven worker.

pub mod manager;
pub mod metrics;
pub mod orchestrator;
pub mod types;

use std::time::Duration;

use thiserror::Error;

pub use manager::{EnqueueError, PipelineManager};
pub use metrics::{MetricsSnapshot, PipelineMetrics, StagePerformance};
pub use orchestrator::{AlertPipeline, Collaborators, Readiness};
pub use types::{
    Alert, CaseOutput, DetectionOutput, DetectionStage, EnrichmentOutput, PipelineResult, PipelineStage,
    ResponseOutput, Severity, StageOutputs, TriageOutput,
};

/// Run-level failures with no fallback path. These end a run in `failed`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline run exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),
    #[error("pipeline run panicked: {0}")]
    Panicked(String),
    #[error("invalid alert: {0}")]
    InvalidAlert(String),
}

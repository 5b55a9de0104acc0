//! Aggregate pipeline counters and stage timings.
//!
//! One instance is owned by each [`AlertPipeline`](super::AlertPipeline).
//! Every update takes the lock once, so concurrent runs in a batch never
//! lose increments.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

use super::types::{PipelineStage, Severity};

#[derive(Debug, Clone, Copy, PartialEq)]
struct StageTiming {
    count: u64,
    total_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

impl StageTiming {
    fn first(duration_ms: f64) -> Self {
        Self {
            count: 1,
            total_ms: duration_ms,
            min_ms: duration_ms,
            max_ms: duration_ms,
        }
    }

    fn record(&mut self, duration_ms: f64) {
        self.count += 1;
        self.total_ms += duration_ms;
        self.min_ms = self.min_ms.min(duration_ms);
        self.max_ms = self.max_ms.max(duration_ms);
    }
}

#[derive(Debug, Default)]
struct MetricsInner {
    total_processed: u64,
    total_failed: u64,
    severity_counts: BTreeMap<Severity, u64>,
    stage_times: BTreeMap<&'static str, StageTiming>,
}

/// Timing summary for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StagePerformance {
    pub avg_time_ms: f64,
    pub min_time_ms: f64,
    pub max_time_ms: f64,
    pub count: u64,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_processed: u64,
    pub total_failed: u64,
    pub success_rate: f64,
    pub severity_distribution: BTreeMap<Severity, u64>,
    pub stage_performance: BTreeMap<String, StagePerformance>,
}

/// Counters for completed and failed runs, triage severities, and stage timings.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    inner: Mutex<MetricsInner>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MetricsInner> {
        // Counters stay meaningful even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_stage_time(&self, stage: PipelineStage, duration_ms: f64) {
        let mut inner = self.lock();
        inner
            .stage_times
            .entry(stage.as_str())
            .and_modify(|t| t.record(duration_ms))
            .or_insert_with(|| StageTiming::first(duration_ms));
    }

    pub fn record_severity(&self, severity: Severity) {
        *self.lock().severity_counts.entry(severity).or_insert(0) += 1;
    }

    /// Count one terminal run. `final_status` decides which counter moves.
    pub fn record_outcome(&self, final_status: PipelineStage) {
        let mut inner = self.lock();
        if final_status == PipelineStage::Failed {
            inner.total_failed += 1;
        } else {
            inner.total_processed += 1;
        }
    }

    pub fn total_processed(&self) -> u64 {
        self.lock().total_processed
    }

    pub fn total_failed(&self) -> u64 {
        self.lock().total_failed
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.lock();
        let finished = inner.total_processed + inner.total_failed;
        let success_rate = if finished > 0 {
            inner.total_processed as f64 / finished as f64
        } else {
            0.0
        };

        let stage_performance = inner
            .stage_times
            .iter()
            .map(|(stage, t)| {
                let perf = StagePerformance {
                    avg_time_ms: t.total_ms / t.count as f64,
                    min_time_ms: t.min_ms,
                    max_time_ms: t.max_ms,
                    count: t.count,
                };
                (stage.to_string(), perf)
            })
            .collect();

        MetricsSnapshot {
            total_processed: inner.total_processed,
            total_failed: inner.total_failed,
            success_rate,
            severity_distribution: inner.severity_counts.clone(),
            stage_performance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_snapshot() {
        let snap = PipelineMetrics::new().snapshot();
        assert_eq!(snap.total_processed, 0);
        assert_eq!(snap.total_failed, 0);
        assert_eq!(snap.success_rate, 0.0);
        assert!(snap.stage_performance.is_empty());
    }

    #[test]
    fn test_stage_timing_summary() {
        let metrics = PipelineMetrics::new();
        metrics.record_stage_time(PipelineStage::TriageAnalysis, 10.0);
        metrics.record_stage_time(PipelineStage::TriageAnalysis, 30.0);
        metrics.record_stage_time(PipelineStage::TriageAnalysis, 20.0);

        let snap = metrics.snapshot();
        let triage = snap.stage_performance["triage_analysis"];
        assert_eq!(triage.count, 3);
        assert_eq!(triage.min_time_ms, 10.0);
        assert_eq!(triage.max_time_ms, 30.0);
        assert_eq!(triage.avg_time_ms, 20.0);
    }

    #[test]
    fn test_outcomes_and_success_rate() {
        let metrics = PipelineMetrics::new();
        metrics.record_outcome(PipelineStage::Completed);
        metrics.record_outcome(PipelineStage::Completed);
        metrics.record_outcome(PipelineStage::Completed);
        metrics.record_outcome(PipelineStage::Failed);
        metrics.record_severity(Severity::High);
        metrics.record_severity(Severity::High);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_processed, 3);
        assert_eq!(snap.total_failed, 1);
        assert_eq!(snap.success_rate, 0.75);
        assert_eq!(snap.severity_distribution[&Severity::High], 2);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["severity_distribution"]["high"], 2);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let metrics = Arc::new(PipelineMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        metrics.record_outcome(PipelineStage::Completed);
                        metrics.record_stage_time(PipelineStage::MlDetection, 1.0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = metrics.snapshot();
        assert_eq!(snap.total_processed, 4000);
        assert_eq!(snap.stage_performance["ml_detection"].count, 4000);
    }
}

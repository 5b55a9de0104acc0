//! Drives one alert through detection, triage, enrichment, case creation,
//! and response, in that order.
//!
//! Detection and triage degrade to [`FallbackHandler`] output when their
//! collaborator fails. Enrichment and case creation are best-effort: their
//! failures are recorded in the stage output and the run continues. Only a
//! defect with no fallback (a panic, an invalid alert, the optional run
//! deadline) ends a run in `failed`.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::metrics::PipelineMetrics;
use super::types::{
    Alert, CaseOutput, DetectionOutput, DetectionStage, EnrichmentOutput, PipelineResult, PipelineStage,
    ResponseOutput, Severity, TriageOutput,
};
use super::PipelineError;
use crate::client::collaborators::{
    CaseRecord, CaseService, DetectionService, EnrichmentService, HttpCases, HttpDetection, HttpEnrichment,
    HttpTriage, TriageRequest, TriageService, AMBER,
};
use crate::client::retry::RetryPolicy;
use crate::client::{ServiceClient, ServiceError};
use crate::config::{PipelineConfig, ServicesConfig};
use crate::events::{panic_message, EventBus, ALERT_PROCESSED};
use crate::fallback::FallbackHandler;

pub const SKIP_REASON: &str = "no_features_or_disabled";
pub const CASE_CREATED: &str = "case_created";
pub const RESPONSE_TRIGGERED: &str = "response_triggered";
pub const RESPONSE_NOTE: &str = "local decision; no workflow dispatch";

/// Longest slice of a context document quoted in a case description.
const CASE_CONTEXT_CHARS: usize = 200;
const CASE_CONTEXT_DOCS: usize = 2;

/// The four remote collaborators a pipeline calls.
#[derive(Clone)]
pub struct Collaborators {
    pub detection: Arc<dyn DetectionService>,
    pub triage: Arc<dyn TriageService>,
    pub enrichment: Arc<dyn EnrichmentService>,
    pub cases: Arc<dyn CaseService>,
}

impl Collaborators {
    /// HTTP clients for every collaborator, sharing one retry policy.
    pub fn http(services: &ServicesConfig, retry: RetryPolicy) -> Result<Self, ServiceError> {
        Ok(Self {
            detection: Arc::new(HttpDetection::new(ServiceClient::new(
                "detection",
                &services.detection,
                retry,
            )?)),
            triage: Arc::new(HttpTriage::new(ServiceClient::new("triage", &services.triage, retry)?)),
            enrichment: Arc::new(HttpEnrichment::new(ServiceClient::new(
                "enrichment",
                &services.enrichment,
                retry,
            )?)),
            cases: Arc::new(HttpCases::new(ServiceClient::new(
                "case_management",
                &services.case_management,
                retry,
            )?)),
        })
    }
}

/// Per-collaborator health as seen by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub services: BTreeMap<String, bool>,
}

pub struct AlertPipeline {
    collaborators: Collaborators,
    config: PipelineConfig,
    metrics: Arc<PipelineMetrics>,
    events: Arc<EventBus>,
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

impl AlertPipeline {
    /// A pipeline with its own metrics, publishing to `events`.
    pub fn new(collaborators: Collaborators, config: PipelineConfig, events: Arc<EventBus>) -> Self {
        Self {
            collaborators,
            config,
            metrics: Arc::new(PipelineMetrics::new()),
            events,
        }
    }

    pub fn from_config(
        services: &ServicesConfig,
        retry: RetryPolicy,
        config: PipelineConfig,
        events: Arc<EventBus>,
    ) -> Result<Self, ServiceError> {
        let collaborators = Collaborators::http(services, retry)?;
        info!(
            enable_ml = config.enable_ml,
            enable_enrichment = config.enable_enrichment,
            case_threshold = %config.case_threshold,
            "alert pipeline initialized"
        );
        Ok(Self::new(collaborators, config, events))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Run one alert to a terminal state. Never fails: problems show up in
    /// `final_status`, `error`, and `fallback` markers.
    pub async fn process_alert(&self, alert: &Alert) -> PipelineResult {
        let started = Instant::now();
        let mut result = PipelineResult::new(alert.id.clone());
        info!(alert_id = %alert.id, "processing alert");

        let outcome = {
            let run = AssertUnwindSafe(self.run_stages(alert, &mut result)).catch_unwind();
            match self.config.run_timeout() {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(outcome) => outcome,
                    Err(_) => Ok(Err(PipelineError::DeadlineExceeded(limit))),
                },
                None => run.await,
            }
        };

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => Some(PipelineError::Panicked(panic_message(&panic))),
        };

        result.processing_time_ms = elapsed_ms(started);
        match failure {
            None => {
                result.final_status = PipelineStage::Completed;
                info!(
                    alert_id = %alert.id,
                    severity = ?result.severity(),
                    actions = ?result.actions,
                    duration_ms = result.processing_time_ms,
                    "alert processed"
                );
            }
            Some(e) => {
                error!(
                    alert_id = %alert.id,
                    reached = %result.final_status,
                    error = %e,
                    "pipeline run failed"
                );
                result.final_status = PipelineStage::Failed;
                result.error = Some(e.to_string());
            }
        }

        self.finish(&result).await;
        result
    }

    /// Publish the completion event, then move exactly one counter.
    async fn finish(&self, result: &PipelineResult) {
        match serde_json::to_value(result) {
            Ok(payload) => {
                self.events.publish(ALERT_PROCESSED, payload).await;
            }
            Err(e) => {
                error!(alert_id = %result.alert_id, error = %e, "could not serialize pipeline result");
            }
        }
        self.metrics.record_outcome(result.final_status);
    }

    async fn run_stages(&self, alert: &Alert, result: &mut PipelineResult) -> Result<(), PipelineError> {
        if alert.id.trim().is_empty() {
            return Err(PipelineError::InvalidAlert("alert id is empty".to_string()));
        }

        let detection = result.stages.ml_detection.insert(self.detection_stage(alert).await);
        result.final_status = PipelineStage::MlDetection;

        let triage = result
            .stages
            .triage_analysis
            .insert(self.triage_stage(alert, detection.output()).await);
        result.final_status = PipelineStage::TriageAnalysis;
        self.metrics.record_severity(triage.severity);

        if self.config.enable_enrichment {
            result.stages.context_enrichment = Some(self.enrichment_stage(alert, triage).await);
            result.final_status = PipelineStage::ContextEnrichment;
        }

        if triage.severity >= self.config.case_threshold {
            let case = self
                .case_stage(alert, detection.output(), triage, result.stages.context_enrichment.as_ref())
                .await;
            if case.case_id.is_some() {
                result.actions.push(CASE_CREATED.to_string());
            }
            result.stages.case_creation = Some(case);
            result.final_status = PipelineStage::CaseCreation;
        }

        if triage.severity.is_urgent() {
            result.stages.response_action = Some(self.response_stage(alert, triage.severity));
            result.actions.push(RESPONSE_TRIGGERED.to_string());
            result.final_status = PipelineStage::ResponseAction;
        }

        Ok(())
    }

    async fn detection_stage(&self, alert: &Alert) -> DetectionStage {
        let features = match alert.feature_vector() {
            Some(features) if self.config.enable_ml => features,
            _ => {
                debug!(alert_id = %alert.id, "ml detection skipped (no features or disabled)");
                return DetectionStage::Skipped {
                    reason: SKIP_REASON.to_string(),
                };
            }
        };

        let started = Instant::now();
        let output = match self
            .collaborators
            .detection
            .predict(features, &self.config.model_name)
            .await
        {
            Ok(prediction) => DetectionOutput {
                prediction: prediction.prediction,
                confidence: prediction.confidence,
                probabilities: prediction.probabilities,
                model: prediction.model_used.or_else(|| Some(self.config.model_name.clone())),
                severity: None,
                duration_ms: 0.0,
                fallback: false,
            },
            Err(e) => {
                warn!(alert_id = %alert.id, error = %e, "detection failed");
                FallbackHandler::detection(alert)
            }
        };

        let duration_ms = elapsed_ms(started);
        self.metrics.record_stage_time(PipelineStage::MlDetection, duration_ms);
        DetectionStage::Predicted(DetectionOutput { duration_ms, ..output })
    }

    async fn triage_stage(&self, alert: &Alert, detection: Option<&DetectionOutput>) -> TriageOutput {
        let started = Instant::now();
        let request = TriageRequest::new(alert, detection);

        let output = match self.collaborators.triage.analyze(&request).await {
            Ok(assessment) => TriageOutput {
                severity: assessment.severity,
                confidence: assessment.confidence,
                summary: assessment.summary,
                analysis: assessment.analysis,
                iocs: assessment.iocs,
                mitre_techniques: assessment.mitre_techniques,
                mitre_tactics: assessment.mitre_tactics,
                recommendations: assessment.recommendations,
                duration_ms: 0.0,
                fallback: false,
            },
            Err(e) => {
                warn!(alert_id = %alert.id, error = %e, "triage failed");
                FallbackHandler::triage(alert)
            }
        };

        let duration_ms = elapsed_ms(started);
        self.metrics.record_stage_time(PipelineStage::TriageAnalysis, duration_ms);
        TriageOutput { duration_ms, ..output }
    }

    async fn enrichment_stage(&self, alert: &Alert, triage: &TriageOutput) -> EnrichmentOutput {
        let started = Instant::now();
        let query = enrichment_query(alert, triage);

        let retrieved = self
            .collaborators
            .enrichment
            .retrieve(
                &query,
                &self.config.enrichment_collection,
                self.config.enrichment_top_k as usize,
            )
            .await;

        let duration_ms = elapsed_ms(started);
        self.metrics.record_stage_time(PipelineStage::ContextEnrichment, duration_ms);

        match retrieved {
            Ok(context_documents) => {
                debug!(alert_id = %alert.id, documents = context_documents.len(), "context retrieved");
                EnrichmentOutput {
                    query,
                    context_documents,
                    duration_ms,
                    error: None,
                }
            }
            Err(e) => {
                warn!(alert_id = %alert.id, error = %e, "enrichment failed, continuing without context");
                EnrichmentOutput {
                    query,
                    context_documents: Vec::new(),
                    duration_ms,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn case_stage(
        &self,
        alert: &Alert,
        detection: Option<&DetectionOutput>,
        triage: &TriageOutput,
        enrichment: Option<&EnrichmentOutput>,
    ) -> CaseOutput {
        let started = Instant::now();
        let record = case_record(alert, detection, triage, enrichment);
        let created = self.collaborators.cases.create_case(&record).await;

        let duration_ms = elapsed_ms(started);
        self.metrics.record_stage_time(PipelineStage::CaseCreation, duration_ms);

        match created {
            Ok(case_id) => {
                info!(alert_id = %alert.id, case_id = %case_id, "case created");
                CaseOutput {
                    case_url: Some(self.collaborators.cases.case_url(&case_id)),
                    case_id: Some(case_id),
                    duration_ms,
                    error: None,
                }
            }
            Err(e) => {
                error!(alert_id = %alert.id, error = %e, "case creation failed");
                CaseOutput {
                    case_id: None,
                    case_url: None,
                    duration_ms,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn response_stage(&self, alert: &Alert, severity: Severity) -> ResponseOutput {
        let started = Instant::now();
        let actions: Vec<String> = response_actions(severity).iter().map(|a| a.to_string()).collect();
        info!(alert_id = %alert.id, severity = %severity, actions = ?actions, "response actions decided");

        let duration_ms = elapsed_ms(started);
        self.metrics.record_stage_time(PipelineStage::ResponseAction, duration_ms);
        ResponseOutput {
            actions,
            note: RESPONSE_NOTE.to_string(),
            duration_ms,
        }
    }

    /// Process `alerts` concurrently, at most `batch_concurrency` at a time.
    /// Results line up with the input.
    pub async fn batch_process(&self, alerts: &[Alert]) -> Vec<PipelineResult> {
        info!(count = alerts.len(), concurrency = self.config.batch_concurrency, "batch processing alerts");
        let permits = Semaphore::new(self.config.batch_concurrency.max(1));

        let runs = alerts.iter().map(|alert| {
            let permits = &permits;
            async move {
                let _permit = permits.acquire().await.ok();
                match AssertUnwindSafe(self.process_alert(alert)).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => {
                        let mut result = PipelineResult::new(alert.id.clone());
                        result.final_status = PipelineStage::Failed;
                        result.error = Some(PipelineError::Panicked(panic_message(&panic)).to_string());
                        self.metrics.record_outcome(PipelineStage::Failed);
                        result
                    }
                }
            }
        });
        join_all(runs).await
    }

    /// Health of every collaborator, probed concurrently.
    pub async fn readiness(&self) -> Readiness {
        let c = &self.collaborators;
        let (detection, triage, enrichment, cases) = tokio::join!(
            c.detection.health_check(),
            c.triage.health_check(),
            c.enrichment.health_check(),
            c.cases.health_check(),
        );

        let services: BTreeMap<String, bool> = [
            (c.detection.name(), detection),
            (c.triage.name(), triage),
            (c.enrichment.name(), enrichment),
            (c.cases.name(), cases),
        ]
        .into_iter()
        .map(|(name, ok)| (name.to_string(), ok))
        .collect();

        Readiness {
            ready: services.values().all(|ok| *ok),
            services,
        }
    }
}

/// Rule description followed by the labels triage attached.
pub fn enrichment_query(alert: &Alert, triage: &TriageOutput) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(description) = alert.rule_description().filter(|d| !d.is_empty()) {
        parts.push(description.to_string());
    }
    if !triage.mitre_techniques.is_empty() {
        parts.push(format!("MITRE techniques: {}", triage.mitre_techniques.join(", ")));
    }
    if !triage.mitre_tactics.is_empty() {
        parts.push(format!("MITRE tactics: {}", triage.mitre_tactics.join(", ")));
    }
    parts.join(" ")
}

pub fn response_actions(severity: Severity) -> &'static [&'static str] {
    match severity {
        Severity::Critical => &["isolate_host", "block_ip", "notify_security_team"],
        Severity::High => &["monitor_host", "alert_analyst"],
        _ => &[],
    }
}

/// Build the investigation case for an alert that met the threshold.
pub fn case_record(
    alert: &Alert,
    detection: Option<&DetectionOutput>,
    triage: &TriageOutput,
    enrichment: Option<&EnrichmentOutput>,
) -> CaseRecord {
    let mut description = vec![
        format!("**Alert ID:** {}", alert.id),
        format!("**Source:** {}", alert.agent_name().unwrap_or("Unknown")),
        format!(
            "**ML Prediction:** {}",
            detection.map_or("N/A", |d| d.prediction.as_str())
        ),
        format!("**Confidence:** {}", triage.confidence),
        String::new(),
        "**Analysis:**".to_string(),
        triage
            .analysis
            .clone()
            .unwrap_or_else(|| "No analysis available".to_string()),
        String::new(),
        "**Recommendations:**".to_string(),
        triage
            .recommendations
            .iter()
            .map(|r| format!("- {}", r.text()))
            .collect::<Vec<_>>()
            .join("\n"),
    ];

    if let Some(docs) = enrichment.map(|e| &e.context_documents).filter(|d| !d.is_empty()) {
        description.push(String::new());
        description.push("**Related Context:**".to_string());
        description.push(
            docs.iter()
                .take(CASE_CONTEXT_DOCS)
                .map(|doc| {
                    let excerpt: String = doc.document.chars().take(CASE_CONTEXT_CHARS).collect();
                    format!("- {excerpt}")
                })
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }

    let mut custom_fields = Map::new();
    custom_fields.insert("alertId".to_string(), Value::String(alert.id.clone()));
    custom_fields.insert("mlConfidence".to_string(), json!(triage.confidence));
    custom_fields.insert("mitreTactics".to_string(), json!(triage.mitre_tactics));

    CaseRecord {
        title: alert.rule_description().unwrap_or("Security Alert").to_string(),
        description: description.join("\n"),
        severity: triage.severity.case_scale(),
        tags: vec![
            "automated".to_string(),
            "alertpipe".to_string(),
            triage.severity.to_string(),
        ],
        tlp: AMBER,
        pap: AMBER,
        custom_fields,
    }
}

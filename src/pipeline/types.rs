//! Alert, severity, stage, and per-stage output types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Triage severity, ordered `info < low < medium < high < critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Info,
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Map a Wazuh rule level (0-15) onto a severity.
    pub fn from_rule_level(level: u32) -> Self {
        match level {
            0..=2 => Severity::Info,
            3..=4 => Severity::Low,
            5..=7 => Severity::Medium,
            8..=11 => Severity::High,
            _ => Severity::Critical,
        }
    }

    /// The case-management scale: 1 (low) to 4 (critical).
    pub fn case_scale(self) -> u8 {
        match self {
            Severity::Info | Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }

    /// High and critical alerts get automated response actions.
    pub fn is_urgent(self) -> bool {
        self >= Severity::High
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" | "informational" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Alert
// ---------------------------------------------------------------------------

/// The rule that fired, as reported by the alert source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
}

/// The host agent that produced the alert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

fn unknown_id() -> String {
    "unknown".to_string()
}

/// One security alert. Fields the pipeline does not interpret are kept in
/// `extra` and forwarded to collaborators untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(default = "unknown_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<Rule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<Agent>,
    /// Pre-extracted network flow features for the detection model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_log: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Alert {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rule: None,
            agent: None,
            features: None,
            full_log: None,
            extra: Map::new(),
        }
    }

    pub fn with_rule(mut self, description: impl Into<String>, level: u32) -> Self {
        self.rule = Some(Rule {
            id: None,
            description: Some(description.into()),
            level: Some(level),
        });
        self
    }

    pub fn with_agent(mut self, name: impl Into<String>) -> Self {
        self.agent = Some(Agent {
            name: Some(name.into()),
            ip: None,
        });
        self
    }

    pub fn with_features(mut self, features: Vec<f64>) -> Self {
        self.features = Some(features);
        self
    }

    pub fn with_full_log(mut self, log: impl Into<String>) -> Self {
        self.full_log = Some(log.into());
        self
    }

    pub fn rule_description(&self) -> Option<&str> {
        self.rule.as_ref().and_then(|r| r.description.as_deref())
    }

    pub fn rule_level(&self) -> Option<u32> {
        self.rule.as_ref().and_then(|r| r.level)
    }

    pub fn agent_name(&self) -> Option<&str> {
        self.agent.as_ref().and_then(|a| a.name.as_deref())
    }

    /// Features usable by the detection model, if any.
    pub fn feature_vector(&self) -> Option<&[f64]> {
        self.features.as_deref().filter(|f| !f.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Where a run currently is, or where it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Received,
    MlDetection,
    TriageAnalysis,
    ContextEnrichment,
    CaseCreation,
    ResponseAction,
    Completed,
    Failed,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Received => "received",
            PipelineStage::MlDetection => "ml_detection",
            PipelineStage::TriageAnalysis => "triage_analysis",
            PipelineStage::ContextEnrichment => "context_enrichment",
            PipelineStage::CaseCreation => "case_creation",
            PipelineStage::ResponseAction => "response_action",
            PipelineStage::Completed => "completed",
            PipelineStage::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStage::Completed | PipelineStage::Failed)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An indicator of compromise extracted during triage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ioc {
    pub ioc_type: String,
    pub value: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// A triage recommendation: either structured or free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recommendation {
    Action {
        action: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rationale: Option<String>,
    },
    Text(String),
}

impl Recommendation {
    pub fn text(&self) -> &str {
        match self {
            Recommendation::Action { action, .. } => action,
            Recommendation::Text(text) => text,
        }
    }
}

impl From<&str> for Recommendation {
    fn from(text: &str) -> Self {
        Recommendation::Text(text.to_string())
    }
}

/// Output of the detection model (or its fallback).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionOutput {
    pub prediction: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub probabilities: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Only set by the keyword fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    pub duration_ms: f64,
    #[serde(default)]
    pub fallback: bool,
}

/// The detection stage either ran (for real or via fallback) or was skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DetectionStage {
    Skipped { reason: String },
    Predicted(DetectionOutput),
}

impl DetectionStage {
    pub fn output(&self) -> Option<&DetectionOutput> {
        match self {
            DetectionStage::Predicted(output) => Some(output),
            DetectionStage::Skipped { .. } => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, DetectionStage::Skipped { .. })
    }
}

/// Output of the triage collaborator (or its fallback).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageOutput {
    pub severity: Severity,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
    #[serde(default)]
    pub iocs: Vec<Ioc>,
    #[serde(default)]
    pub mitre_techniques: Vec<String>,
    #[serde(default)]
    pub mitre_tactics: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
    pub duration_ms: f64,
    #[serde(default)]
    pub fallback: bool,
}

/// A knowledge-base document returned during enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDocument {
    pub document: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, alias = "similarity", skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
}

/// Output of the enrichment stage. Failures are recorded, never fatal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentOutput {
    pub query: String,
    pub context_documents: Vec<ContextDocument>,
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Output of the case creation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseOutput {
    pub case_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_url: Option<String>,
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Output of the response decision stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseOutput {
    pub actions: Vec<String>,
    pub note: String,
    pub duration_ms: f64,
}

/// Stage outputs in pipeline order. A stage skipped by policy is `None`
/// and absent from the serialized map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ml_detection: Option<DetectionStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triage_analysis: Option<TriageOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_enrichment: Option<EnrichmentOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_creation: Option<CaseOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_action: Option<ResponseOutput>,
}

impl StageOutputs {
    /// Stages that produced output, in execution order.
    pub fn recorded(&self) -> Vec<PipelineStage> {
        let mut stages = Vec::with_capacity(5);
        if self.ml_detection.is_some() {
            stages.push(PipelineStage::MlDetection);
        }
        if self.triage_analysis.is_some() {
            stages.push(PipelineStage::TriageAnalysis);
        }
        if self.context_enrichment.is_some() {
            stages.push(PipelineStage::ContextEnrichment);
        }
        if self.case_creation.is_some() {
            stages.push(PipelineStage::CaseCreation);
        }
        if self.response_action.is_some() {
            stages.push(PipelineStage::ResponseAction);
        }
        stages
    }
}

/// Record of one alert's trip through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub alert_id: String,
    pub started_at: DateTime<Utc>,
    pub stages: StageOutputs,
    pub actions: Vec<String>,
    pub final_status: PipelineStage,
    pub processing_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineResult {
    pub fn new(alert_id: impl Into<String>) -> Self {
        Self {
            alert_id: alert_id.into(),
            started_at: Utc::now(),
            stages: StageOutputs::default(),
            actions: Vec::new(),
            final_status: PipelineStage::Received,
            processing_time_ms: 0.0,
            error: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.final_status == PipelineStage::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.final_status == PipelineStage::Failed
    }

    /// Severity assigned by triage, if the run got that far.
    pub fn severity(&self) -> Option<Severity> {
        self.stages.triage_analysis.as_ref().map(|t| t.severity)
    }
}

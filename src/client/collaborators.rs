//! Typed contracts for the four remote collaborators.
//!
//! Each collaborator sits behind a trait so the orchestrator can be driven
//! by in-process fakes; the `Http*` types implement them over a
//! [`ServiceClient`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{ServiceClient, ServiceError};
use crate::pipeline::types::{Alert, ContextDocument, DetectionOutput, Ioc, Recommendation, Severity};

/// Anything the pipeline calls out to.
#[async_trait::async_trait]
pub trait Collaborator: Send + Sync {
    fn name(&self) -> &str;

    /// Readiness probe; false on any failure.
    async fn health_check(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PredictRequest<'a> {
    pub features: &'a [f64],
    pub model_name: &'a str,
}

/// Detection model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub prediction: String,
    pub confidence: f64,
    #[serde(default)]
    pub probabilities: BTreeMap<String, f64>,
    #[serde(default)]
    pub model_used: Option<String>,
    #[serde(default)]
    pub inference_time_ms: Option<f64>,
}

#[async_trait::async_trait]
pub trait DetectionService: Collaborator {
    async fn predict(&self, features: &[f64], model_name: &str) -> Result<Prediction, ServiceError>;
}

// ---------------------------------------------------------------------------
// Triage
// ---------------------------------------------------------------------------

/// Keys the request sets itself; stale copies in the alert's extras are dropped.
const TRIAGE_CONTEXT_KEYS: [&str; 3] = ["ml_prediction", "ml_confidence", "detection"];

/// The alert as sent to triage: the original fields plus whatever the
/// detection stage concluded.
#[derive(Debug, Clone, Serialize)]
pub struct TriageRequest {
    #[serde(flatten)]
    pub alert: Alert,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ml_prediction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ml_confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection: Option<DetectionOutput>,
}

impl TriageRequest {
    pub fn new(alert: &Alert, detection: Option<&DetectionOutput>) -> Self {
        let mut alert = alert.clone();
        for key in TRIAGE_CONTEXT_KEYS {
            alert.extra.remove(key);
        }
        Self {
            alert,
            ml_prediction: detection.map(|d| d.prediction.clone()),
            ml_confidence: detection.map(|d| d.confidence),
            detection: detection.cloned(),
        }
    }
}

/// Triage collaborator response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageAssessment {
    pub severity: Severity,
    pub confidence: f64,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default, alias = "detailed_analysis")]
    pub analysis: Option<String>,
    #[serde(default)]
    pub iocs: Vec<Ioc>,
    #[serde(default)]
    pub mitre_techniques: Vec<String>,
    #[serde(default)]
    pub mitre_tactics: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
}

#[async_trait::async_trait]
pub trait TriageService: Collaborator {
    async fn analyze(&self, request: &TriageRequest) -> Result<TriageAssessment, ServiceError>;
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalRequest<'a> {
    pub query: &'a str,
    pub collection: &'a str,
    pub top_k: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalResponse {
    #[serde(default)]
    pub results: Vec<ContextDocument>,
}

#[async_trait::async_trait]
pub trait EnrichmentService: Collaborator {
    async fn retrieve(
        &self,
        query: &str,
        collection: &str,
        top_k: usize,
    ) -> Result<Vec<ContextDocument>, ServiceError>;
}

// ---------------------------------------------------------------------------
// Case management
// ---------------------------------------------------------------------------

/// TLP/PAP amber.
pub const AMBER: u8 = 2;

/// A new investigation case.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseRecord {
    pub title: String,
    pub description: String,
    /// 1 (low) to 4 (critical).
    pub severity: u8,
    pub tags: Vec<String>,
    pub tlp: u8,
    pub pap: u8,
    pub custom_fields: Map<String, Value>,
}

/// Case id from a creation response: `id`, else `_id`. TheHive sends both.
fn created_case_id(response: &Map<String, Value>) -> Result<String, ServiceError> {
    match response.get("id").or_else(|| response.get("_id")) {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(ServiceError::Malformed(format!("unexpected case id {other}"))),
        None => Err(ServiceError::Malformed("case response has no id".to_string())),
    }
}

#[async_trait::async_trait]
pub trait CaseService: Collaborator {
    /// Create the case and return its identifier.
    async fn create_case(&self, record: &CaseRecord) -> Result<String, ServiceError>;

    /// Link for a created case.
    fn case_url(&self, case_id: &str) -> String;
}

// ---------------------------------------------------------------------------
// HTTP implementations
// ---------------------------------------------------------------------------

pub struct HttpDetection {
    client: ServiceClient,
}

impl HttpDetection {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Collaborator for HttpDetection {
    fn name(&self) -> &str {
        self.client.name()
    }

    async fn health_check(&self) -> bool {
        self.client.health_check().await
    }
}

#[async_trait::async_trait]
impl DetectionService for HttpDetection {
    async fn predict(&self, features: &[f64], model_name: &str) -> Result<Prediction, ServiceError> {
        let request = PredictRequest { features, model_name };
        self.client.post("/predict", &request).await
    }
}

pub struct HttpTriage {
    client: ServiceClient,
}

impl HttpTriage {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Collaborator for HttpTriage {
    fn name(&self) -> &str {
        self.client.name()
    }

    async fn health_check(&self) -> bool {
        self.client.health_check().await
    }
}

#[async_trait::async_trait]
impl TriageService for HttpTriage {
    async fn analyze(&self, request: &TriageRequest) -> Result<TriageAssessment, ServiceError> {
        self.client.post("/analyze", request).await
    }
}

pub struct HttpEnrichment {
    client: ServiceClient,
}

impl HttpEnrichment {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Collaborator for HttpEnrichment {
    fn name(&self) -> &str {
        self.client.name()
    }

    async fn health_check(&self) -> bool {
        self.client.health_check().await
    }
}

#[async_trait::async_trait]
impl EnrichmentService for HttpEnrichment {
    async fn retrieve(
        &self,
        query: &str,
        collection: &str,
        top_k: usize,
    ) -> Result<Vec<ContextDocument>, ServiceError> {
        let request = RetrievalRequest { query, collection, top_k };
        let response: RetrievalResponse = self.client.post("/retrieve", &request).await?;
        Ok(response.results)
    }
}

pub struct HttpCases {
    client: ServiceClient,
}

impl HttpCases {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Collaborator for HttpCases {
    fn name(&self) -> &str {
        self.client.name()
    }

    async fn health_check(&self) -> bool {
        self.client.health_check().await
    }
}

#[async_trait::async_trait]
impl CaseService for HttpCases {
    async fn create_case(&self, record: &CaseRecord) -> Result<String, ServiceError> {
        let created: Map<String, Value> = self.client.post("/case", record).await?;
        created_case_id(&created)
    }

    fn case_url(&self, case_id: &str) -> String {
        format!("{}/case/{}", self.client.base_url(), case_id)
    }
}

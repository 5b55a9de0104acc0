//! Local substitutes for the detection and triage collaborators.
//!
//! Both functions look only at the alert, never fail, and mark their output
//! with `fallback: true` and a confidence below anything a real model
//! reports.

use std::collections::BTreeMap;

use tracing::warn;

use crate::pipeline::types::{Alert, DetectionOutput, Recommendation, Severity, TriageOutput};

const CRITICAL_KEYWORDS: &[&str] = &["ransomware", "cryptolocker", "exploit"];
const HIGH_KEYWORDS: &[&str] = &["brute", "force", "scan"];

pub const DETECTION_CONFIDENCE: f64 = 0.6;
pub const TRIAGE_CONFIDENCE: f64 = 0.5;
pub const TRIAGE_ANALYSIS: &str = "Automated analysis unavailable. Manual review recommended.";
pub const TRIAGE_RECOMMENDATIONS: [&str; 2] = ["Review alert manually", "Check system logs"];

pub struct FallbackHandler;

impl FallbackHandler {
    /// Keyword classification over the whole serialized alert.
    pub fn detection(alert: &Alert) -> DetectionOutput {
        warn!(alert_id = %alert.id, "detection service unavailable, using keyword fallback");

        let severity = match serde_json::to_string(alert) {
            Ok(text) => Self::keyword_severity(&text.to_lowercase()),
            Err(e) => {
                warn!(alert_id = %alert.id, error = %e, "alert not serializable, assuming info");
                Severity::Info
            }
        };

        let prediction = if severity >= Severity::High { "ATTACK" } else { "BENIGN" };
        DetectionOutput {
            prediction: prediction.to_string(),
            confidence: DETECTION_CONFIDENCE,
            probabilities: BTreeMap::new(),
            model: None,
            severity: Some(severity),
            duration_ms: 0.0,
            fallback: true,
        }
    }

    /// Template triage: rule level if the alert has one, otherwise medium.
    pub fn triage(alert: &Alert) -> TriageOutput {
        warn!(alert_id = %alert.id, "triage service unavailable, using template fallback");

        let severity = alert
            .rule_level()
            .map(Severity::from_rule_level)
            .unwrap_or(Severity::Medium);

        TriageOutput {
            severity,
            confidence: TRIAGE_CONFIDENCE,
            summary: None,
            analysis: Some(TRIAGE_ANALYSIS.to_string()),
            iocs: Vec::new(),
            mitre_techniques: Vec::new(),
            mitre_tactics: Vec::new(),
            recommendations: TRIAGE_RECOMMENDATIONS.iter().map(|r| Recommendation::from(*r)).collect(),
            duration_ms: 0.0,
            fallback: true,
        }
    }

    fn keyword_severity(text: &str) -> Severity {
        if CRITICAL_KEYWORDS.iter().any(|k| text.contains(k)) {
            Severity::Critical
        } else if HIGH_KEYWORDS.iter().any(|k| text.contains(k)) {
            Severity::High
        } else {
            Severity::Medium
        }
    }
}

//! Persisted data model: signatures, baselines, events and their follow-ups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::features::FeatureVector;

/// Event severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// Detector that produced an event. Determines the bus topic namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Puf,
    PowerAnalysis,
    Thermal,
    Leakage,
    Operator,
}

impl EventSource {
    /// Bus topic prefix, e.g. `security.power_analysis`.
    pub fn topic_prefix(&self) -> &'static str {
        match self {
            Self::Puf => "security.puf",
            Self::PowerAnalysis => "security.power_analysis",
            Self::Thermal => "security.thermal",
            Self::Leakage => "security.leakage",
            Self::Operator => "security.operator",
        }
    }
}

/// Thermodynamic fingerprint of one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PufSignature {
    pub device_id: String,
    /// Hex SHA-256 of the canonical feature vector serialization.
    pub fingerprint: String,
    pub thermodynamic_feature_vector: FeatureVector,
    pub reproducibility_score: f64,
    /// Set when reproducibility fell below the configured threshold.
    pub low_confidence: bool,
    pub created_at: DateTime<Utc>,
    pub last_validated: Option<DateTime<Utc>>,
    pub validation_count: u64,
    pub failed_validations: u64,
}

/// Power consumption baseline for one (device, operation) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PowerBaseline {
    pub device_id: String,
    pub operation: String,
    pub trace_count: usize,
    /// Mean of per-trace mean power (mW).
    pub mean_power: f64,
    /// Standard deviation of per-trace mean power (mW).
    pub std_power: f64,
    /// Per-sample mean across traces.
    pub envelope_mean: Vec<f64>,
    /// Per-sample standard deviation across traces.
    pub envelope_std: Vec<f64>,
    /// Per-bin mean of the magnitude spectrum (bins 1..=K).
    pub spectrum_mean: Vec<f64>,
    /// Per-bin standard deviation of the magnitude spectrum.
    pub spectrum_std: Vec<f64>,
    /// Variance of per-trace variances.
    pub variance_of_variances: f64,
    pub established_at: DateTime<Utc>,
}

/// Normal operating temperature for one device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThermalBaseline {
    pub device_id: String,
    pub mean_temperature_c: f64,
    pub std_temperature_c: f64,
    pub sample_count: usize,
    pub established_at: DateTime<Utc>,
}

/// An immutable detection record. Only `matched_signature_id` is filled in
/// by the registry, before the event is first persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityEvent {
    pub event_id: String,
    pub event_type: String,
    pub source: EventSource,
    pub device_id: String,
    pub severity: Severity,
    pub confidence: f64,
    pub thermodynamic_data: serde_json::Value,
    pub threat_category: String,
    pub matched_signature_id: Option<String>,
    pub detected_at: DateTime<Utc>,
}

/// Reference pattern for a known attack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreatSignature {
    pub signature_id: String,
    pub threat_type: String,
    pub thermodynamic_fingerprint: serde_json::Value,
    pub severity: Severity,
    pub mitigation_strategy: String,
    pub created_at: DateTime<Utc>,
}

/// One response taken for an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MitigationAction {
    pub action_id: String,
    pub event_id: String,
    pub action_type: String,
    pub executed_by: String,
    pub automated: bool,
    pub result: String,
    pub timestamp: DateTime<Utc>,
}

/// Write-once evidence attached to an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForensicEvidence {
    pub evidence_id: String,
    pub event_id: String,
    pub evidence_type: String,
    pub data: serde_json::Value,
    /// Hex SHA-256 of the canonical JSON encoding of `data`, fixed at write time.
    pub cryptographic_hash: String,
    pub stored_at: DateTime<Utc>,
}

/// Mitigation action types emitted by the detectors.
pub mod actions {
    pub const EMERGENCY_MEMORY_WIPE: &str = "emergency_memory_wipe";
    pub const POWER_NOISE_INJECTION: &str = "power_noise_injection";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn test_severity_parse_and_serde() {
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
        assert!("urgent".parse::<Severity>().is_err());
        assert_eq!(serde_json::to_string(&Severity::High).unwrap(), "\"high\"");
    }

    #[test]
    fn test_topic_prefixes() {
        assert_eq!(EventSource::Puf.topic_prefix(), "security.puf");
        assert_eq!(EventSource::PowerAnalysis.topic_prefix(), "security.power_analysis");
        assert_eq!(EventSource::Thermal.topic_prefix(), "security.thermal");
        assert_eq!(EventSource::Leakage.topic_prefix(), "security.leakage");
    }
}

//! Cross-node threat sharing capability.
//!
//! Used only for critical events. Broadcasts are spawned off the detection
//! path; their failure is logged and counted, never surfaced to the caller
//! that registered the event.

use std::sync::{Mutex, PoisonError};

use crate::model::{Severity, ThreatSignature};

#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error("federation peer unreachable: {0}")]
    Unreachable(String),

    #[error("federation broadcast rejected: {0}")]
    Rejected(String),
}

pub trait FederationConnector: Send + Sync {
    fn name(&self) -> &str;

    fn broadcast_threat_signature(
        &self,
        signature: &ThreatSignature,
        severity: Severity,
        affected_domains: &[String],
    ) -> Result<(), FederationError>;
}

/// A broadcast a connector accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct Broadcast {
    pub signature: ThreatSignature,
    pub severity: Severity,
    pub affected_domains: Vec<String>,
}

/// Connector that logs broadcasts locally instead of sending them.
#[derive(Default)]
pub struct LoggingFederation {
    sent: Mutex<Vec<Broadcast>>,
}

impl LoggingFederation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broadcasts(&self) -> Vec<Broadcast> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl FederationConnector for LoggingFederation {
    fn name(&self) -> &str {
        "logging-federation"
    }

    fn broadcast_threat_signature(
        &self,
        signature: &ThreatSignature,
        severity: Severity,
        affected_domains: &[String],
    ) -> Result<(), FederationError> {
        log::info!(
            "broadcasting {severity} threat {} ({}) to [{}]",
            signature.signature_id,
            signature.threat_type,
            affected_domains.join(", ")
        );
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Broadcast {
                signature: signature.clone(),
                severity,
                affected_domains: affected_domains.to_vec(),
            });
        Ok(())
    }
}

//! Persistence capability.
//!
//! The engine keeps its authoritative in-memory copies and writes through to
//! a [`SecurityStore`]. Events, mitigation actions and forensic evidence are
//! append-only; evidence ids are write-once.

pub mod file;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use crate::config::RegistryConfig;
use crate::model::{
    ForensicEvidence, MitigationAction, PowerBaseline, PufSignature, SecurityEvent, ThermalBaseline,
    ThreatSignature,
};

pub use file::JsonFileStore;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("{kind} {id} already exists")]
    Conflict { kind: &'static str, id: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Contract a persistence backend must satisfy.
///
/// Implementations are synchronous; async callers run them on the blocking
/// pool. Loads return everything of a kind so the engine can rebuild its
/// state on startup.
pub trait SecurityStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    // -- PUF signatures -----------------------------------------------------

    fn save_signature(&self, signature: &PufSignature) -> Result<(), StoreError>;
    fn load_signatures(&self) -> Result<Vec<PufSignature>, StoreError>;
    /// Returns whether a signature was removed.
    fn delete_signature(&self, device: &str) -> Result<bool, StoreError>;

    // -- Baselines ------------------------------------------------------------

    fn save_power_baseline(&self, baseline: &PowerBaseline) -> Result<(), StoreError>;
    fn load_power_baselines(&self) -> Result<Vec<PowerBaseline>, StoreError>;
    fn save_thermal_baseline(&self, baseline: &ThermalBaseline) -> Result<(), StoreError>;
    fn load_thermal_baselines(&self) -> Result<Vec<ThermalBaseline>, StoreError>;

    // -- Threat intelligence ----------------------------------------------------

    fn save_threat_signature(&self, signature: &ThreatSignature) -> Result<(), StoreError>;
    fn load_threat_signatures(&self) -> Result<Vec<ThreatSignature>, StoreError>;
    fn delete_threat_signature(&self, signature_id: &str) -> Result<bool, StoreError>;

    // -- Append-only logs -------------------------------------------------------

    fn append_event(&self, event: &SecurityEvent) -> Result<(), StoreError>;
    fn load_events(&self) -> Result<Vec<SecurityEvent>, StoreError>;
    fn mark_false_positive(&self, event_id: &str) -> Result<(), StoreError>;
    fn load_false_positives(&self) -> Result<Vec<String>, StoreError>;
    fn append_mitigation(&self, action: &MitigationAction) -> Result<(), StoreError>;
    fn load_mitigations(&self) -> Result<Vec<MitigationAction>, StoreError>;

    /// Fails with [`StoreError::Conflict`] if the evidence id already exists.
    fn insert_evidence(&self, evidence: &ForensicEvidence) -> Result<(), StoreError>;
    fn load_evidence(&self) -> Result<Vec<ForensicEvidence>, StoreError>;
}

/// Key of a power baseline in keyed collections.
pub(crate) fn power_key(device: &str, operation: &str) -> String {
    crate::error::device_operation_key(device, operation)
}

/// Attempts and first backoff of a persisted write; the backoff doubles on
/// each retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self {
            attempts: config.store_retry_attempts,
            backoff: config.store_retry_backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RegistryConfig::default())
    }
}

/// Run `op` against `store` on the blocking pool, retrying with exponential
/// backoff. Conflicts are returned at once.
pub(crate) async fn write_with_retry<F>(
    store: &Arc<dyn SecurityStore>,
    policy: RetryPolicy,
    what: &str,
    op: F,
) -> Result<(), StoreError>
where
    F: Fn(&dyn SecurityStore) -> Result<(), StoreError> + Send + Sync + 'static,
{
    let op = Arc::new(op);
    let attempts = policy.attempts.max(1);
    let mut backoff = policy.backoff;
    let mut attempt = 1;
    loop {
        let store = Arc::clone(store);
        let op = Arc::clone(&op);
        let result = match tokio::task::spawn_blocking(move || op(store.as_ref())).await {
            Ok(r) => r,
            Err(e) => Err(StoreError::Unavailable(format!("store task failed: {e}"))),
        };
        match result {
            Ok(()) => return Ok(()),
            Err(e @ StoreError::Conflict { .. }) => return Err(e),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                log::warn!("store write of {what} failed (attempt {attempt}/{attempts}): {e}; retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}

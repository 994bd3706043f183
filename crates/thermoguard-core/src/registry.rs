//! Security event registry.
//!
//! The sink for every detection. The in-memory log is authoritative and
//! append-only; the backing store is written through with bounded retries.
//! If every retry fails the event stays in memory, is logged locally and is
//! counted as a store write failure: persistence is best-effort.
//!
//! Registration order for one event:
//! 1. critical events are logged locally first
//! 2. threat signature matching (same `threat_type`, [`payload_similarity`])
//! 3. append to the in-memory log, then persist
//! 4. bus notifications (`<source prefix>.<event_type>` and
//!    [`EVENT_REGISTERED`])
//! 5. for critical events, a spawned federation broadcast that is never
//!    awaited by the caller

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::bus::{EVENT_REGISTERED, EventBus};
use crate::config::RegistryConfig;
use crate::error::{GuardError, Result, validate_device};
use crate::features::payload_similarity;
use crate::federation::FederationConnector;
use crate::model::{
    EventSource, ForensicEvidence, MitigationAction, SecurityEvent, Severity, ThreatSignature, actions,
};
use crate::store::{RetryPolicy, SecurityStore, StoreError, write_with_retry};

/// Input to [`SecurityRegistry::register_security_event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSecurityEvent {
    pub event_type: String,
    pub source: EventSource,
    pub device_id: String,
    pub severity: Severity,
    pub confidence: f64,
    pub data: serde_json::Value,
    pub threat_category: String,
}

/// Input to [`SecurityRegistry::register_threat_signature`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewThreatSignature {
    pub threat_type: String,
    pub thermodynamic_fingerprint: serde_json::Value,
    pub severity: Severity,
    pub mitigation_strategy: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    AtRisk,
    Compromised,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceHealth {
    pub device_id: String,
    /// 100 for a device with no active threats, falling with each one.
    pub health_score: f64,
    pub status: HealthStatus,
    pub total_events: usize,
    pub events_by_severity: BTreeMap<String, usize>,
    pub active_threats: usize,
    pub false_positives: usize,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStatistics {
    pub total_events: usize,
    pub events_by_severity: BTreeMap<String, usize>,
    pub events_by_type: BTreeMap<String, usize>,
    pub signature_matches: u64,
    pub false_positives: usize,
    pub threat_signatures: usize,
    pub mitigation_actions: usize,
    pub forensic_evidence: usize,
    pub store_write_failures: u64,
    pub broadcasts_attempted: u64,
    pub broadcasts_failed: u64,
}

#[derive(Default)]
struct Counters {
    signature_matches: AtomicU64,
    store_write_failures: AtomicU64,
    broadcasts_attempted: AtomicU64,
    broadcasts_failed: AtomicU64,
}

/// Mitigation strategy attached to a broadcast when no signature matched.
pub fn default_mitigation(event_type: &str) -> &'static str {
    match event_type {
        "cold_boot_attack_detected" | "freezing_temperature_detected" => actions::EMERGENCY_MEMORY_WIPE,
        "spa_attack_detected" | "dpa_attack_detected" => actions::POWER_NOISE_INJECTION,
        "puf_clone_detected" | "puf_clone_suspected" => "revoke_device_credentials",
        "information_leakage_detected" => "apply_side_channel_countermeasures",
        _ => "investigate",
    }
}

/// Hex SHA-256 over the canonical JSON encoding of `data` (object keys sorted).
pub fn evidence_hash(data: &serde_json::Value) -> std::result::Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(data)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn health_weight(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 2.0,
        Severity::Medium => 10.0,
        Severity::High => 25.0,
        Severity::Critical => 50.0,
    }
}

pub struct SecurityRegistry {
    config: RegistryConfig,
    similarity_tolerance: f64,
    store: Arc<dyn SecurityStore>,
    federation: Arc<dyn FederationConnector>,
    bus: EventBus,
    events: RwLock<Vec<SecurityEvent>>,
    signatures: RwLock<BTreeMap<String, ThreatSignature>>,
    false_positives: RwLock<HashSet<String>>,
    mitigations: RwLock<Vec<MitigationAction>>,
    evidence: RwLock<Vec<ForensicEvidence>>,
    counters: Arc<Counters>,
}

impl SecurityRegistry {
    /// Build the registry, loading persisted history from `store`.
    pub fn load(
        config: RegistryConfig,
        similarity_tolerance: f64,
        store: Arc<dyn SecurityStore>,
        federation: Arc<dyn FederationConnector>,
        bus: EventBus,
    ) -> Result<Self> {
        let events = store.load_events()?;
        let signatures = store
            .load_threat_signatures()?
            .into_iter()
            .map(|s| (s.signature_id.clone(), s))
            .collect();
        let false_positives = store.load_false_positives()?.into_iter().collect();
        let mitigations = store.load_mitigations()?;
        let evidence = store.load_evidence()?;
        log::debug!("registry loaded {} events from {}", events.len(), store.name());
        Ok(Self {
            config,
            similarity_tolerance,
            store,
            federation,
            bus,
            events: RwLock::new(events),
            signatures: RwLock::new(signatures),
            false_positives: RwLock::new(false_positives),
            mitigations: RwLock::new(mitigations),
            evidence: RwLock::new(evidence),
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Run a store write with exponential-backoff retries. Conflicts are not
    /// retried. Exhausted retries are counted as a store write failure.
    async fn persist<F>(&self, what: &str, op: F) -> std::result::Result<(), StoreError>
    where
        F: Fn(&dyn SecurityStore) -> std::result::Result<(), StoreError> + Send + Sync + 'static,
    {
        let result = write_with_retry(&self.store, RetryPolicy::from_config(&self.config), what, op).await;
        if let Err(e) = &result
            && !matches!(e, StoreError::Conflict { .. })
        {
            self.counters.store_write_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Record a detection. Returns the new event id.
    ///
    /// Never fails because of the store, the bus or the federation peer; only
    /// an invalid device id is rejected.
    pub async fn register_security_event(&self, new: NewSecurityEvent) -> Result<String> {
        validate_device(&new.device_id)?;
        let event_id = Uuid::new_v4().to_string();

        if new.severity == Severity::Critical {
            log::error!(
                "[{}] CRITICAL {} (event {event_id}, confidence {:.2})",
                new.device_id,
                new.event_type,
                new.confidence
            );
        }

        let matched = self.match_signature(&new.event_type, &new.data);
        if let Some((id, similarity)) = &matched {
            self.counters.signature_matches.fetch_add(1, Ordering::Relaxed);
            log::info!(
                "[{}] {} matches threat signature {id} (similarity {similarity:.3})",
                new.device_id,
                new.event_type
            );
        }

        let event = SecurityEvent {
            event_id: event_id.clone(),
            event_type: new.event_type,
            source: new.source,
            device_id: new.device_id,
            severity: new.severity,
            confidence: new.confidence.clamp(0.0, 1.0),
            thermodynamic_data: new.data,
            threat_category: new.threat_category,
            matched_signature_id: matched.map(|(id, _)| id),
            detected_at: Utc::now(),
        };

        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());

        let persisted = event.clone();
        if let Err(e) = self
            .persist("event", move |s| s.append_event(&persisted))
            .await
        {
            log::error!(
                "[{}] event {} ({}, {}) not persisted, kept in memory only: {e}",
                event.device_id,
                event.event_id,
                event.event_type,
                event.severity
            );
        }

        self.bus.publish(
            format!("{}.{}", event.source.topic_prefix(), event.event_type),
            &event,
        );
        self.bus.publish(EVENT_REGISTERED, &event);

        if event.severity == Severity::Critical {
            self.spawn_broadcast(&event);
        }
        Ok(event_id)
    }

    /// Best-matching signature of the same threat type at or above the
    /// configured threshold.
    fn match_signature(&self, event_type: &str, data: &serde_json::Value) -> Option<(String, f64)> {
        let signatures = self.signatures.read().unwrap_or_else(PoisonError::into_inner);
        signatures
            .values()
            .filter(|s| s.threat_type == event_type)
            .map(|s| {
                let sim = payload_similarity(&s.thermodynamic_fingerprint, data, self.similarity_tolerance);
                (s.signature_id.clone(), sim)
            })
            .filter(|(_, sim)| *sim >= self.config.signature_match_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    fn spawn_broadcast(&self, event: &SecurityEvent) {
        let known = event
            .matched_signature_id
            .as_ref()
            .and_then(|id| self.signatures.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned());
        let signature = known.unwrap_or_else(|| ThreatSignature {
            signature_id: Uuid::new_v4().to_string(),
            threat_type: event.event_type.clone(),
            thermodynamic_fingerprint: event.thermodynamic_data.clone(),
            severity: event.severity,
            mitigation_strategy: default_mitigation(&event.event_type).to_string(),
            created_at: Utc::now(),
        });
        let severity = event.severity;
        let domains = self.config.affected_domains.clone();
        let federation = Arc::clone(&self.federation);
        let counters = Arc::clone(&self.counters);
        let timeout = self.config.broadcast_timeout;
        let event_id = event.event_id.clone();

        counters.broadcasts_attempted.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let task = tokio::task::spawn_blocking(move || {
                federation.broadcast_threat_signature(&signature, severity, &domains)
            });
            let failure = match tokio::time::timeout(timeout, task).await {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(e))) => Some(e.to_string()),
                Ok(Err(join)) => Some(join.to_string()),
                Err(_) => Some(format!("timed out after {timeout:?}")),
            };
            if let Some(reason) = failure {
                counters.broadcasts_failed.fetch_add(1, Ordering::Relaxed);
                log::error!("federation broadcast for event {event_id} failed: {reason}");
            }
        });
    }

    pub fn event(&self, event_id: &str) -> Option<SecurityEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|e| e.event_id == event_id)
            .cloned()
    }

    fn require_event(&self, event_id: &str) -> Result<()> {
        let exists = self
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|e| e.event_id == event_id);
        if exists {
            Ok(())
        } else {
            Err(GuardError::UnknownEvent(event_id.to_string()))
        }
    }

    /// Snapshot of the event log, oldest first.
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn events_for_device(&self, device: &str) -> Vec<SecurityEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.device_id == device)
            .cloned()
            .collect()
    }

    pub async fn mark_false_positive(&self, event_id: &str) -> Result<()> {
        self.require_event(event_id)?;
        let inserted = self
            .false_positives
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event_id.to_string());
        if inserted {
            log::info!("event {event_id} marked as false positive");
            let id = event_id.to_string();
            if let Err(e) = self.persist("false positive", move |s| s.mark_false_positive(&id)).await {
                log::warn!("false-positive mark for {event_id} not persisted: {e}");
            }
        }
        Ok(())
    }

    pub fn is_false_positive(&self, event_id: &str) -> bool {
        self.false_positives
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(event_id)
    }

    /// Non-false-positive events from the last `window_minutes` whose data is
    /// at least `similarity_threshold` similar to `pattern`, oldest first.
    pub fn correlate_threats(
        &self,
        pattern: &serde_json::Value,
        window_minutes: i64,
        similarity_threshold: f64,
    ) -> Vec<SecurityEvent> {
        let since = Utc::now() - chrono::Duration::minutes(window_minutes.max(0));
        let false_positives = self.false_positives.read().unwrap_or_else(PoisonError::into_inner).clone();
        let mut matches: Vec<SecurityEvent> = self
            .events()
            .into_iter()
            .filter(|e| e.detected_at >= since && !false_positives.contains(&e.event_id))
            .filter(|e| {
                payload_similarity(pattern, &e.thermodynamic_data, self.similarity_tolerance)
                    >= similarity_threshold
            })
            .collect();
        matches.sort_by_key(|e| e.detected_at);
        matches
    }

    /// Non-false-positive events within the active window. With no filter,
    /// events of medium severity or worse; with a filter, exactly that
    /// severity. Most severe first, then newest first.
    pub fn get_active_threats(&self, severity: Option<Severity>) -> Vec<SecurityEvent> {
        let since = Utc::now() - chrono::Duration::hours(self.config.active_window_hours);
        let false_positives = self.false_positives.read().unwrap_or_else(PoisonError::into_inner).clone();
        let mut active: Vec<SecurityEvent> = self
            .events()
            .into_iter()
            .filter(|e| e.detected_at >= since && !false_positives.contains(&e.event_id))
            .filter(|e| match severity {
                Some(s) => e.severity == s,
                None => e.severity >= Severity::Medium,
            })
            .collect();
        active.sort_by(|a, b| b.severity.cmp(&a.severity).then(b.detected_at.cmp(&a.detected_at)));
        active
    }

    // -----------------------------------------------------------------------
    // Threat signatures
    // -----------------------------------------------------------------------

    pub async fn register_threat_signature(&self, new: NewThreatSignature) -> Result<ThreatSignature> {
        let signature = ThreatSignature {
            signature_id: Uuid::new_v4().to_string(),
            threat_type: new.threat_type,
            thermodynamic_fingerprint: new.thermodynamic_fingerprint,
            severity: new.severity,
            mitigation_strategy: new.mitigation_strategy,
            created_at: Utc::now(),
        };
        self.signatures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(signature.signature_id.clone(), signature.clone());
        let persisted = signature.clone();
        if let Err(e) = self
            .persist("threat signature", move |s| s.save_threat_signature(&persisted))
            .await
        {
            log::warn!("threat signature {} not persisted: {e}", signature.signature_id);
        }
        log::info!(
            "registered threat signature {} for {}",
            signature.signature_id,
            signature.threat_type
        );
        Ok(signature)
    }

    pub fn list_threat_signatures(&self) -> Vec<ThreatSignature> {
        self.signatures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Returns whether the signature existed.
    pub async fn remove_threat_signature(&self, signature_id: &str) -> Result<bool> {
        let removed = self
            .signatures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(signature_id)
            .is_some();
        if removed {
            let id = signature_id.to_string();
            if let Err(e) = self
                .persist("threat signature removal", move |s| s.delete_threat_signature(&id).map(|_| ()))
                .await
            {
                log::warn!("removal of threat signature {signature_id} not persisted: {e}");
            }
        }
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Mitigations and evidence
    // -----------------------------------------------------------------------

    pub async fn record_mitigation_action(
        &self,
        event_id: &str,
        action_type: &str,
        executed_by: &str,
        automated: bool,
        result: &str,
    ) -> Result<MitigationAction> {
        self.require_event(event_id)?;
        let action = MitigationAction {
            action_id: Uuid::new_v4().to_string(),
            event_id: event_id.to_string(),
            action_type: action_type.to_string(),
            executed_by: executed_by.to_string(),
            automated,
            result: result.to_string(),
            timestamp: Utc::now(),
        };
        self.mitigations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(action.clone());
        let persisted = action.clone();
        if let Err(e) = self
            .persist("mitigation action", move |s| s.append_mitigation(&persisted))
            .await
        {
            log::warn!("mitigation action {} not persisted: {e}", action.action_id);
        }
        Ok(action)
    }

    pub fn mitigations_for_event(&self, event_id: &str) -> Vec<MitigationAction> {
        self.mitigations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|a| a.event_id == event_id)
            .cloned()
            .collect()
    }

    pub fn mitigations(&self) -> Vec<MitigationAction> {
        self.mitigations.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Attach write-once evidence to an event. The hash is fixed here and
    /// never recomputed.
    pub async fn store_forensic_evidence(
        &self,
        event_id: &str,
        evidence_type: &str,
        data: serde_json::Value,
    ) -> Result<ForensicEvidence> {
        self.require_event(event_id)?;
        let cryptographic_hash = evidence_hash(&data).map_err(StoreError::from)?;
        let evidence = ForensicEvidence {
            evidence_id: Uuid::new_v4().to_string(),
            event_id: event_id.to_string(),
            evidence_type: evidence_type.to_string(),
            cryptographic_hash,
            data,
            stored_at: Utc::now(),
        };
        self.evidence
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(evidence.clone());
        let persisted = evidence.clone();
        if let Err(e) = self
            .persist("forensic evidence", move |s| s.insert_evidence(&persisted))
            .await
        {
            log::error!(
                "forensic evidence {} for event {event_id} not persisted: {e}",
                evidence.evidence_id
            );
        }
        Ok(evidence)
    }

    pub fn evidence_for_event(&self, event_id: &str) -> Vec<ForensicEvidence> {
        self.evidence
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.event_id == event_id)
            .cloned()
            .collect()
    }

    /// Recompute the hash of stored evidence and compare it with the
    /// write-time hash. `None` if the evidence id is unknown.
    pub fn verify_evidence(&self, evidence_id: &str) -> Option<bool> {
        self.evidence
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|e| e.evidence_id == evidence_id)
            .map(|e| evidence_hash(&e.data).is_ok_and(|h| h == e.cryptographic_hash))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_device_security_health(&self, device: &str) -> DeviceHealth {
        let since = Utc::now() - chrono::Duration::hours(self.config.active_window_hours);
        let false_positives = self.false_positives.read().unwrap_or_else(PoisonError::into_inner).clone();
        let events = self.events_for_device(device);

        let mut events_by_severity = BTreeMap::new();
        let mut active_threats = 0;
        let mut penalty = 0.0;
        let mut worst_active: Option<Severity> = None;
        let mut fp_count = 0;
        for e in &events {
            if false_positives.contains(&e.event_id) {
                fp_count += 1;
                continue;
            }
            *events_by_severity.entry(e.severity.to_string()).or_insert(0) += 1;
            if e.detected_at >= since {
                penalty += health_weight(e.severity);
                if e.severity >= Severity::Medium {
                    active_threats += 1;
                }
                worst_active = worst_active.max(Some(e.severity));
            }
        }
        let health_score = (100.0 - penalty).max(0.0);
        let status = match worst_active {
            Some(Severity::Critical) => HealthStatus::Compromised,
            _ if health_score <= 0.0 => HealthStatus::Compromised,
            Some(Severity::High) | Some(Severity::Medium) => HealthStatus::AtRisk,
            _ if health_score < 80.0 => HealthStatus::AtRisk,
            _ => HealthStatus::Healthy,
        };

        DeviceHealth {
            device_id: device.to_string(),
            health_score,
            status,
            total_events: events.len(),
            events_by_severity,
            active_threats,
            false_positives: fp_count,
            last_event_at: events.iter().map(|e| e.detected_at).max(),
        }
    }

    pub fn statistics(&self) -> RegistryStatistics {
        let events = self.events();
        let mut by_severity = BTreeMap::new();
        let mut by_type = BTreeMap::new();
        for e in &events {
            *by_severity.entry(e.severity.to_string()).or_insert(0) += 1;
            *by_type.entry(e.event_type.clone()).or_insert(0) += 1;
        }
        RegistryStatistics {
            total_events: events.len(),
            events_by_severity: by_severity,
            events_by_type: by_type,
            signature_matches: self.counters.signature_matches.load(Ordering::Relaxed),
            false_positives: self.false_positives.read().unwrap_or_else(PoisonError::into_inner).len(),
            threat_signatures: self.signatures.read().unwrap_or_else(PoisonError::into_inner).len(),
            mitigation_actions: self.mitigations.read().unwrap_or_else(PoisonError::into_inner).len(),
            forensic_evidence: self.evidence.read().unwrap_or_else(PoisonError::into_inner).len(),
            store_write_failures: self.counters.store_write_failures.load(Ordering::Relaxed),
            broadcasts_attempted: self.counters.broadcasts_attempted.load(Ordering::Relaxed),
            broadcasts_failed: self.counters.broadcasts_failed.load(Ordering::Relaxed),
        }
    }

    /// Retry budget of one persisted write, for callers sizing timeouts.
    pub fn max_persist_delay(&self) -> Duration {
        let mut total = Duration::ZERO;
        let mut backoff = self.config.store_retry_backoff;
        for _ in 1..self.config.store_retry_attempts.max(1) {
            total += backoff;
            backoff = backoff.saturating_mul(2);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::{FederationError, LoggingFederation};
    use crate::store::MemoryStore;
    use serde_json::json;

    struct DownFederation;

    impl FederationConnector for DownFederation {
        fn name(&self) -> &str {
            "down"
        }
        fn broadcast_threat_signature(
            &self,
            _signature: &ThreatSignature,
            _severity: Severity,
            _affected_domains: &[String],
        ) -> std::result::Result<(), FederationError> {
            Err(FederationError::Unreachable("peer offline".into()))
        }
    }

    fn registry_with(
        store: Arc<dyn SecurityStore>,
        federation: Arc<dyn FederationConnector>,
    ) -> SecurityRegistry {
        let config = RegistryConfig {
            store_retry_backoff: Duration::from_millis(1),
            ..Default::default()
        };
        SecurityRegistry::load(config, 0.30, store, federation, EventBus::new(64)).unwrap()
    }

    fn registry() -> SecurityRegistry {
        registry_with(Arc::new(MemoryStore::new()), Arc::new(LoggingFederation::new()))
    }

    fn spa(device: &str, mean: f64, severity: Severity) -> NewSecurityEvent {
        NewSecurityEvent {
            event_type: "spa_attack_detected".into(),
            source: EventSource::PowerAnalysis,
            device_id: device.into(),
            severity,
            confidence: 0.9,
            data: json!({"mean_power_mw": mean, "z_score": (mean - 100.0) / 5.0}),
            threat_category: "side_channel".into(),
        }
    }

    #[tokio::test]
    async fn test_register_persists_and_publishes() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry_with(store.clone(), Arc::new(LoggingFederation::new()));
        let mut rx = reg.bus().subscribe();
        let id = reg.register_security_event(spa("hsm-01", 140.0, Severity::High)).await.unwrap();

        assert_eq!(store.load_events().unwrap()[0].event_id, id);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.topic, "security.power_analysis.spa_attack_detected");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.topic, EVENT_REGISTERED);
        assert_eq!(second.event.event_id, id);
    }

    #[tokio::test]
    async fn test_invalid_device_rejected() {
        let reg = registry();
        let err = reg.register_security_event(spa("", 140.0, Severity::High)).await.unwrap_err();
        assert!(matches!(err, GuardError::InvalidDevice(_)));
    }

    #[tokio::test]
    async fn test_signature_match_boundary() {
        let pattern = json!({"mean_power_mw": 150.0, "z_score": 10.0});
        let data = spa("hsm-01", 140.0, Severity::High).data;
        let sim = payload_similarity(&pattern, &data, 0.30);
        assert!(sim > 0.0 && sim < 1.0, "{sim}");

        let at = |threshold: f64| {
            let config = RegistryConfig {
                signature_match_threshold: threshold,
                ..Default::default()
            };
            SecurityRegistry::load(
                config,
                0.30,
                Arc::new(MemoryStore::new()),
                Arc::new(LoggingFederation::new()),
                EventBus::new(8),
            )
            .unwrap()
        };

        for (threshold, should_match) in [(sim, true), (sim + 1e-9, false)] {
            let reg = at(threshold);
            let sig = reg
                .register_threat_signature(NewThreatSignature {
                    threat_type: "spa_attack_detected".into(),
                    thermodynamic_fingerprint: pattern.clone(),
                    severity: Severity::High,
                    mitigation_strategy: actions::POWER_NOISE_INJECTION.into(),
                })
                .await
                .unwrap();
            let id = reg.register_security_event(spa("hsm-01", 140.0, Severity::High)).await.unwrap();
            let matched = reg.event(&id).unwrap().matched_signature_id;
            assert_eq!(matched.is_some(), should_match, "threshold {threshold}");
            if should_match {
                assert_eq!(matched.unwrap(), sig.signature_id);
            }
        }
    }

    #[tokio::test]
    async fn test_signature_type_must_match() {
        let reg = registry();
        let data = spa("hsm-01", 140.0, Severity::High).data;
        reg.register_threat_signature(NewThreatSignature {
            threat_type: "dpa_attack_detected".into(),
            thermodynamic_fingerprint: data,
            severity: Severity::Critical,
            mitigation_strategy: actions::POWER_NOISE_INJECTION.into(),
        })
        .await
        .unwrap();
        let id = reg.register_security_event(spa("hsm-01", 140.0, Severity::High)).await.unwrap();
        assert!(reg.event(&id).unwrap().matched_signature_id.is_none());
    }

    #[tokio::test]
    async fn test_store_outage_keeps_event_in_memory() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let reg = registry_with(store.clone(), Arc::new(LoggingFederation::new()));
        let id = reg
            .register_security_event(spa("hsm-01", 140.0, Severity::Critical))
            .await
            .unwrap();
        assert!(reg.event(&id).is_some());
        assert!(store.load_events().unwrap().is_empty());
        assert_eq!(reg.statistics().store_write_failures, 1);
    }

    #[tokio::test]
    async fn test_critical_broadcast_failure_does_not_fail_registration() {
        let reg = registry_with(Arc::new(MemoryStore::new()), Arc::new(DownFederation));
        let id = reg
            .register_security_event(spa("hsm-01", 140.0, Severity::Critical))
            .await
            .unwrap();
        assert!(reg.event(&id).is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = reg.statistics();
        assert_eq!(stats.broadcasts_attempted, 1);
        assert_eq!(stats.broadcasts_failed, 1);
    }

    #[tokio::test]
    async fn test_only_critical_events_broadcast() {
        let federation = Arc::new(LoggingFederation::new());
        let reg = registry_with(Arc::new(MemoryStore::new()), federation.clone());
        reg.register_security_event(spa("hsm-01", 140.0, Severity::High)).await.unwrap();
        reg.register_security_event(spa("hsm-01", 190.0, Severity::Critical)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let sent = federation.broadcasts();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].severity, Severity::Critical);
        assert_eq!(sent[0].signature.mitigation_strategy, actions::POWER_NOISE_INJECTION);
        assert_eq!(sent[0].affected_domains, vec!["hardware_security".to_string()]);
    }

    #[tokio::test]
    async fn test_correlate_excludes_false_positives() {
        let reg = registry();
        let a = reg.register_security_event(spa("hsm-01", 140.0, Severity::High)).await.unwrap();
        let b = reg.register_security_event(spa("hsm-02", 141.0, Severity::High)).await.unwrap();
        reg.register_security_event(spa("hsm-03", 300.0, Severity::High)).await.unwrap();

        let pattern = json!({"mean_power_mw": 140.0});
        let ids: Vec<_> = reg
            .correlate_threats(&pattern, 60, 0.8)
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(ids, vec![a.clone(), b.clone()]);

        reg.mark_false_positive(&a).await.unwrap();
        let ids: Vec<_> = reg
            .correlate_threats(&pattern, 60, 0.8)
            .into_iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(ids, vec![b]);
        assert!(matches!(
            reg.mark_false_positive("nope").await,
            Err(GuardError::UnknownEvent(_))
        ));
    }

    #[tokio::test]
    async fn test_active_threats_filtering() {
        let reg = registry();
        let mut low = spa("hsm-01", 101.0, Severity::Low);
        low.event_type = "abnormal_temperature".into();
        reg.register_security_event(low).await.unwrap();
        reg.register_security_event(spa("hsm-01", 140.0, Severity::High)).await.unwrap();
        reg.register_security_event(spa("hsm-02", 190.0, Severity::Critical)).await.unwrap();

        let all = reg.get_active_threats(None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].severity, Severity::Critical);
        assert_eq!(reg.get_active_threats(Some(Severity::Low)).len(), 1);
        assert_eq!(reg.get_active_threats(Some(Severity::Medium)).len(), 0);
    }

    #[tokio::test]
    async fn test_mitigation_and_evidence() {
        let reg = registry();
        let id = reg.register_security_event(spa("hsm-01", 140.0, Severity::High)).await.unwrap();
        reg.record_mitigation_action(&id, actions::POWER_NOISE_INJECTION, "logging-actuator", true, "success")
            .await
            .unwrap();
        assert_eq!(reg.mitigations_for_event(&id).len(), 1);
        assert!(matches!(
            reg.record_mitigation_action("nope", "x", "op", false, "ok").await,
            Err(GuardError::UnknownEvent(_))
        ));

        let ev = reg
            .store_forensic_evidence(&id, "power_trace", json!({"b": [1.0, 2.0], "a": 3}))
            .await
            .unwrap();
        assert_eq!(ev.cryptographic_hash, evidence_hash(&json!({"a": 3, "b": [1.0, 2.0]})).unwrap());
        assert_eq!(reg.verify_evidence(&ev.evidence_id), Some(true));
        assert_eq!(reg.verify_evidence("missing"), None);
        assert_eq!(reg.evidence_for_event(&id).len(), 1);
    }

    #[tokio::test]
    async fn test_tampered_evidence_fails_verification() {
        let reg = registry();
        let id = reg.register_security_event(spa("hsm-01", 140.0, Severity::High)).await.unwrap();
        let a = reg.store_forensic_evidence(&id, "power_trace", json!({"peak": 140.0})).await.unwrap();
        let b = reg.store_forensic_evidence(&id, "power_trace", json!({"peak": 141.0})).await.unwrap();
        assert_ne!(a.cryptographic_hash, b.cryptographic_hash);
        assert_ne!(a.cryptographic_hash, evidence_hash(&json!(null)).unwrap());

        reg.evidence
            .write()
            .unwrap()
            .iter_mut()
            .filter(|e| e.evidence_id == a.evidence_id)
            .for_each(|e| e.data = json!({"peak": 100.0}));
        assert_eq!(reg.verify_evidence(&a.evidence_id), Some(false));
        assert_eq!(reg.verify_evidence(&b.evidence_id), Some(true));
    }

    #[tokio::test]
    async fn test_device_health() {
        let reg = registry();
        assert_eq!(reg.get_device_security_health("hsm-01").status, HealthStatus::Healthy);
        assert_eq!(reg.get_device_security_health("hsm-01").health_score, 100.0);

        let id = reg.register_security_event(spa("hsm-01", 140.0, Severity::High)).await.unwrap();
        let h = reg.get_device_security_health("hsm-01");
        assert_eq!(h.status, HealthStatus::AtRisk);
        assert_eq!(h.health_score, 75.0);
        assert_eq!(h.active_threats, 1);

        reg.mark_false_positive(&id).await.unwrap();
        let h = reg.get_device_security_health("hsm-01");
        assert_eq!(h.status, HealthStatus::Healthy);
        assert_eq!(h.false_positives, 1);

        reg.register_security_event(spa("hsm-01", 190.0, Severity::Critical)).await.unwrap();
        assert_eq!(
            reg.get_device_security_health("hsm-01").status,
            HealthStatus::Compromised
        );
    }

    #[tokio::test]
    async fn test_reload_restores_history() {
        let store: Arc<dyn SecurityStore> = Arc::new(MemoryStore::new());
        let reg = registry_with(Arc::clone(&store), Arc::new(LoggingFederation::new()));
        let id = reg.register_security_event(spa("hsm-01", 140.0, Severity::High)).await.unwrap();
        reg.mark_false_positive(&id).await.unwrap();

        let reloaded = registry_with(store, Arc::new(LoggingFederation::new()));
        assert_eq!(reloaded.events().len(), 1);
        assert!(reloaded.is_false_positive(&id));
    }

    #[test]
    fn test_max_persist_delay() {
        let reg = registry();
        // Backoff 1 ms, 3 attempts: 1 + 2.
        assert_eq!(reg.max_persist_delay(), Duration::from_millis(3));
    }
}

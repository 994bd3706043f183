//! Volatile store for tests, simulations and ephemeral deployments.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{SecurityStore, StoreError, power_key};
use crate::model::{
    ForensicEvidence, MitigationAction, PowerBaseline, PufSignature, SecurityEvent, ThermalBaseline,
    ThreatSignature,
};

#[derive(Default)]
struct State {
    signatures: BTreeMap<String, PufSignature>,
    power_baselines: BTreeMap<String, PowerBaseline>,
    thermal_baselines: BTreeMap<String, ThermalBaseline>,
    threat_signatures: BTreeMap<String, ThreatSignature>,
    false_positives: BTreeSet<String>,
    events: Vec<SecurityEvent>,
    mitigations: Vec<MitigationAction>,
    evidence: Vec<ForensicEvidence>,
    evidence_ids: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`StoreError::Unavailable`]
    /// until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn write(&self) -> Result<std::sync::MutexGuard<'_, State>, StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(self.read())
    }

    fn read(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SecurityStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn save_signature(&self, signature: &PufSignature) -> Result<(), StoreError> {
        self.write()?
            .signatures
            .insert(signature.device_id.clone(), signature.clone());
        Ok(())
    }

    fn load_signatures(&self) -> Result<Vec<PufSignature>, StoreError> {
        Ok(self.read().signatures.values().cloned().collect())
    }

    fn delete_signature(&self, device: &str) -> Result<bool, StoreError> {
        Ok(self.write()?.signatures.remove(device).is_some())
    }

    fn save_power_baseline(&self, baseline: &PowerBaseline) -> Result<(), StoreError> {
        self.write()?.power_baselines.insert(
            power_key(&baseline.device_id, &baseline.operation),
            baseline.clone(),
        );
        Ok(())
    }

    fn load_power_baselines(&self) -> Result<Vec<PowerBaseline>, StoreError> {
        Ok(self.read().power_baselines.values().cloned().collect())
    }

    fn save_thermal_baseline(&self, baseline: &ThermalBaseline) -> Result<(), StoreError> {
        self.write()?
            .thermal_baselines
            .insert(baseline.device_id.clone(), baseline.clone());
        Ok(())
    }

    fn load_thermal_baselines(&self) -> Result<Vec<ThermalBaseline>, StoreError> {
        Ok(self.read().thermal_baselines.values().cloned().collect())
    }

    fn save_threat_signature(&self, signature: &ThreatSignature) -> Result<(), StoreError> {
        self.write()?
            .threat_signatures
            .insert(signature.signature_id.clone(), signature.clone());
        Ok(())
    }

    fn load_threat_signatures(&self) -> Result<Vec<ThreatSignature>, StoreError> {
        Ok(self.read().threat_signatures.values().cloned().collect())
    }

    fn delete_threat_signature(&self, signature_id: &str) -> Result<bool, StoreError> {
        Ok(self.write()?.threat_signatures.remove(signature_id).is_some())
    }

    fn append_event(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        self.write()?.events.push(event.clone());
        Ok(())
    }

    fn load_events(&self) -> Result<Vec<SecurityEvent>, StoreError> {
        Ok(self.read().events.clone())
    }

    fn mark_false_positive(&self, event_id: &str) -> Result<(), StoreError> {
        self.write()?.false_positives.insert(event_id.to_string());
        Ok(())
    }

    fn load_false_positives(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.read().false_positives.iter().cloned().collect())
    }

    fn append_mitigation(&self, action: &MitigationAction) -> Result<(), StoreError> {
        self.write()?.mitigations.push(action.clone());
        Ok(())
    }

    fn load_mitigations(&self) -> Result<Vec<MitigationAction>, StoreError> {
        Ok(self.read().mitigations.clone())
    }

    fn insert_evidence(&self, evidence: &ForensicEvidence) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if !state.evidence_ids.insert(evidence.evidence_id.clone()) {
            return Err(StoreError::Conflict {
                kind: "evidence",
                id: evidence.evidence_id.clone(),
            });
        }
        state.evidence.push(evidence.clone());
        Ok(())
    }

    fn load_evidence(&self) -> Result<Vec<ForensicEvidence>, StoreError> {
        Ok(self.read().evidence.clone())
    }
}

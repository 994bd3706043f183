//! Directory-backed JSON store.
//!
//! Layout under the store directory:
//!
//! ```text
//! state.json          signatures, baselines, threat signatures, false positives
//! events.jsonl        one SecurityEvent per line, append-only
//! mitigations.jsonl   one MitigationAction per line, append-only
//! evidence.jsonl      one ForensicEvidence per line, ids unique
//! ```
//!
//! `state.json` is rewritten through a temporary file in the same directory
//! and renamed into place, so a crash leaves either the old or the new state.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{SecurityStore, StoreError, power_key};
use crate::model::{
    ForensicEvidence, MitigationAction, PowerBaseline, PufSignature, SecurityEvent, ThermalBaseline,
    ThreatSignature,
};

const STATE_FILE: &str = "state.json";
const EVENTS_FILE: &str = "events.jsonl";
const MITIGATIONS_FILE: &str = "mitigations.jsonl";
const EVIDENCE_FILE: &str = "evidence.jsonl";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PersistedState {
    version: u32,
    signatures: BTreeMap<String, PufSignature>,
    power_baselines: BTreeMap<String, PowerBaseline>,
    thermal_baselines: BTreeMap<String, ThermalBaseline>,
    threat_signatures: BTreeMap<String, ThreatSignature>,
    false_positives: BTreeSet<String>,
}

struct Inner {
    state: PersistedState,
    evidence_ids: HashSet<String>,
}

pub struct JsonFileStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl JsonFileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let state_path = dir.join(STATE_FILE);
        let state = if state_path.exists() {
            serde_json::from_slice(&fs::read(&state_path)?)?
        } else {
            PersistedState {
                version: 1,
                ..Default::default()
            }
        };
        let evidence_ids = read_jsonl::<ForensicEvidence>(&dir.join(EVIDENCE_FILE))?
            .into_iter()
            .map(|e| e.evidence_id)
            .collect();

        log::debug!("opened store at {}", dir.display());
        Ok(Self {
            dir,
            inner: Mutex::new(Inner { state, evidence_ids }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `f` to a copy of the state, persist the copy, then adopt it.
    /// A failed write leaves the cached state untouched.
    fn update<R>(&self, f: impl FnOnce(&mut PersistedState) -> R) -> Result<R, StoreError> {
        let mut inner = self.lock();
        let mut next = inner.state.clone();
        let result = f(&mut next);
        self.write_state(&next)?;
        inner.state = next;
        Ok(result)
    }

    fn write_state(&self, state: &PersistedState) -> Result<(), StoreError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        {
            let mut w = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer_pretty(&mut w, state)?;
            w.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(self.dir.join(STATE_FILE)).map_err(|e| e.error)?;
        Ok(())
    }

    fn append_line<T: Serialize>(&self, file: &str, value: &T) -> Result<(), StoreError> {
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(file))?;
        let mut w = BufWriter::new(f);
        serde_json::to_writer(&mut w, value)?;
        w.write_all(b"\n")?;
        w.flush()?;
        Ok(())
    }
}

/// Read a JSON-lines file. A missing file is empty; a torn final line from an
/// interrupted append is skipped with a warning.
fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(v) => out.push(v),
            Err(e) => log::warn!("{}:{}: skipping unreadable record: {e}", path.display(), i + 1),
        }
    }
    Ok(out)
}

impl SecurityStore for JsonFileStore {
    fn name(&self) -> &str {
        "json-file"
    }

    fn save_signature(&self, signature: &PufSignature) -> Result<(), StoreError> {
        self.update(|s| {
            s.signatures.insert(signature.device_id.clone(), signature.clone());
        })
    }

    fn load_signatures(&self) -> Result<Vec<PufSignature>, StoreError> {
        Ok(self.lock().state.signatures.values().cloned().collect())
    }

    fn delete_signature(&self, device: &str) -> Result<bool, StoreError> {
        self.update(|s| s.signatures.remove(device).is_some())
    }

    fn save_power_baseline(&self, baseline: &PowerBaseline) -> Result<(), StoreError> {
        self.update(|s| {
            s.power_baselines.insert(
                power_key(&baseline.device_id, &baseline.operation),
                baseline.clone(),
            );
        })
    }

    fn load_power_baselines(&self) -> Result<Vec<PowerBaseline>, StoreError> {
        Ok(self.lock().state.power_baselines.values().cloned().collect())
    }

    fn save_thermal_baseline(&self, baseline: &ThermalBaseline) -> Result<(), StoreError> {
        self.update(|s| {
            s.thermal_baselines.insert(baseline.device_id.clone(), baseline.clone());
        })
    }

    fn load_thermal_baselines(&self) -> Result<Vec<ThermalBaseline>, StoreError> {
        Ok(self.lock().state.thermal_baselines.values().cloned().collect())
    }

    fn save_threat_signature(&self, signature: &ThreatSignature) -> Result<(), StoreError> {
        self.update(|s| {
            s.threat_signatures.insert(signature.signature_id.clone(), signature.clone());
        })
    }

    fn load_threat_signatures(&self) -> Result<Vec<ThreatSignature>, StoreError> {
        Ok(self.lock().state.threat_signatures.values().cloned().collect())
    }

    fn delete_threat_signature(&self, signature_id: &str) -> Result<bool, StoreError> {
        self.update(|s| s.threat_signatures.remove(signature_id).is_some())
    }

    fn append_event(&self, event: &SecurityEvent) -> Result<(), StoreError> {
        let _guard = self.lock();
        self.append_line(EVENTS_FILE, event)
    }

    fn load_events(&self) -> Result<Vec<SecurityEvent>, StoreError> {
        let _guard = self.lock();
        read_jsonl(&self.dir.join(EVENTS_FILE))
    }

    fn mark_false_positive(&self, event_id: &str) -> Result<(), StoreError> {
        self.update(|s| {
            s.false_positives.insert(event_id.to_string());
        })
    }

    fn load_false_positives(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock().state.false_positives.iter().cloned().collect())
    }

    fn append_mitigation(&self, action: &MitigationAction) -> Result<(), StoreError> {
        let _guard = self.lock();
        self.append_line(MITIGATIONS_FILE, action)
    }

    fn load_mitigations(&self) -> Result<Vec<MitigationAction>, StoreError> {
        let _guard = self.lock();
        read_jsonl(&self.dir.join(MITIGATIONS_FILE))
    }

    fn insert_evidence(&self, evidence: &ForensicEvidence) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.evidence_ids.contains(&evidence.evidence_id) {
            return Err(StoreError::Conflict {
                kind: "evidence",
                id: evidence.evidence_id.clone(),
            });
        }
        self.append_line(EVIDENCE_FILE, evidence)?;
        inner.evidence_ids.insert(evidence.evidence_id.clone());
        Ok(())
    }

    fn load_evidence(&self) -> Result<Vec<ForensicEvidence>, StoreError> {
        let _guard = self.lock();
        read_jsonl(&self.dir.join(EVIDENCE_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventSource, Severity};
    use chrono::Utc;
    use serde_json::json;

    fn event(id: &str) -> SecurityEvent {
        SecurityEvent {
            event_id: id.into(),
            event_type: "spa_attack_detected".into(),
            source: EventSource::PowerAnalysis,
            device_id: "hsm-01".into(),
            severity: Severity::High,
            confidence: 0.9,
            thermodynamic_data: json!({"z_score": 8.0}),
            threat_category: "side_channel".into(),
            matched_signature_id: None,
            detected_at: Utc::now(),
        }
    }

    fn thermal_baseline(device: &str) -> ThermalBaseline {
        ThermalBaseline {
            device_id: device.into(),
            mean_temperature_c: 45.0,
            std_temperature_c: 0.5,
            sample_count: 60,
            established_at: Utc::now(),
        }
    }

    #[test]
    fn test_state_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = JsonFileStore::open(tmp.path()).unwrap();
            store.save_thermal_baseline(&thermal_baseline("hsm-01")).unwrap();
            store.mark_false_positive("e9").unwrap();
            store.append_event(&event("e1")).unwrap();
            store.append_event(&event("e2")).unwrap();
        }
        let store = JsonFileStore::open(tmp.path()).unwrap();
        assert_eq!(store.load_thermal_baselines().unwrap().len(), 1);
        assert_eq!(store.load_false_positives().unwrap(), vec!["e9".to_string()]);
        let ids: Vec<_> = store.load_events().unwrap().into_iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
        assert!(tmp.path().join(STATE_FILE).exists());
    }

    #[test]
    fn test_evidence_conflict_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let ev = ForensicEvidence {
            evidence_id: "ev1".into(),
            event_id: "e1".into(),
            evidence_type: "thermal_samples".into(),
            data: json!({"samples": [44.0, 30.0]}),
            cryptographic_hash: "ab".into(),
            stored_at: Utc::now(),
        };
        JsonFileStore::open(tmp.path()).unwrap().insert_evidence(&ev).unwrap();
        let store = JsonFileStore::open(tmp.path()).unwrap();
        assert!(matches!(store.insert_evidence(&ev), Err(StoreError::Conflict { .. })));
        assert_eq!(store.load_evidence().unwrap().len(), 1);
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(tmp.path()).unwrap();
        store.append_event(&event("e1")).unwrap();
        let mut f = OpenOptions::new()
            .append(true)
            .open(tmp.path().join(EVENTS_FILE))
            .unwrap();
        f.write_all(b"{\"event_id\": \"e2\", \"trunc").unwrap();
        assert_eq!(store.load_events().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_signature_reports_presence() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(tmp.path()).unwrap();
        assert!(!store.delete_signature("nope").unwrap());
    }

    #[test]
    fn test_corrupt_state_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(STATE_FILE), "{not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(tmp.path()),
            Err(StoreError::Encoding(_))
        ));
    }
}

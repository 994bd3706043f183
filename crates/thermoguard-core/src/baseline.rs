//! Baseline store: PUF signatures, power baselines and thermal baselines.
//!
//! Entries are immutable `Arc` snapshots swapped whole, so a monitoring task
//! holding a baseline never observes a partially written one. Only explicit
//! establish/enroll calls write here; monitoring loops only read.
//!
//! Writes go to memory first and are then persisted to the backing
//! [`SecurityStore`] on the blocking pool, retried with backoff. A
//! persistence failure that outlasts the retries is returned to the caller
//! but the in-memory entry stays installed.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{BaselineKind, GuardError, Result};
use crate::model::{PowerBaseline, PufSignature, ThermalBaseline};
use crate::store::{RetryPolicy, SecurityStore, StoreError, power_key, write_with_retry};

pub struct BaselineStore {
    store: Arc<dyn SecurityStore>,
    retry: RetryPolicy,
    signatures: RwLock<HashMap<String, Arc<PufSignature>>>,
    power: RwLock<HashMap<String, Arc<PowerBaseline>>>,
    thermal: RwLock<HashMap<String, Arc<ThermalBaseline>>>,
}

impl BaselineStore {
    /// Build the store, loading every persisted entry from `store`.
    pub fn load(store: Arc<dyn SecurityStore>) -> Result<Self> {
        let signatures = store
            .load_signatures()?
            .into_iter()
            .map(|s| (s.device_id.clone(), Arc::new(s)))
            .collect();
        let power = store
            .load_power_baselines()?
            .into_iter()
            .map(|b| (power_key(&b.device_id, &b.operation), Arc::new(b)))
            .collect();
        let thermal = store
            .load_thermal_baselines()?
            .into_iter()
            .map(|b| (b.device_id.clone(), Arc::new(b)))
            .collect();
        Ok(Self {
            store,
            retry: RetryPolicy::default(),
            signatures: RwLock::new(signatures),
            power: RwLock::new(power),
            thermal: RwLock::new(thermal),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    // -----------------------------------------------------------------------
    // PUF signatures
    // -----------------------------------------------------------------------

    pub fn signature(&self, device: &str) -> Option<Arc<PufSignature>> {
        self.signatures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device)
            .cloned()
    }

    pub fn require_signature(&self, device: &str) -> Result<Arc<PufSignature>> {
        self.signature(device)
            .ok_or_else(|| GuardError::NotEnrolled(device.to_string()))
    }

    pub fn signatures(&self) -> Vec<Arc<PufSignature>> {
        let mut all: Vec<_> = self
            .signatures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        all
    }

    /// Install (or supersede) a device's signature.
    pub async fn put_signature(&self, signature: PufSignature) -> std::result::Result<Arc<PufSignature>, StoreError> {
        let signature = Arc::new(signature);
        self.signatures
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(signature.device_id.clone(), Arc::clone(&signature));
        self.save_signature(Arc::clone(&signature)).await?;
        Ok(signature)
    }

    /// Copy-on-write update of an existing signature.
    pub async fn update_signature(
        &self,
        device: &str,
        f: impl FnOnce(&mut PufSignature) + Send,
    ) -> Result<Arc<PufSignature>> {
        let updated = {
            let mut map = self.signatures.write().unwrap_or_else(PoisonError::into_inner);
            let current = map
                .get(device)
                .ok_or_else(|| GuardError::NotEnrolled(device.to_string()))?;
            let mut next = PufSignature::clone(current);
            f(&mut next);
            let next = Arc::new(next);
            map.insert(device.to_string(), Arc::clone(&next));
            next
        };
        self.save_signature(Arc::clone(&updated)).await?;
        Ok(updated)
    }

    async fn save_signature(&self, signature: Arc<PufSignature>) -> std::result::Result<(), StoreError> {
        write_with_retry(&self.store, self.retry, "PUF signature", move |s| s.save_signature(&signature)).await
    }

    // -----------------------------------------------------------------------
    // Power baselines
    // -----------------------------------------------------------------------

    pub fn power(&self, device: &str, operation: &str) -> Option<Arc<PowerBaseline>> {
        self.power
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&power_key(device, operation))
            .cloned()
    }

    pub fn require_power(&self, device: &str, operation: &str) -> Result<Arc<PowerBaseline>> {
        self.power(device, operation).ok_or_else(|| GuardError::NotBaselined {
            device: device.to_string(),
            kind: BaselineKind::Power,
            operation: Some(operation.to_string()),
        })
    }

    pub async fn put_power(&self, baseline: PowerBaseline) -> std::result::Result<Arc<PowerBaseline>, StoreError> {
        let baseline = Arc::new(baseline);
        self.power
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                power_key(&baseline.device_id, &baseline.operation),
                Arc::clone(&baseline),
            );
        let persisted = Arc::clone(&baseline);
        write_with_retry(&self.store, self.retry, "power baseline", move |s| {
            s.save_power_baseline(&persisted)
        })
        .await?;
        Ok(baseline)
    }

    pub fn power_count(&self) -> usize {
        self.power.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    // -----------------------------------------------------------------------
    // Thermal baselines
    // -----------------------------------------------------------------------

    pub fn thermal(&self, device: &str) -> Option<Arc<ThermalBaseline>> {
        self.thermal
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device)
            .cloned()
    }

    pub fn require_thermal(&self, device: &str) -> Result<Arc<ThermalBaseline>> {
        self.thermal(device).ok_or_else(|| GuardError::NotBaselined {
            device: device.to_string(),
            kind: BaselineKind::Thermal,
            operation: None,
        })
    }

    pub async fn put_thermal(&self, baseline: ThermalBaseline) -> std::result::Result<Arc<ThermalBaseline>, StoreError> {
        let baseline = Arc::new(baseline);
        self.thermal
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(baseline.device_id.clone(), Arc::clone(&baseline));
        let persisted = Arc::clone(&baseline);
        write_with_retry(&self.store, self.retry, "thermal baseline", move |s| {
            s.save_thermal_baseline(&persisted)
        })
        .await?;
        Ok(baseline)
    }

    pub fn thermal_count(&self) -> usize {
        self.thermal.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Utc;
    use std::time::Duration;

    fn thermal(device: &str, mean: f64) -> ThermalBaseline {
        ThermalBaseline {
            device_id: device.into(),
            mean_temperature_c: mean,
            std_temperature_c: 0.4,
            sample_count: 30,
            established_at: Utc::now(),
        }
    }

    #[test]
    fn test_missing_baselines_are_setup_errors() {
        let store = BaselineStore::load(Arc::new(MemoryStore::new())).unwrap();
        assert!(matches!(
            store.require_power("d", "aes"),
            Err(GuardError::NotBaselined { kind: BaselineKind::Power, .. })
        ));
        assert!(matches!(store.require_thermal("d"), Err(GuardError::NotBaselined { .. })));
        assert!(matches!(store.require_signature("d"), Err(GuardError::NotEnrolled(_))));
    }

    #[tokio::test]
    async fn test_readers_keep_their_snapshot() {
        let store = BaselineStore::load(Arc::new(MemoryStore::new())).unwrap();
        store.put_thermal(thermal("d", 25.0)).await.unwrap();
        let held = store.require_thermal("d").unwrap();
        store.put_thermal(thermal("d", 30.0)).await.unwrap();
        assert_eq!(held.mean_temperature_c, 25.0);
        assert_eq!(store.require_thermal("d").unwrap().mean_temperature_c, 30.0);
    }

    #[tokio::test]
    async fn test_reload_from_backing_store() {
        let backing: Arc<dyn SecurityStore> = Arc::new(MemoryStore::new());
        BaselineStore::load(Arc::clone(&backing))
            .unwrap()
            .put_thermal(thermal("d", 25.0))
            .await
            .unwrap();
        let reloaded = BaselineStore::load(backing).unwrap();
        assert_eq!(reloaded.thermal_count(), 1);
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_memory_entry() {
        let backing = Arc::new(MemoryStore::new());
        let store = BaselineStore::load(backing.clone()).unwrap().with_retry(fast_retry(2));
        backing.set_unavailable(true);
        assert!(store.put_thermal(thermal("d", 25.0)).await.is_err());
        assert!(store.thermal("d").is_some());
    }

    #[tokio::test]
    async fn test_persist_survives_brief_outage() {
        let backing = Arc::new(MemoryStore::new());
        let store = BaselineStore::load(backing.clone()).unwrap().with_retry(fast_retry(5));
        backing.set_unavailable(true);
        let restore = {
            let backing = backing.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                backing.set_unavailable(false);
            })
        };
        store.put_thermal(thermal("d", 25.0)).await.unwrap();
        restore.await.unwrap();
        assert_eq!(backing.load_thermal_baselines().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_signature_requires_enrollment() {
        let store = BaselineStore::load(Arc::new(MemoryStore::new())).unwrap();
        assert!(matches!(
            store.update_signature("d", |s| s.validation_count += 1).await,
            Err(GuardError::NotEnrolled(_))
        ));
    }
}

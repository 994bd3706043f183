//! Collaborators shared by every detector.

use std::sync::Arc;
use std::time::Duration;

use crate::actuator::{ActuatorError, HardwareActuator, actuate};
use crate::baseline::BaselineStore;
use crate::registry::SecurityRegistry;
use crate::sensor::SensorSource;

#[derive(Clone)]
pub struct Services {
    pub sensor: Arc<dyn SensorSource>,
    pub actuator: Arc<dyn HardwareActuator>,
    pub baselines: Arc<BaselineStore>,
    pub registry: Arc<SecurityRegistry>,
    pub sensor_timeout: Duration,
    pub actuator_timeout: Duration,
}

impl Services {
    /// Send a countermeasure to the actuator and record the outcome as a
    /// mitigation action on `event_id`. Failures are logged, not retried.
    pub(crate) async fn mitigate<F>(&self, device: &str, event_id: &str, action_type: &str, request: F)
    where
        F: FnOnce(&dyn HardwareActuator) -> Result<(), ActuatorError> + Send + 'static,
    {
        let outcome = actuate(&self.actuator, self.actuator_timeout, request).await;
        let result = match &outcome {
            Ok(()) => "success".to_string(),
            Err(e) => {
                log::warn!("[{device}] {action_type} for event {event_id} failed: {e}");
                format!("failed: {e}")
            }
        };
        if let Err(e) = self
            .registry
            .record_mitigation_action(event_id, action_type, self.actuator.name(), true, &result)
            .await
        {
            log::warn!("[{device}] {action_type} for event {event_id} not recorded: {e}");
        }
    }
}

/// Services over a fresh memory store, logging actuator and logging federation.
#[cfg(test)]
pub(crate) fn test_services(sensor: Arc<dyn SensorSource>) -> Services {
    test_services_with(sensor, Arc::new(crate::actuator::LoggingActuator::new()))
}

#[cfg(test)]
pub(crate) fn test_services_with(sensor: Arc<dyn SensorSource>, actuator: Arc<dyn HardwareActuator>) -> Services {
    use crate::bus::EventBus;
    use crate::config::RegistryConfig;
    use crate::federation::LoggingFederation;
    use crate::store::{MemoryStore, SecurityStore};

    let store: Arc<dyn SecurityStore> = Arc::new(MemoryStore::new());
    let registry = SecurityRegistry::load(
        RegistryConfig::default(),
        0.30,
        Arc::clone(&store),
        Arc::new(LoggingFederation::new()),
        EventBus::new(256),
    )
    .expect("memory store loads");
    Services {
        sensor,
        actuator,
        baselines: Arc::new(BaselineStore::load(store).expect("memory store loads")),
        registry: Arc::new(registry),
        sensor_timeout: Duration::from_secs(2),
        actuator_timeout: Duration::from_secs(2),
    }
}

//! Engine composition: one registry, one baseline store and the four
//! detectors wired to the same collaborators.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::actuator::{HardwareActuator, LoggingActuator};
use crate::baseline::BaselineStore;
use crate::bus::{BusMessage, EventBus};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::federation::{FederationConnector, LoggingFederation};
use crate::leakage::{LeakageAnalyzer, LeakageStatistics};
use crate::monitor::MonitorReport;
use crate::power::{PowerDetector, PowerStatistics};
use crate::puf::{PufEngine, PufStatistics};
use crate::registry::{RegistryStatistics, SecurityRegistry};
use crate::sensor::{SensorSource, SimulatedSensor};
use crate::services::Services;
use crate::store::{MemoryStore, RetryPolicy, SecurityStore};
use crate::thermal::{ThermalMonitor, ThermalStatistics};

/// External systems the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub sensor: Arc<dyn SensorSource>,
    pub actuator: Arc<dyn HardwareActuator>,
    pub store: Arc<dyn SecurityStore>,
    pub federation: Arc<dyn FederationConnector>,
}

impl Collaborators {
    /// Simulated sensor with logging actuator, in-memory store and logging federation.
    pub fn simulated(seed: u64) -> Self {
        Self {
            sensor: Arc::new(SimulatedSensor::new(seed)),
            actuator: Arc::new(LoggingActuator::new()),
            store: Arc::new(MemoryStore::new()),
            federation: Arc::new(LoggingFederation::new()),
        }
    }

    pub fn with_sensor(mut self, sensor: Arc<dyn SensorSource>) -> Self {
        self.sensor = sensor;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn SecurityStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_actuator(mut self, actuator: Arc<dyn HardwareActuator>) -> Self {
        self.actuator = actuator;
        self
    }

    pub fn with_federation(mut self, federation: Arc<dyn FederationConnector>) -> Self {
        self.federation = federation;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatistics {
    pub sensor: String,
    pub store: String,
    pub puf: PufStatistics,
    pub power: PowerStatistics,
    pub thermal: ThermalStatistics,
    pub leakage: LeakageStatistics,
    pub registry: RegistryStatistics,
}

pub struct SecurityEngine {
    config: EngineConfig,
    services: Services,
    store_name: String,
    puf: PufEngine,
    power: Arc<PowerDetector>,
    thermal: Arc<ThermalMonitor>,
    leakage: LeakageAnalyzer,
}

impl SecurityEngine {
    /// Validate `config`, load persisted state from the store and build every detector.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let Collaborators {
            sensor,
            actuator,
            store,
            federation,
        } = collaborators;

        let baselines = Arc::new(
            BaselineStore::load(Arc::clone(&store))?.with_retry(RetryPolicy::from_config(&config.registry)),
        );
        let registry = Arc::new(SecurityRegistry::load(
            config.registry.clone(),
            config.similarity_tolerance,
            Arc::clone(&store),
            federation,
            EventBus::new(config.registry.bus_capacity),
        )?);
        let services = Services {
            sensor,
            actuator,
            baselines,
            registry,
            sensor_timeout: config.sensor_timeout,
            actuator_timeout: config.actuator_timeout,
        };
        log::info!(
            "engine ready: sensor {}, store {}, {} signatures, {} power / {} thermal baselines",
            services.sensor.name(),
            store.name(),
            services.baselines.signatures().len(),
            services.baselines.power_count(),
            services.baselines.thermal_count()
        );

        Ok(Self {
            puf: PufEngine::new(
                config.puf.clone(),
                config.similarity_tolerance,
                config.operation_timeout,
                services.clone(),
            ),
            power: Arc::new(PowerDetector::new(config.power.clone(), services.clone())),
            thermal: Arc::new(ThermalMonitor::new(config.thermal.clone(), services.clone())),
            leakage: LeakageAnalyzer::new(config.leakage.clone(), config.operation_timeout, services.clone()),
            store_name: store.name().to_string(),
            services,
            config,
        })
    }

    /// Engine over [`Collaborators::simulated`] with default configuration.
    pub fn simulated(seed: u64) -> Result<Self> {
        Self::new(EngineConfig::default(), Collaborators::simulated(seed))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn puf(&self) -> &PufEngine {
        &self.puf
    }

    pub fn power(&self) -> &Arc<PowerDetector> {
        &self.power
    }

    pub fn thermal(&self) -> &Arc<ThermalMonitor> {
        &self.thermal
    }

    pub fn leakage(&self) -> &LeakageAnalyzer {
        &self.leakage
    }

    pub fn registry(&self) -> &Arc<SecurityRegistry> {
        &self.services.registry
    }

    pub fn baselines(&self) -> &Arc<BaselineStore> {
        &self.services.baselines
    }

    pub fn sensor(&self) -> &Arc<dyn SensorSource> {
        &self.services.sensor
    }

    pub fn bus(&self) -> &EventBus {
        self.services.registry.bus()
    }

    /// Receive every notification published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.bus().subscribe()
    }

    pub fn statistics(&self) -> EngineStatistics {
        EngineStatistics {
            sensor: self.services.sensor.name().to_string(),
            store: self.store_name.clone(),
            puf: self.puf.statistics(),
            power: self.power.statistics(),
            thermal: self.thermal.statistics(),
            leakage: self.leakage.statistics(),
            registry: self.services.registry.statistics(),
        }
    }

    /// Stop every running monitor and wait for each to finish its cycle.
    pub async fn shutdown(&self) -> Vec<MonitorReport> {
        let mut reports = self.power.stop_all().await;
        reports.extend(self.thermal.stop_all().await);
        if !reports.is_empty() {
            log::info!("engine stopped {} monitors", reports.len());
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GuardError;

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.puf.clone_threshold = 2.0;
        assert!(matches!(
            SecurityEngine::new(config, Collaborators::simulated(1)),
            Err(GuardError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_statistics_start_empty() {
        let engine = SecurityEngine::simulated(1).unwrap();
        let stats = engine.statistics();
        assert_eq!(stats.sensor, "simulated");
        assert_eq!(stats.registry.total_events, 0);
        assert!(stats.power.active_monitors.is_empty());
        assert!(engine.shutdown().await.is_empty());
    }

    #[tokio::test]
    async fn test_reloads_persisted_state() {
        let store: Arc<dyn SecurityStore> = Arc::new(MemoryStore::new());
        let collaborators = Collaborators::simulated(2).with_store(Arc::clone(&store));
        let engine = SecurityEngine::new(EngineConfig::default(), collaborators.clone()).unwrap();
        engine.thermal().install_baseline("hsm-01", &[40.0, 41.0]).await.unwrap();
        drop(engine);

        let engine = SecurityEngine::new(EngineConfig::default(), collaborators).unwrap();
        assert!(engine.baselines().thermal("hsm-01").is_some());
    }
}

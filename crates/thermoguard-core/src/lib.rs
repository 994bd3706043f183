//! # thermoguard-core
//!
//! **Thermodynamic side-channel security engine.**
//!
//! Authenticates devices by their physically unclonable thermodynamic
//! behavior, watches power and thermal emissions for side-channel and
//! cold-boot attacks, quantifies how many bits of a secret a channel leaks,
//! and keeps every detection in a correlating security event registry.
//!
//! ## Quick Start
//!
//! ```no_run
//! use thermoguard_core::SecurityEngine;
//!
//! # async fn demo() -> thermoguard_core::Result<()> {
//! let engine = SecurityEngine::simulated(42)?;
//!
//! let signature = engine.puf().enroll("hsm-01", 1000).await?;
//! println!("fingerprint {}", signature.fingerprint);
//!
//! let auth = engine.puf().authenticate("hsm-01", true).await?;
//! println!("authenticated: {} ({:.2})", auth.authenticated, auth.confidence);
//!
//! engine.power().establish_baseline("hsm-01", "aes", 200).await?;
//! engine.power().start_monitoring("hsm-01", "aes")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! Sensor → Detector (PUF / power / thermal / leakage) → Registry → Bus, Store, Federation
//!
//! Every physical input arrives through the [`SensorSource`] trait and every
//! countermeasure leaves through [`HardwareActuator`]. Detectors compare
//! observations with baselines from the [`BaselineStore`] and report
//! anomalies to the [`SecurityRegistry`], which persists them through a
//! [`SecurityStore`], publishes them on the [`EventBus`] and broadcasts
//! critical ones to a [`FederationConnector`].

pub mod actuator;
pub mod baseline;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod federation;
pub mod leakage;
pub mod model;
pub mod monitor;
pub mod power;
pub mod puf;
pub mod registry;
pub mod sensor;
pub mod services;
pub mod store;
pub mod thermal;
pub mod window;

pub use actuator::{ActuatorError, ActuatorRequest, HardwareActuator, LoggingActuator, NoiseProfile};
pub use baseline::BaselineStore;
pub use bus::{BusMessage, EVENT_REGISTERED, EventBus, topic_matches};
pub use config::{EngineConfig, LeakageConfig, PowerConfig, PufConfig, RegistryConfig, ThermalConfig};
pub use engine::{Collaborators, EngineStatistics, SecurityEngine};
pub use error::{BaselineKind, GuardError, Result};
pub use features::{FeatureVector, fingerprint_hex, similarity};
pub use federation::{FederationConnector, FederationError, LoggingFederation};
pub use leakage::{ChannelSweep, LeakageAnalyzer, LeakageResult, LeakageSeverity, LeakageStatistics};
pub use model::{
    EventSource, ForensicEvidence, MitigationAction, PowerBaseline, PufSignature, SecurityEvent, Severity,
    ThermalBaseline, ThreatSignature,
};
pub use monitor::{CancelFlag, MonitorHandle, MonitorReport};
pub use power::{PowerAnalyzer, PowerDetector, PowerFinding, PowerStatistics};
pub use puf::{AuthenticationResult, CloneCheck, PufEngine, PufStatistics};
pub use registry::{
    DeviceHealth, HealthStatus, NewSecurityEvent, NewThreatSignature, RegistryStatistics, SecurityRegistry,
};
pub use sensor::{Channel, Reading, SensorError, SensorSource, SimulatedSensor, SysfsSensor};
pub use services::Services;
pub use store::{JsonFileStore, MemoryStore, SecurityStore, StoreError};
pub use thermal::{ThermalAnalyzer, ThermalFinding, ThermalMonitor, ThermalStatistics};
pub use window::ObservationWindow;

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

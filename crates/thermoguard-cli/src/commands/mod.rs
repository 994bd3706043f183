pub mod authenticate;
pub mod baseline;
pub mod clone_check;
pub mod enroll;
pub mod health;
pub mod leakage;
pub mod monitor;
pub mod serve;
pub mod threats;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use thermoguard_core::{
    Collaborators, EngineConfig, JsonFileStore, SecurityEngine, SecurityEvent, SensorSource, SimulatedSensor,
    SysfsSensor,
};

/// Global options shared by every subcommand.
pub struct EngineOptions<'a> {
    pub config: Option<&'a Path>,
    pub store: &'a Path,
    pub hardware: bool,
    pub seed: u64,
}

/// A ready engine plus the runtime its detectors run on.
pub struct Context {
    pub engine: Arc<SecurityEngine>,
    /// Present when running against the simulated sensor.
    pub simulator: Option<Arc<SimulatedSensor>>,
    runtime: tokio::runtime::Runtime,
}

impl Context {
    /// Build the engine described by `opts`, exiting with a message on failure.
    pub fn open(opts: &EngineOptions<'_>) -> Self {
        let config = match opts.config {
            Some(path) => EngineConfig::load(path).unwrap_or_else(|e| fail("loading config", e)),
            None => EngineConfig::default(),
        };
        let store = JsonFileStore::open(opts.store)
            .unwrap_or_else(|e| fail(&format!("opening store {}", opts.store.display()), e));

        let (sensor, simulator) = if opts.hardware {
            let sysfs = SysfsSensor::default();
            if !sysfs.is_available() {
                eprintln!("Warning: no RAPL or thermal zone found under /sys; most readings will fail.");
            }
            (Arc::new(sysfs) as Arc<dyn SensorSource>, None)
        } else {
            let sim = Arc::new(SimulatedSensor::new(opts.seed));
            (Arc::clone(&sim) as Arc<dyn SensorSource>, Some(sim))
        };

        let collaborators = Collaborators::simulated(opts.seed)
            .with_sensor(sensor)
            .with_store(Arc::new(store));

        let runtime = tokio::runtime::Runtime::new().unwrap_or_else(|e| fail("starting runtime", e));
        let engine = SecurityEngine::new(config, collaborators).unwrap_or_else(|e| fail("starting engine", e));

        Self {
            engine: Arc::new(engine),
            simulator,
            runtime,
        }
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

/// Print `err` and exit with status 1.
pub fn fail(context: &str, err: impl std::fmt::Display) -> ! {
    eprintln!("Error {context}: {err}");
    std::process::exit(1);
}

/// Pretty-print `value` as JSON on stdout.
pub fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => fail("serializing output", e),
    }
}

/// One-line human rendering of an event.
pub fn event_line(event: &SecurityEvent) -> String {
    let mut line = format!(
        "{} [{:<8}] {:<12} {} (confidence {:.2})",
        event.detected_at.format("%H:%M:%S"),
        event.severity,
        event.device_id,
        event.event_type,
        event.confidence
    );
    if let Some(sig) = &event.matched_signature_id {
        line.push_str(&format!(" matches {sig}"));
    }
    line
}

//! Hardware countermeasure capability.
//!
//! Requests are fire-and-forget from a detector's point of view: they are
//! bounded by a timeout, the outcome is recorded as a mitigation action, and
//! a failure is logged rather than retried.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Noise injection request for a power-analysis countermeasure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseProfile {
    /// Peak amplitude of the injected noise (mW).
    pub amplitude_mw: f64,
    /// Attack that prompted the request, e.g. `spa` or `dpa`.
    pub attack: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error("actuator does not support {0}")]
    Unsupported(&'static str),

    #[error("actuator request failed: {0}")]
    Failed(String),

    #[error("actuator request timed out after {0:?}")]
    Timeout(Duration),
}

pub trait HardwareActuator: Send + Sync {
    /// Backend name, recorded as `executed_by` on mitigation actions.
    fn name(&self) -> &str;

    fn inject_power_noise(&self, device: &str, profile: &NoiseProfile) -> Result<(), ActuatorError>;

    fn wipe_sensitive_memory(&self, device: &str) -> Result<(), ActuatorError>;
}

/// Run an actuator request on the blocking pool, bounded by `timeout`.
pub async fn actuate<F>(actuator: &Arc<dyn HardwareActuator>, timeout: Duration, f: F) -> Result<(), ActuatorError>
where
    F: FnOnce(&dyn HardwareActuator) -> Result<(), ActuatorError> + Send + 'static,
{
    let actuator = Arc::clone(actuator);
    let task = tokio::task::spawn_blocking(move || f(actuator.as_ref()));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(ActuatorError::Failed(format!("actuator task failed: {join}"))),
        Err(_) => Err(ActuatorError::Timeout(timeout)),
    }
}

/// A request an actuator received.
#[derive(Debug, Clone, PartialEq)]
pub enum ActuatorRequest {
    PowerNoise { device: String, profile: NoiseProfile },
    MemoryWipe { device: String },
}

/// Actuator that logs and records requests instead of driving hardware.
#[derive(Default)]
pub struct LoggingActuator {
    requests: Mutex<Vec<ActuatorRequest>>,
}

impl LoggingActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<ActuatorRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn wipe_count(&self, device: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| matches!(r, ActuatorRequest::MemoryWipe { device: d } if d == device))
            .count()
    }

    fn record(&self, request: ActuatorRequest) {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
    }
}

impl HardwareActuator for LoggingActuator {
    fn name(&self) -> &str {
        "logging-actuator"
    }

    fn inject_power_noise(&self, device: &str, profile: &NoiseProfile) -> Result<(), ActuatorError> {
        log::warn!(
            "[{device}] power noise injection requested: {:.1} mW ({})",
            profile.amplitude_mw,
            profile.attack
        );
        self.record(ActuatorRequest::PowerNoise {
            device: device.to_string(),
            profile: profile.clone(),
        });
        Ok(())
    }

    fn wipe_sensitive_memory(&self, device: &str) -> Result<(), ActuatorError> {
        log::error!("[{device}] emergency memory wipe requested");
        self.record(ActuatorRequest::MemoryWipe {
            device: device.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StuckActuator;

    impl HardwareActuator for StuckActuator {
        fn name(&self) -> &str {
            "stuck"
        }
        fn inject_power_noise(&self, _device: &str, _profile: &NoiseProfile) -> Result<(), ActuatorError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        }
        fn wipe_sensitive_memory(&self, _device: &str) -> Result<(), ActuatorError> {
            Err(ActuatorError::Unsupported("memory wipe"))
        }
    }

    #[test]
    fn test_logging_actuator_records() {
        let a = LoggingActuator::new();
        a.wipe_sensitive_memory("hsm-01").unwrap();
        a.inject_power_noise(
            "hsm-01",
            &NoiseProfile {
                amplitude_mw: 15.0,
                attack: "dpa".into(),
            },
        )
        .unwrap();
        assert_eq!(a.requests().len(), 2);
        assert_eq!(a.wipe_count("hsm-01"), 1);
        assert_eq!(a.wipe_count("hsm-02"), 0);
    }

    #[tokio::test]
    async fn test_actuate_bounds_and_propagates() {
        let a: Arc<dyn HardwareActuator> = Arc::new(StuckActuator);
        let profile = NoiseProfile {
            amplitude_mw: 5.0,
            attack: "spa".into(),
        };
        let r = actuate(&a, Duration::from_millis(20), move |a| a.inject_power_noise("d", &profile)).await;
        assert!(matches!(r, Err(ActuatorError::Timeout(_))));
        let r = actuate(&a, Duration::from_secs(1), |a| a.wipe_sensitive_memory("d")).await;
        assert!(matches!(r, Err(ActuatorError::Unsupported(_))));
    }
}

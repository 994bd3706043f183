//! Sensor capability and its implementations.
//!
//! Every physical measurement the engine uses comes through [`SensorSource`].
//! Detection code never synthesizes samples; the [`SimulatedSensor`] is the
//! only place synthetic data is produced.
//!
//! The trait is synchronous, like the hardware it fronts. Async callers go
//! through [`read_blocking`], which runs the read on the blocking pool and
//! bounds it with a timeout so a hung sensor costs one missed sample.

pub mod simulated;
pub mod sysfs;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};

pub use simulated::SimulatedSensor;
pub use sysfs::SysfsSensor;

/// A physical side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Supply power, mW.
    Power,
    /// Die or package temperature, °C.
    Thermal,
    /// Electromagnetic emission level.
    Electromagnetic,
    /// Acoustic emission level, dB.
    Acoustic,
    /// Device noise floor.
    Noise,
    /// Operation latency, µs. Derived from `trigger_operation`, never read directly.
    Timing,
}

impl Channel {
    /// Channels a PUF fingerprint reads directly.
    pub const PUF: [Channel; 4] = [Self::Power, Self::Thermal, Self::Electromagnetic, Self::Noise];

    /// Channels the leakage analyzer sweeps.
    pub const LEAKAGE: [Channel; 5] = [
        Self::Power,
        Self::Electromagnetic,
        Self::Timing,
        Self::Acoustic,
        Self::Thermal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Power => "power",
            Self::Thermal => "thermal",
            Self::Electromagnetic => "electromagnetic",
            Self::Acoustic => "acoustic",
            Self::Noise => "noise",
            Self::Timing => "timing",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "power" => Ok(Self::Power),
            "thermal" => Ok(Self::Thermal),
            "em" | "electromagnetic" => Ok(Self::Electromagnetic),
            "acoustic" => Ok(Self::Acoustic),
            "noise" => Ok(Self::Noise),
            "timing" => Ok(Self::Timing),
            other => Err(format!("unknown channel '{other}'")),
        }
    }
}

/// One scalar sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn now(value: f64) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("channel {0} is not supported by this sensor")]
    Unsupported(Channel),

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("{channel} sensor for device {device} is offline")]
    Offline { device: String, channel: Channel },

    #[error("sensor read failed: {0}")]
    Read(String),

    #[error("sensor I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Contract a measurement backend must satisfy.
///
/// Each call may fail; callers treat any failure as "no sample this cycle".
pub trait SensorSource: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    fn read_power(&self, device: &str) -> std::result::Result<Reading, SensorError>;

    fn read_thermal(&self, device: &str) -> std::result::Result<Reading, SensorError>;

    fn read_em(&self, device: &str) -> std::result::Result<Reading, SensorError>;

    fn read_acoustic(&self, device: &str) -> std::result::Result<Reading, SensorError>;

    fn read_noise(&self, device: &str) -> std::result::Result<Reading, SensorError>;

    /// Make the device execute one instance of `operation`.
    fn trigger_operation(&self, device: &str, operation: &str) -> std::result::Result<(), SensorError>;

    /// Trigger `operation` and report how long it took, in microseconds.
    fn time_operation(&self, device: &str, operation: &str) -> std::result::Result<f64, SensorError> {
        let start = std::time::Instant::now();
        self.trigger_operation(device, operation)?;
        Ok(start.elapsed().as_secs_f64() * 1e6)
    }

    /// Read any directly measurable channel.
    fn read(&self, device: &str, channel: Channel) -> std::result::Result<Reading, SensorError> {
        match channel {
            Channel::Power => self.read_power(device),
            Channel::Thermal => self.read_thermal(device),
            Channel::Electromagnetic => self.read_em(device),
            Channel::Acoustic => self.read_acoustic(device),
            Channel::Noise => self.read_noise(device),
            Channel::Timing => Err(SensorError::Unsupported(Channel::Timing)),
        }
    }

    /// Trigger `operation` and capture `length` consecutive power samples.
    fn capture_power_trace(
        &self,
        device: &str,
        operation: &str,
        length: usize,
    ) -> std::result::Result<Vec<f64>, SensorError> {
        self.trigger_operation(device, operation)?;
        (0..length)
            .map(|_| self.read_power(device).map(|r| r.value))
            .collect()
    }
}

/// Run a synchronous sensor call on the blocking pool, bounded by `timeout`.
///
/// A call that outlives the timeout is abandoned (it finishes in the
/// background) and reported as [`GuardError::SensorTimeout`].
pub async fn read_blocking<T, F>(sensor: &Arc<dyn SensorSource>, timeout: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn SensorSource) -> std::result::Result<T, SensorError> + Send + 'static,
{
    let sensor = Arc::clone(sensor);
    let task = tokio::task::spawn_blocking(move || f(sensor.as_ref()));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result.map_err(GuardError::from),
        Ok(Err(join)) => Err(SensorError::Read(format!("sensor task failed: {join}")).into()),
        Err(_) => Err(GuardError::SensorTimeout(timeout)),
    }
}

//! Local-host sensor backed by Linux sysfs.
//!
//! Power comes from the RAPL package energy counter
//! (`class/powercap/intel-rapl:0/energy_uj`), differentiated between reads.
//! Temperature comes from `class/thermal/thermal_zone0/temp` (millidegrees).
//! The host has no EM, acoustic or noise-floor instrumentation, so those
//! channels report [`SensorError::Unsupported`].

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use super::{Channel, Reading, SensorError, SensorSource};

/// The only device this backend measures.
pub const LOCAL_DEVICE: &str = "local";

const RAPL_ENERGY: &str = "class/powercap/intel-rapl:0/energy_uj";
const THERMAL_ZONE: &str = "class/thermal/thermal_zone0/temp";

/// Minimum spacing between the two counter reads of a power sample.
const MIN_POWER_INTERVAL: Duration = Duration::from_millis(2);

/// Rounds of SHA-256 over the workload buffer per triggered operation.
const WORKLOAD_ROUNDS: usize = 64;

pub struct SysfsSensor {
    root: PathBuf,
    last_energy: Mutex<Option<(u64, Instant)>>,
}

impl Default for SysfsSensor {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl SysfsSensor {
    /// Sensor reading sysfs under `root` (normally `/sys`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            last_energy: Mutex::new(None),
        }
    }

    /// Whether at least one supported channel is readable.
    pub fn is_available(&self) -> bool {
        self.root.join(RAPL_ENERGY).exists() || self.root.join(THERMAL_ZONE).exists()
    }

    fn check_device(device: &str) -> Result<(), SensorError> {
        if device != LOCAL_DEVICE {
            return Err(SensorError::UnknownDevice(device.to_string()));
        }
        Ok(())
    }

    fn read_energy_uj(&self) -> Result<u64, SensorError> {
        let raw = read_trimmed(&self.root.join(RAPL_ENERGY))?;
        raw.parse::<u64>()
            .map_err(|e| SensorError::Read(format!("energy_uj {raw:?}: {e}")))
    }
}

fn read_trimmed(path: &Path) -> Result<String, SensorError> {
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}

impl SensorSource for SysfsSensor {
    fn name(&self) -> &str {
        "sysfs"
    }

    fn read_power(&self, device: &str) -> Result<Reading, SensorError> {
        Self::check_device(device)?;
        let mut last = self.last_energy.lock().unwrap_or_else(PoisonError::into_inner);

        let (prev, prev_at) = match *last {
            Some(sample) => sample,
            None => {
                let first = (self.read_energy_uj()?, Instant::now());
                std::thread::sleep(MIN_POWER_INTERVAL);
                first
            }
        };
        if prev_at.elapsed() < MIN_POWER_INTERVAL {
            std::thread::sleep(MIN_POWER_INTERVAL - prev_at.elapsed());
        }

        let now = self.read_energy_uj()?;
        let now_at = Instant::now();
        *last = Some((now, now_at));

        if now < prev {
            return Err(SensorError::Read("RAPL energy counter wrapped".into()));
        }
        let elapsed_us = now_at.duration_since(prev_at).as_secs_f64() * 1e6;
        // uJ / us = W
        let mw = (now - prev) as f64 / elapsed_us * 1000.0;
        Ok(Reading::now(mw))
    }

    fn read_thermal(&self, device: &str) -> Result<Reading, SensorError> {
        Self::check_device(device)?;
        let raw = read_trimmed(&self.root.join(THERMAL_ZONE))?;
        let millis: f64 = raw
            .parse()
            .map_err(|e| SensorError::Read(format!("thermal_zone0 {raw:?}: {e}")))?;
        Ok(Reading::now(millis / 1000.0))
    }

    fn read_em(&self, _device: &str) -> Result<Reading, SensorError> {
        Err(SensorError::Unsupported(Channel::Electromagnetic))
    }

    fn read_acoustic(&self, _device: &str) -> Result<Reading, SensorError> {
        Err(SensorError::Unsupported(Channel::Acoustic))
    }

    fn read_noise(&self, _device: &str) -> Result<Reading, SensorError> {
        Err(SensorError::Unsupported(Channel::Noise))
    }

    /// Run a short hashing workload keyed by the operation name.
    fn trigger_operation(&self, device: &str, operation: &str) -> Result<(), SensorError> {
        Self::check_device(device)?;
        let mut block = [0u8; 4096];
        let mut digest: [u8; 32] = Sha256::digest(operation.as_bytes()).into();
        for _ in 0..WORKLOAD_ROUNDS {
            for chunk in block.chunks_mut(32) {
                chunk.copy_from_slice(&digest);
            }
            digest = Sha256::digest(block).into();
        }
        std::hint::black_box(digest);
        Ok(())
    }
}

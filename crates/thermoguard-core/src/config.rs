//! Engine configuration.
//!
//! Every detection threshold is a field here rather than a constant in the
//! detector that uses it. Defaults are the values the detectors were
//! calibrated with; deployments tune them against their own sensor noise
//! floors. Durations are (de)serialized as integer milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GuardError, Result};

/// Top-level configuration for a [`crate::SecurityEngine`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout for a single sensor read (one sample or one trace).
    #[serde(with = "duration_ms")]
    pub sensor_timeout: Duration,
    /// Default overall timeout for bounded operations (enroll, authenticate, leakage).
    #[serde(with = "duration_ms")]
    pub operation_timeout: Duration,
    /// Timeout for one actuator request (noise injection, memory wipe).
    #[serde(with = "duration_ms")]
    pub actuator_timeout: Duration,
    /// Mean relative feature deviation at which similarity reaches zero.
    pub similarity_tolerance: f64,
    pub puf: PufConfig,
    pub power: PowerConfig,
    pub thermal: ThermalConfig,
    pub leakage: LeakageConfig,
    pub registry: RegistryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sensor_timeout: Duration::from_secs(2),
            operation_timeout: Duration::from_secs(120),
            actuator_timeout: Duration::from_secs(5),
            similarity_tolerance: 0.30,
            puf: PufConfig::default(),
            power: PowerConfig::default(),
            thermal: ThermalConfig::default(),
            leakage: LeakageConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PufConfig {
    /// Samples drawn per channel on enrollment.
    pub enrollment_samples: usize,
    /// Samples drawn per channel for a fresh authentication.
    pub authentication_samples: usize,
    /// Split-half reproducibility below which a signature is flagged low-confidence.
    pub reproducibility_threshold: f64,
    /// Combined similarity required to authenticate.
    pub fuzzy_match_threshold: f64,
    /// Feature similarity between two devices above which one is a clone.
    pub clone_threshold: f64,
    /// Authentication confidence below which a clone alert is raised.
    pub clone_alert_confidence: f64,
    /// Weight of the fingerprint Hamming similarity in the combined score.
    pub hamming_weight: f64,
}

impl Default for PufConfig {
    fn default() -> Self {
        Self {
            enrollment_samples: 1000,
            authentication_samples: 500,
            reproducibility_threshold: 0.60,
            fuzzy_match_threshold: 0.70,
            clone_threshold: 0.70,
            clone_alert_confidence: 0.50,
            hamming_weight: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PowerConfig {
    /// Samples per power trace.
    pub trace_length: usize,
    /// FFT bins (excluding DC) kept in the spectral summary.
    pub spectrum_bins: usize,
    /// |z| of trace mean power above which SPA is flagged.
    pub spa_z_threshold: f64,
    /// Mean per-bin spectral deviation, in baseline standard deviations, above which SPA is flagged.
    pub spectral_deviation_multiple: f64,
    /// Rolling window capacity for DPA analysis.
    pub dpa_window: usize,
    /// Traces required in the window before DPA analysis runs.
    pub dpa_min_traces: usize,
    /// Mean off-diagonal |r| above which DPA is flagged.
    pub dpa_correlation_threshold: f64,
    /// Ratio of window to baseline variance-of-variances that flags DPA.
    pub vov_jump_factor: f64,
    /// Noise amplitude (mW) requested after an SPA detection.
    pub noise_amplitude_mw: f64,
    /// Amplitude multiplier applied for DPA countermeasures.
    pub dpa_noise_multiplier: f64,
    /// Delay between monitoring cycles.
    #[serde(with = "duration_ms")]
    pub cycle_interval: Duration,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            trace_length: 128,
            spectrum_bins: 16,
            spa_z_threshold: 3.0,
            spectral_deviation_multiple: 4.0,
            dpa_window: 100,
            dpa_min_traces: 100,
            dpa_correlation_threshold: 0.7,
            vov_jump_factor: 10.0,
            noise_amplitude_mw: 5.0,
            dpa_noise_multiplier: 3.0,
            cycle_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThermalConfig {
    /// Sampling period of the monitor and of baseline establishment.
    #[serde(with = "duration_ms")]
    pub sample_interval: Duration,
    /// Sliding window length in samples.
    pub window: usize,
    /// Samples required before the cooling-rate fit is trusted.
    pub min_fit_samples: usize,
    /// Cooling rate (°C/min, negative) below which a cold-boot attack is flagged.
    pub rapid_cooling_c_per_min: f64,
    /// Absolute deviation from baseline (°C) flagged as abnormal.
    pub deviation_threshold_c: f64,
    /// Temperature at or below which a critical event fires regardless of rate.
    pub freezing_c: f64,
    /// Window samples attached as forensic evidence on a cold-boot detection.
    pub forensic_samples: usize,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(1),
            window: 60,
            min_fit_samples: 10,
            rapid_cooling_c_per_min: -10.0,
            deviation_threshold_c: 10.0,
            freezing_c: 0.0,
            forensic_samples: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LeakageConfig {
    /// Observations collected per channel.
    pub observations: usize,
    /// Histogram bins used for entropy estimation.
    pub histogram_bins: usize,
    /// Severity cut points in leaked bits: negligible < low < medium < high < critical.
    pub negligible_below: f64,
    pub low_below: f64,
    pub medium_below: f64,
    pub high_below: f64,
}

impl Default for LeakageConfig {
    fn default() -> Self {
        Self {
            observations: 1000,
            histogram_bins: 256,
            negligible_below: 0.1,
            low_below: 1.0,
            medium_below: 10.0,
            high_below: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Similarity required to attribute an event to a known threat signature.
    pub signature_match_threshold: f64,
    /// Store write attempts before an event is logged locally and dropped from persistence.
    pub store_retry_attempts: u32,
    /// Backoff before the first retry; doubled on each subsequent one.
    #[serde(with = "duration_ms")]
    pub store_retry_backoff: Duration,
    /// Event bus capacity; the oldest undelivered notifications are dropped beyond it.
    pub bus_capacity: usize,
    /// Look-back window for active threats and device health.
    pub active_window_hours: i64,
    /// Federation domains a critical signature is broadcast to.
    pub affected_domains: Vec<String>,
    /// Upper bound on one federation broadcast.
    #[serde(with = "duration_ms")]
    pub broadcast_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            signature_match_threshold: 0.80,
            store_retry_attempts: 3,
            store_retry_backoff: Duration::from_millis(50),
            bus_capacity: 1024,
            active_window_hours: 24,
            affected_domains: vec!["hardware_security".to_string()],
            broadcast_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| GuardError::Config(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| GuardError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the detectors cannot operate with.
    pub fn validate(&self) -> Result<()> {
        fn unit(name: &str, v: f64) -> Result<()> {
            if !(0.0..=1.0).contains(&v) {
                return Err(GuardError::InvalidConfig(format!("{name} must be within [0, 1], got {v}")));
            }
            Ok(())
        }
        fn nonzero(name: &str, v: usize) -> Result<()> {
            if v == 0 {
                return Err(GuardError::InvalidConfig(format!("{name} must be non-zero")));
            }
            Ok(())
        }

        if self.similarity_tolerance <= 0.0 {
            return Err(GuardError::InvalidConfig("similarity_tolerance must be positive".into()));
        }
        unit("puf.reproducibility_threshold", self.puf.reproducibility_threshold)?;
        unit("puf.fuzzy_match_threshold", self.puf.fuzzy_match_threshold)?;
        unit("puf.clone_threshold", self.puf.clone_threshold)?;
        unit("puf.clone_alert_confidence", self.puf.clone_alert_confidence)?;
        unit("puf.hamming_weight", self.puf.hamming_weight)?;
        unit("power.dpa_correlation_threshold", self.power.dpa_correlation_threshold)?;
        unit("registry.signature_match_threshold", self.registry.signature_match_threshold)?;
        nonzero("puf.enrollment_samples", self.puf.enrollment_samples)?;
        nonzero("puf.authentication_samples", self.puf.authentication_samples)?;
        nonzero("power.trace_length", self.power.trace_length)?;
        nonzero("power.spectrum_bins", self.power.spectrum_bins)?;
        nonzero("power.dpa_window", self.power.dpa_window)?;
        nonzero("thermal.window", self.thermal.window)?;
        nonzero("leakage.observations", self.leakage.observations)?;
        nonzero("registry.bus_capacity", self.registry.bus_capacity)?;

        if self.puf.enrollment_samples < 16 {
            return Err(GuardError::InvalidConfig("puf.enrollment_samples must be at least 16".into()));
        }
        if self.power.dpa_min_traces > self.power.dpa_window {
            return Err(GuardError::InvalidConfig(
                "power.dpa_min_traces cannot exceed power.dpa_window".into(),
            ));
        }
        if self.power.spa_z_threshold <= 0.0 {
            return Err(GuardError::InvalidConfig("power.spa_z_threshold must be positive".into()));
        }
        if self.thermal.rapid_cooling_c_per_min >= 0.0 {
            return Err(GuardError::InvalidConfig(
                "thermal.rapid_cooling_c_per_min must be negative".into(),
            ));
        }
        if self.thermal.min_fit_samples < 2 || self.thermal.min_fit_samples > self.thermal.window {
            return Err(GuardError::InvalidConfig(
                "thermal.min_fit_samples must be within [2, thermal.window]".into(),
            ));
        }
        if self.leakage.histogram_bins < 2 {
            return Err(GuardError::InvalidConfig("leakage.histogram_bins must be at least 2".into()));
        }
        let cuts = [
            self.leakage.negligible_below,
            self.leakage.low_below,
            self.leakage.medium_below,
            self.leakage.high_below,
        ];
        if cuts.windows(2).any(|w| w[0] >= w[1]) {
            return Err(GuardError::InvalidConfig("leakage cut points must be increasing".into()));
        }
        Ok(())
    }
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

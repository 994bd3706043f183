//! Information leakage analyzer.
//!
//! Quantifies, in bits, how much of a secret one physical channel reveals.
//! Observations of the channel taken during repeated operations are binned
//! by rank into equal-occupancy bins and their entropy estimated
//! (Miller-Madow corrected). Continuous measurement noise of any shape fills
//! every bin evenly, outliers included. Mass concentrates only when the
//! channel keeps settling on the same few values, which is what a
//! deterministic, operation-dependent emission looks like. The further the
//! entropy falls below the uniform maximum, the larger the share of the
//! secret the channel is treated as revealing:
//!
//! ```text
//! information = secret_bits * (1 - H / log2(bins))
//! leaked      = min(information, secret_bits)
//! conditional = secret_bits - leaked
//! leakage     = max(secret_bits - conditional, 0)
//! ```
//!
//! Across channels the weakest one bounds overall security: the
//! multi-channel report carries the minimum remaining entropy, never an
//! average.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::LeakageConfig;
use crate::error::{GuardError, Result, validate_device, validate_operation};
use crate::model::{EventSource, Severity};
use crate::registry::NewSecurityEvent;
use crate::sensor::{Channel, SensorError, read_blocking};
use crate::services::Services;

pub const EVENT_LEAKAGE: &str = "information_leakage_detected";
const THREAT_CATEGORY: &str = "information_leakage";

/// Observations required for an entropy estimate.
pub const MIN_OBSERVATIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeakageSeverity {
    Negligible,
    Low,
    Medium,
    High,
    Critical,
}

impl LeakageSeverity {
    pub fn classify(leaked_bits: f64, config: &LeakageConfig) -> Self {
        if leaked_bits < config.negligible_below {
            Self::Negligible
        } else if leaked_bits < config.low_below {
            Self::Low
        } else if leaked_bits < config.medium_below {
            Self::Medium
        } else if leaked_bits < config.high_below {
            Self::High
        } else {
            Self::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Negligible => "negligible",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Event severity for results worth registering.
    pub fn event_severity(&self) -> Option<Severity> {
        match self {
            Self::Negligible | Self::Low => None,
            Self::Medium => Some(Severity::Medium),
            Self::High => Some(Severity::High),
            Self::Critical => Some(Severity::Critical),
        }
    }
}

impl std::fmt::Display for LeakageSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Qualitative effort needed to recover the secret given `remaining_bits`.
pub fn attack_complexity(remaining_bits: f64) -> &'static str {
    match remaining_bits {
        b if b >= 128.0 => "computationally infeasible",
        b if b >= 80.0 => "nation-state resources required",
        b if b >= 64.0 => "difficult",
        b if b >= 40.0 => "feasible with significant resources",
        b if b >= 20.0 => "practical",
        _ => "trivial",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeakageEstimate {
    pub observation_entropy_bits: f64,
    pub max_entropy_bits: f64,
    pub leaked_bits: f64,
    pub conditional_entropy_bits: f64,
    pub leakage_bits: f64,
}

impl LeakageEstimate {
    pub fn remaining_security_bits(&self, secret_bits: f64) -> f64 {
        (secret_bits - self.leakage_bits).max(0.0)
    }
}

/// Entropy-based leakage estimate of `observations` against a secret of
/// `secret_bits`.
pub fn estimate(observations: &[f64], bins: usize, secret_bits: f64) -> LeakageEstimate {
    let bins = bins.max(2);
    let histogram = thermoguard_stats::equal_frequency_histogram(observations, bins);
    let max_entropy = (bins as f64).log2();
    let entropy = thermoguard_stats::miller_madow_entropy_bits(&histogram.counts).clamp(0.0, max_entropy);

    let information = secret_bits * (1.0 - entropy / max_entropy);
    let leaked = information.clamp(0.0, secret_bits);
    let conditional = secret_bits - leaked;
    LeakageEstimate {
        observation_entropy_bits: entropy,
        max_entropy_bits: max_entropy,
        leaked_bits: leaked,
        conditional_entropy_bits: conditional,
        leakage_bits: (secret_bits - conditional).max(0.0),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeakageResult {
    pub device_id: String,
    pub operation: String,
    pub channel: Channel,
    pub secret_bits: f64,
    pub observations: usize,
    pub missed_observations: usize,
    #[serde(flatten)]
    pub estimate: LeakageEstimate,
    pub remaining_security_bits: f64,
    pub severity: LeakageSeverity,
    pub attack_complexity: &'static str,
    /// Registered event, for results of medium severity or worse.
    pub event_id: Option<String>,
    pub measured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedChannel {
    pub channel: Channel,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSweep {
    pub device_id: String,
    pub operation: String,
    pub secret_bits: f64,
    pub channels: Vec<LeakageResult>,
    pub skipped: Vec<SkippedChannel>,
    /// Sum of per-channel leakage, capped at the secret size.
    pub total_leakage_bits: f64,
    /// Remaining security of the weakest channel.
    pub min_remaining_security_bits: f64,
    pub weakest_channel: Option<Channel>,
    pub severity: LeakageSeverity,
    pub attack_complexity: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LeakageStatistics {
    pub measurements: u64,
    pub events_registered: u64,
    pub missed_observations: u64,
    pub max_leakage_bits: f64,
    pub min_remaining_security_bits: Option<f64>,
}

#[derive(Default)]
struct Counters {
    measurements: AtomicU64,
    events: AtomicU64,
    missed: AtomicU64,
    extremes: Mutex<(f64, Option<f64>)>,
}

pub struct LeakageAnalyzer {
    config: LeakageConfig,
    operation_timeout: Duration,
    services: Services,
    counters: Counters,
}

impl LeakageAnalyzer {
    pub fn new(config: LeakageConfig, operation_timeout: Duration, services: Services) -> Self {
        Self {
            config,
            operation_timeout,
            services,
            counters: Counters::default(),
        }
    }

    /// One observation of `channel` during a triggered `operation`.
    async fn observe(&self, device: &str, operation: &str, channel: Channel) -> Result<f64> {
        let (dev, op) = (device.to_string(), operation.to_string());
        read_blocking(&self.services.sensor, self.services.sensor_timeout, move |s| {
            if channel == Channel::Timing {
                return s.time_operation(&dev, &op);
            }
            s.trigger_operation(&dev, &op)?;
            s.read(&dev, channel).map(|r| r.value)
        })
        .await
    }

    async fn collect(&self, device: &str, operation: &str, channel: Channel) -> Result<(Vec<f64>, usize)> {
        let mut values = Vec::with_capacity(self.config.observations);
        let mut missed = 0;
        for _ in 0..self.config.observations {
            match self.observe(device, operation, channel).await {
                Ok(v) => values.push(v),
                Err(GuardError::Sensor(SensorError::Unsupported(c))) => {
                    return Err(SensorError::Unsupported(c).into());
                }
                Err(e) if e.is_transient() => {
                    missed += 1;
                    log::debug!("[{device}] {channel} observation missed: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        self.counters.missed.fetch_add(missed as u64, Ordering::Relaxed);
        if values.len() < MIN_OBSERVATIONS {
            return Err(GuardError::InsufficientSamples {
                got: values.len(),
                need: MIN_OBSERVATIONS,
            });
        }
        Ok((values, missed))
    }

    /// Measure leakage of one channel, bounded by the configured operation timeout.
    pub async fn measure_leakage(
        &self,
        device: &str,
        operation: &str,
        channel: Channel,
        secret_bits: f64,
    ) -> Result<LeakageResult> {
        self.measure_leakage_with_timeout(device, operation, channel, secret_bits, self.operation_timeout)
            .await
    }

    pub async fn measure_leakage_with_timeout(
        &self,
        device: &str,
        operation: &str,
        channel: Channel,
        secret_bits: f64,
        timeout: Duration,
    ) -> Result<LeakageResult> {
        validate_device(device)?;
        validate_operation(operation)?;
        if !(secret_bits.is_finite() && secret_bits > 0.0) {
            return Err(GuardError::InvalidConfig(format!(
                "secret size must be a positive number of bits, got {secret_bits}"
            )));
        }
        let (values, missed) = tokio::time::timeout(timeout, self.collect(device, operation, channel))
            .await
            .map_err(|_| GuardError::Timeout(timeout))??;

        let estimate = estimate(&values, self.config.histogram_bins, secret_bits);
        let severity = LeakageSeverity::classify(estimate.leakage_bits, &self.config);
        let remaining = estimate.remaining_security_bits(secret_bits);
        log::info!(
            "[{device}] {channel} leakage during {operation}: {:.2} of {secret_bits} bits ({severity:?})",
            estimate.leakage_bits
        );

        let mut result = LeakageResult {
            device_id: device.to_string(),
            operation: operation.to_string(),
            channel,
            secret_bits,
            observations: values.len(),
            missed_observations: missed,
            estimate,
            remaining_security_bits: remaining,
            severity,
            attack_complexity: attack_complexity(remaining),
            event_id: None,
            measured_at: Utc::now(),
        };
        self.record(&result);

        if let Some(event_severity) = severity.event_severity() {
            let id = self
                .services
                .registry
                .register_security_event(NewSecurityEvent {
                    event_type: EVENT_LEAKAGE.into(),
                    source: EventSource::Leakage,
                    device_id: device.to_string(),
                    severity: event_severity,
                    confidence: (result.observations as f64 / self.config.observations as f64).min(1.0),
                    data: json!({
                        "operation": operation,
                        "channel": channel,
                        "leakage_bits": result.estimate.leakage_bits,
                        "observation_entropy_bits": result.estimate.observation_entropy_bits,
                        "remaining_security_bits": remaining,
                        "secret_bits": secret_bits,
                    }),
                    threat_category: THREAT_CATEGORY.into(),
                })
                .await?;
            self.counters.events.fetch_add(1, Ordering::Relaxed);
            result.event_id = Some(id);
        }
        Ok(result)
    }

    /// Measure every leakage channel. Channels the sensor cannot observe are
    /// reported as skipped.
    pub async fn measure_all_channels(&self, device: &str, operation: &str, secret_bits: f64) -> Result<ChannelSweep> {
        validate_device(device)?;
        validate_operation(operation)?;
        let mut channels = Vec::new();
        let mut skipped = Vec::new();
        for channel in Channel::LEAKAGE {
            match self.measure_leakage(device, operation, channel, secret_bits).await {
                Ok(r) => channels.push(r),
                Err(e) if e.is_transient() || matches!(e, GuardError::Timeout(_)) => {
                    log::warn!("[{device}] {channel} skipped: {e}");
                    skipped.push(SkippedChannel {
                        channel,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let weakest = channels
            .iter()
            .min_by(|a, b| a.remaining_security_bits.total_cmp(&b.remaining_security_bits));
        let min_remaining = weakest.map_or(secret_bits, |r| r.remaining_security_bits);
        let weakest_channel = weakest.map(|r| r.channel);
        let total = channels
            .iter()
            .map(|r| r.estimate.leakage_bits)
            .sum::<f64>()
            .min(secret_bits);

        Ok(ChannelSweep {
            device_id: device.to_string(),
            operation: operation.to_string(),
            secret_bits,
            severity: LeakageSeverity::classify(secret_bits - min_remaining, &self.config),
            attack_complexity: attack_complexity(min_remaining),
            channels,
            skipped,
            total_leakage_bits: total,
            min_remaining_security_bits: min_remaining,
            weakest_channel,
        })
    }

    fn record(&self, result: &LeakageResult) {
        self.counters.measurements.fetch_add(1, Ordering::Relaxed);
        let mut extremes = self.counters.extremes.lock().unwrap_or_else(PoisonError::into_inner);
        extremes.0 = extremes.0.max(result.estimate.leakage_bits);
        extremes.1 = Some(
            extremes
                .1
                .map_or(result.remaining_security_bits, |m| m.min(result.remaining_security_bits)),
        );
    }

    pub fn statistics(&self) -> LeakageStatistics {
        let (max_leakage, min_remaining) = *self.counters.extremes.lock().unwrap_or_else(PoisonError::into_inner);
        LeakageStatistics {
            measurements: self.counters.measurements.load(Ordering::Relaxed),
            events_registered: self.counters.events.load(Ordering::Relaxed),
            missed_observations: self.counters.missed.load(Ordering::Relaxed),
            max_leakage_bits: max_leakage,
            min_remaining_security_bits: min_remaining,
        }
    }
}

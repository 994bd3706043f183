//! Thermodynamic PUF engine.
//!
//! A device's fingerprint is built from multi-channel measurements: power,
//! thermal, electromagnetic, device noise, and the entropy production rate
//! derived from power and temperature. Each channel contributes a
//! [`Summary`](thermoguard_stats::Summary) of seven statistics; the feature
//! vector is hashed into the fingerprint.
//!
//! Channels a sensor reports as unsupported are left out of the vector.
//! Reproducibility is the similarity between the feature vectors of the two
//! halves of the enrollment sample set.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::config::PufConfig;
use crate::error::{GuardError, Result, validate_device};
use crate::features::{FeatureVector, fingerprint_hex, hamming_similarity, similarity};
use crate::model::{EventSource, PufSignature, Severity};
use crate::registry::NewSecurityEvent;
use crate::sensor::{Channel, SensorError, read_blocking};
use crate::services::Services;

/// Feature namespace of the derived entropy production channel.
pub const ENTROPY_PRODUCTION: &str = "entropy_production";

/// Fewest samples a channel needs to contribute features.
const MIN_CHANNEL_SAMPLES: usize = 16;

pub const EVENT_CLONE_SUSPECTED: &str = "puf_clone_suspected";
pub const EVENT_CLONE_DETECTED: &str = "puf_clone_detected";
const THREAT_CATEGORY: &str = "hardware_cloning";

/// Outcome of [`PufEngine::authenticate`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AuthenticationResult {
    pub authenticated: bool,
    pub confidence: f64,
    /// The stored signature was enrolled with low reproducibility.
    pub low_confidence: bool,
    pub hamming_similarity: f64,
    pub feature_similarity: f64,
}

/// Outcome of [`PufEngine::detect_clone`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CloneCheck {
    pub is_clone: bool,
    pub similarity: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PufStatistics {
    pub enrolled_devices: usize,
    pub low_confidence_signatures: usize,
    pub enrollments: u64,
    pub authentications: u64,
    pub successful_authentications: u64,
    pub failed_authentications: u64,
    pub clone_alerts: u64,
    pub clone_checks: u64,
    pub clones_detected: u64,
    pub missed_samples: u64,
}

#[derive(Default)]
struct Counters {
    enrollments: AtomicU64,
    authentications: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    clone_alerts: AtomicU64,
    clone_checks: AtomicU64,
    clones_detected: AtomicU64,
    missed_samples: AtomicU64,
}

/// Entropy production rate `P / T` in W/K for power in mW and temperature in °C.
pub fn entropy_production(power_mw: f64, temperature_c: f64) -> Option<f64> {
    let kelvin = temperature_c + 273.15;
    (kelvin > 0.0).then(|| power_mw / 1000.0 / kelvin)
}

/// Feature vector of per-channel sample series.
pub fn extract_features(series: &BTreeMap<&'static str, Vec<f64>>) -> FeatureVector {
    let mut features = FeatureVector::new();
    for (channel, values) in series {
        if values.len() < MIN_CHANNEL_SAMPLES {
            continue;
        }
        let summary = thermoguard_stats::summarize(values);
        for (name, value) in summary.fields() {
            features.insert(format!("{channel}.{name}"), value);
        }
    }
    features
}

/// Split-half reproducibility of a sample set.
pub fn split_half_reproducibility(series: &BTreeMap<&'static str, Vec<f64>>, tolerance: f64) -> f64 {
    let mut first = BTreeMap::new();
    let mut second = BTreeMap::new();
    for (channel, values) in series {
        let mid = values.len() / 2;
        first.insert(*channel, values[..mid].to_vec());
        second.insert(*channel, values[mid..].to_vec());
    }
    similarity(&extract_features(&first), &extract_features(&second), tolerance)
}

pub struct PufEngine {
    config: PufConfig,
    tolerance: f64,
    operation_timeout: Duration,
    services: Services,
    counters: Counters,
}

impl PufEngine {
    pub fn new(config: PufConfig, tolerance: f64, operation_timeout: Duration, services: Services) -> Self {
        Self {
            config,
            tolerance,
            operation_timeout,
            services,
            counters: Counters::default(),
        }
    }

    /// Draw `n` multi-channel samples. Failed reads are skipped and counted.
    async fn collect(&self, device: &str, n: usize) -> Result<BTreeMap<&'static str, Vec<f64>>> {
        let mut series: BTreeMap<&'static str, Vec<f64>> = BTreeMap::new();
        let mut unsupported: HashSet<Channel> = HashSet::new();

        for _ in 0..n {
            let dev = device.to_string();
            let skip = unsupported.clone();
            let reads = read_blocking(&self.services.sensor, self.services.sensor_timeout, move |s| {
                Ok(Channel::PUF.map(|c| (!skip.contains(&c)).then(|| s.read(&dev, c))))
            })
            .await;
            let reads = match reads {
                Ok(r) => r,
                Err(e) if e.is_transient() => {
                    self.counters.missed_samples.fetch_add(1, Ordering::Relaxed);
                    log::debug!("[{device}] PUF sample missed: {e}");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let (mut power, mut thermal) = (None, None);
            for (channel, read) in Channel::PUF.into_iter().zip(reads) {
                match read {
                    None => {}
                    Some(Ok(reading)) => {
                        series.entry(channel.as_str()).or_default().push(reading.value);
                        match channel {
                            Channel::Power => power = Some(reading.value),
                            Channel::Thermal => thermal = Some(reading.value),
                            _ => {}
                        }
                    }
                    Some(Err(SensorError::Unsupported(_))) => {
                        log::debug!("[{device}] {channel} unsupported, excluded from PUF");
                        unsupported.insert(channel);
                    }
                    Some(Err(e)) => {
                        self.counters.missed_samples.fetch_add(1, Ordering::Relaxed);
                        log::debug!("[{device}] {channel} read failed: {e}");
                    }
                }
            }
            if let Some(ep) = power.zip(thermal).and_then(|(p, t)| entropy_production(p, t)) {
                series.entry(ENTROPY_PRODUCTION).or_default().push(ep);
            }
        }

        let longest = series.values().map(Vec::len).max().unwrap_or(0);
        if longest < MIN_CHANNEL_SAMPLES {
            return Err(GuardError::InsufficientSamples {
                got: longest,
                need: MIN_CHANNEL_SAMPLES,
            });
        }
        Ok(series)
    }

    // -----------------------------------------------------------------------
    // Enrollment
    // -----------------------------------------------------------------------

    /// Enroll `device` from `sample_count` samples, bounded by the configured
    /// operation timeout. Supersedes any previous signature.
    pub async fn enroll(&self, device: &str, sample_count: usize) -> Result<PufSignature> {
        self.enroll_with_timeout(device, sample_count, self.operation_timeout).await
    }

    pub async fn enroll_with_timeout(
        &self,
        device: &str,
        sample_count: usize,
        timeout: Duration,
    ) -> Result<PufSignature> {
        validate_device(device)?;
        let series = tokio::time::timeout(timeout, self.collect(device, sample_count.max(2 * MIN_CHANNEL_SAMPLES)))
            .await
            .map_err(|_| GuardError::Timeout(timeout))??;

        let features = extract_features(&series);
        let reproducibility = split_half_reproducibility(&series, self.tolerance);
        let low_confidence = reproducibility < self.config.reproducibility_threshold;
        if low_confidence {
            log::warn!(
                "[{device}] PUF reproducibility {reproducibility:.3} below {:.2}; signature flagged low-confidence",
                self.config.reproducibility_threshold
            );
        }

        let signature = PufSignature {
            device_id: device.to_string(),
            fingerprint: fingerprint_hex(&features),
            thermodynamic_feature_vector: features,
            reproducibility_score: reproducibility,
            low_confidence,
            created_at: Utc::now(),
            last_validated: None,
            validation_count: 0,
            failed_validations: 0,
        };
        if let Err(e) = self.services.baselines.put_signature(signature.clone()).await {
            log::warn!("[{device}] PUF signature not persisted: {e}");
        }
        self.counters.enrollments.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "[{device}] enrolled: {} features, reproducibility {reproducibility:.3}, fingerprint {}",
            signature.thermodynamic_feature_vector.len(),
            &signature.fingerprint[..16]
        );
        Ok(signature)
    }

    // -----------------------------------------------------------------------
    // Authentication
    // -----------------------------------------------------------------------

    pub async fn authenticate(&self, device: &str, fresh: bool) -> Result<AuthenticationResult> {
        self.authenticate_with_timeout(device, fresh, self.operation_timeout).await
    }

    /// Score `device` against its stored signature.
    ///
    /// With `fresh`, a new, smaller measurement is taken; otherwise the stored
    /// fingerprint is reused. A confidence below the clone-alert level
    /// registers a `puf_clone_suspected` event.
    pub async fn authenticate_with_timeout(
        &self,
        device: &str,
        fresh: bool,
        timeout: Duration,
    ) -> Result<AuthenticationResult> {
        validate_device(device)?;
        let stored = self.services.baselines.require_signature(device)?;

        let (features, fingerprint) = if fresh {
            let series = tokio::time::timeout(timeout, self.collect(device, self.config.authentication_samples))
                .await
                .map_err(|_| GuardError::Timeout(timeout))??;
            let features = extract_features(&series);
            let fingerprint = fingerprint_hex(&features);
            (features, fingerprint)
        } else {
            (stored.thermodynamic_feature_vector.clone(), stored.fingerprint.clone())
        };

        let hamming = hamming_similarity(&stored.fingerprint, &fingerprint);
        let feature_sim = similarity(&stored.thermodynamic_feature_vector, &features, self.tolerance);
        let w = self.config.hamming_weight;
        let confidence = (w * hamming + (1.0 - w) * feature_sim).clamp(0.0, 1.0);
        let authenticated = confidence >= self.config.fuzzy_match_threshold;

        self.counters.authentications.fetch_add(1, Ordering::Relaxed);
        if authenticated {
            self.counters.successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        let update = self
            .services
            .baselines
            .update_signature(device, |s| {
                s.validation_count += 1;
                s.last_validated = Some(Utc::now());
                if !authenticated {
                    s.failed_validations += 1;
                }
            })
            .await;
        if let Err(e) = update {
            log::warn!("[{device}] validation counters not persisted: {e}");
        }

        log::info!("[{device}] authentication {authenticated} (confidence {confidence:.3}, fresh {fresh})");

        if confidence < self.config.clone_alert_confidence {
            self.counters.clone_alerts.fetch_add(1, Ordering::Relaxed);
            self.services.registry
                .register_security_event(NewSecurityEvent {
                    event_type: EVENT_CLONE_SUSPECTED.into(),
                    source: EventSource::Puf,
                    device_id: device.to_string(),
                    severity: Severity::High,
                    confidence: 1.0 - confidence,
                    data: json!({
                        "authentication_confidence": confidence,
                        "hamming_similarity": hamming,
                        "feature_similarity": feature_sim,
                        "fresh": fresh,
                    }),
                    threat_category: THREAT_CATEGORY.into(),
                })
                .await?;
        }

        Ok(AuthenticationResult {
            authenticated,
            confidence,
            low_confidence: stored.low_confidence,
            hamming_similarity: hamming,
            feature_similarity: feature_sim,
        })
    }

    // -----------------------------------------------------------------------
    // Clone detection
    // -----------------------------------------------------------------------

    /// Compare the stored signatures of two different devices. Independent
    /// devices should be dissimilar; similarity above the clone threshold
    /// registers a critical `puf_clone_detected` event against `device_b`.
    pub async fn detect_clone(&self, device_a: &str, device_b: &str) -> Result<CloneCheck> {
        validate_device(device_a)?;
        validate_device(device_b)?;
        if device_a == device_b {
            return Err(GuardError::InvalidDevice(format!(
                "clone check needs two different devices, got {device_a} twice"
            )));
        }
        let a = self.services.baselines.require_signature(device_a)?;
        let b = self.services.baselines.require_signature(device_b)?;

        let sim = similarity(
            &a.thermodynamic_feature_vector,
            &b.thermodynamic_feature_vector,
            self.tolerance,
        );
        let is_clone = sim > self.config.clone_threshold;
        self.counters.clone_checks.fetch_add(1, Ordering::Relaxed);

        if is_clone {
            self.counters.clones_detected.fetch_add(1, Ordering::Relaxed);
            self.services.registry
                .register_security_event(NewSecurityEvent {
                    event_type: EVENT_CLONE_DETECTED.into(),
                    source: EventSource::Puf,
                    device_id: device_b.to_string(),
                    severity: Severity::Critical,
                    confidence: sim,
                    data: json!({
                        "device_a": device_a,
                        "device_b": device_b,
                        "similarity": sim,
                        "clone_threshold": self.config.clone_threshold,
                    }),
                    threat_category: THREAT_CATEGORY.into(),
                })
                .await?;
        }
        Ok(CloneCheck {
            is_clone,
            similarity: sim,
        })
    }

    pub fn statistics(&self) -> PufStatistics {
        let signatures = self.services.baselines.signatures();
        PufStatistics {
            enrolled_devices: signatures.len(),
            low_confidence_signatures: signatures.iter().filter(|s| s.low_confidence).count(),
            enrollments: self.counters.enrollments.load(Ordering::Relaxed),
            authentications: self.counters.authentications.load(Ordering::Relaxed),
            successful_authentications: self.counters.successes.load(Ordering::Relaxed),
            failed_authentications: self.counters.failures.load(Ordering::Relaxed),
            clone_alerts: self.counters.clone_alerts.load(Ordering::Relaxed),
            clone_checks: self.counters.clone_checks.load(Ordering::Relaxed),
            clones_detected: self.counters.clones_detected.load(Ordering::Relaxed),
            missed_samples: self.counters.missed_samples.load(Ordering::Relaxed),
        }
    }
}

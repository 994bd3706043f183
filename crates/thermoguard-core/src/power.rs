//! Power analysis detector (SPA / DPA).
//!
//! A baseline summarizes traces of one (device, operation) pair captured
//! during legitimate triggered operations. Each monitoring cycle captures one
//! trace and runs:
//!
//! - **SPA**: z-score of the trace mean against the baseline, plus the mean
//!   per-bin deviation of its magnitude spectrum in baseline standard
//!   deviations. Either over its threshold flags a `high` event.
//! - **DPA**: once the rolling window is full enough, the mean absolute
//!   off-diagonal correlation of the window's traces, and the window's
//!   variance-of-variances against the baseline's. Traces an attacker
//!   captures in lock-step with the operation correlate strongly. Flags a
//!   `critical` event and clears the window.
//!
//! Every detection requests noise injection from the actuator, with the
//! amplitude scaled up for DPA. SPA latches: a deviation that persists over
//! consecutive traces is one incident, reported once, until a trace comes
//! back within the baseline.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::actuator::NoiseProfile;
use crate::config::PowerConfig;
use crate::error::{GuardError, Result, device_operation_key, validate_device, validate_operation};
use crate::model::{EventSource, PowerBaseline, Severity, actions};
use crate::monitor::{CancelFlag, MonitorReport, MonitorSet};
use crate::registry::NewSecurityEvent;
use crate::sensor::read_blocking;
use crate::services::Services;
use crate::window::ObservationWindow;

pub const EVENT_SPA: &str = "spa_attack_detected";
pub const EVENT_DPA: &str = "dpa_attack_detected";
const THREAT_CATEGORY: &str = "side_channel";

/// Traces required to establish a baseline.
pub const MIN_BASELINE_TRACES: usize = 2;

// ---------------------------------------------------------------------------
// Baseline construction
// ---------------------------------------------------------------------------

/// Summarize legitimate traces into a [`PowerBaseline`].
pub fn build_baseline(
    device: &str,
    operation: &str,
    traces: &[Vec<f64>],
    spectrum_bins: usize,
) -> Result<PowerBaseline> {
    if traces.len() < MIN_BASELINE_TRACES {
        return Err(GuardError::InsufficientSamples {
            got: traces.len(),
            need: MIN_BASELINE_TRACES,
        });
    }
    let len = traces.iter().map(Vec::len).min().unwrap_or(0);
    if len < 2 {
        return Err(GuardError::InsufficientSamples { got: len, need: 2 });
    }

    let means: Vec<f64> = traces.iter().map(|t| thermoguard_stats::mean(t)).collect();
    let variances: Vec<f64> = traces.iter().map(|t| thermoguard_stats::variance(t)).collect();

    let column = |i: usize| -> Vec<f64> { traces.iter().map(|t| t[i]).collect() };
    let (envelope_mean, envelope_std): (Vec<f64>, Vec<f64>) = (0..len)
        .map(|i| {
            let c = column(i);
            (thermoguard_stats::mean(&c), thermoguard_stats::std_dev(&c))
        })
        .unzip();

    let spectra: Vec<Vec<f64>> = traces
        .iter()
        .map(|t| thermoguard_stats::magnitude_spectrum(t, spectrum_bins))
        .collect();
    let (spectrum_mean, spectrum_std): (Vec<f64>, Vec<f64>) = (0..spectrum_bins)
        .map(|k| {
            let c: Vec<f64> = spectra.iter().map(|s| s[k]).collect();
            (thermoguard_stats::mean(&c), thermoguard_stats::std_dev(&c))
        })
        .unzip();

    Ok(PowerBaseline {
        device_id: device.to_string(),
        operation: operation.to_string(),
        trace_count: traces.len(),
        mean_power: thermoguard_stats::mean(&means),
        std_power: thermoguard_stats::std_dev(&means),
        envelope_mean,
        envelope_std,
        spectrum_mean,
        spectrum_std,
        variance_of_variances: thermoguard_stats::variance(&variances),
        established_at: Utc::now(),
    })
}

// ---------------------------------------------------------------------------
// Per-trace analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpaFinding {
    pub mean_power_mw: f64,
    pub z_score: f64,
    /// Two-sided normal tail probability of `z_score`.
    pub p_value: f64,
    /// Mean per-bin spectral deviation in baseline standard deviations.
    pub spectral_deviation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DpaFinding {
    pub mean_correlation: f64,
    /// Window variance-of-variances over the baseline's (0 when the baseline has none).
    pub vov_ratio: f64,
    pub traces: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PowerFinding {
    Spa(SpaFinding),
    Dpa(DpaFinding),
}

/// Detection state of one monitor: the baseline it compares against, its
/// exclusively owned window of recent traces and the SPA incident latch.
pub struct PowerAnalyzer {
    config: PowerConfig,
    baseline: Arc<PowerBaseline>,
    window: ObservationWindow<Vec<f64>>,
    spa_latched: bool,
}

fn floor_std(std: f64, reference: f64) -> f64 {
    std.max(reference.abs() * 1e-3).max(1e-9)
}

impl PowerAnalyzer {
    pub fn new(config: PowerConfig, baseline: Arc<PowerBaseline>) -> Self {
        let window = ObservationWindow::new(config.dpa_window);
        Self {
            config,
            baseline,
            window,
            spa_latched: false,
        }
    }

    pub fn baseline(&self) -> &Arc<PowerBaseline> {
        &self.baseline
    }

    /// Switch to a re-established baseline. The trace window is kept.
    pub fn set_baseline(&mut self, baseline: Arc<PowerBaseline>) {
        self.baseline = baseline;
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Whether an SPA incident is open.
    pub fn spa_latched(&self) -> bool {
        self.spa_latched
    }

    /// SPA statistics of one trace without recording it.
    pub fn spa_statistics(&self, trace: &[f64]) -> SpaFinding {
        let b = &self.baseline;
        let mean_power = thermoguard_stats::mean(trace);
        let z = (mean_power - b.mean_power) / floor_std(b.std_power, b.mean_power);

        let spectrum = thermoguard_stats::magnitude_spectrum(trace, b.spectrum_mean.len());
        let reference = thermoguard_stats::mean(&b.spectrum_mean);
        let spectral_deviation = if spectrum.is_empty() {
            0.0
        } else {
            spectrum
                .iter()
                .zip(b.spectrum_mean.iter().zip(&b.spectrum_std))
                .map(|(s, (m, sd))| (s - m).abs() / floor_std(*sd, reference))
                .sum::<f64>()
                / spectrum.len() as f64
        };

        SpaFinding {
            mean_power_mw: mean_power,
            z_score: z,
            p_value: thermoguard_stats::normal_two_sided_p(z),
            spectral_deviation,
        }
    }

    /// DPA statistics of the current window.
    pub fn dpa_statistics(&self) -> DpaFinding {
        let traces: Vec<&[f64]> = self.window.iter().map(Vec::as_slice).collect();
        let mean_correlation = thermoguard_stats::mean_abs_offdiagonal_correlation(&traces);
        let variances: Vec<f64> = traces.iter().map(|t| thermoguard_stats::variance(t)).collect();
        let window_vov = thermoguard_stats::variance(&variances);
        let vov_ratio = if self.baseline.variance_of_variances > 1e-12 {
            window_vov / self.baseline.variance_of_variances
        } else {
            0.0
        };
        DpaFinding {
            mean_correlation,
            vov_ratio,
            traces: traces.len(),
        }
    }

    /// Analyze one trace and add it to the window.
    pub fn observe(&mut self, trace: Vec<f64>) -> Vec<PowerFinding> {
        let mut findings = Vec::new();

        let spa = self.spa_statistics(&trace);
        let deviates = spa.z_score.abs() > self.config.spa_z_threshold
            || spa.spectral_deviation > self.config.spectral_deviation_multiple;
        if deviates && !self.spa_latched {
            self.spa_latched = true;
            findings.push(PowerFinding::Spa(spa));
        } else if !deviates && self.spa_latched {
            self.spa_latched = false;
            log::info!("[{}] power back within baseline, SPA incident cleared", self.baseline.device_id);
        }

        self.window.push(trace);
        if self.window.len() >= self.config.dpa_min_traces {
            let dpa = self.dpa_statistics();
            if dpa.mean_correlation > self.config.dpa_correlation_threshold
                || dpa.vov_ratio > self.config.vov_jump_factor
            {
                self.window.clear();
                findings.push(PowerFinding::Dpa(dpa));
            }
        }
        findings
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PowerStatistics {
    pub baselines: usize,
    pub active_monitors: Vec<String>,
    pub traces_analyzed: u64,
    pub missed_traces: u64,
    pub spa_detections: u64,
    pub dpa_detections: u64,
}

#[derive(Default)]
struct Counters {
    traces: AtomicU64,
    missed: AtomicU64,
    spa: AtomicU64,
    dpa: AtomicU64,
}

pub struct PowerDetector {
    config: PowerConfig,
    services: Services,
    monitors: MonitorSet,
    counters: Counters,
}

fn monitor_key(device: &str, operation: &str) -> String {
    device_operation_key(device, operation)
}

impl PowerDetector {
    pub fn new(config: PowerConfig, services: Services) -> Self {
        Self {
            config,
            services,
            monitors: MonitorSet::new("power"),
            counters: Counters::default(),
        }
    }

    async fn capture(&self, device: &str, operation: &str) -> Result<Vec<f64>> {
        let (dev, op, len) = (device.to_string(), operation.to_string(), self.config.trace_length);
        read_blocking(&self.services.sensor, self.services.sensor_timeout, move |s| {
            s.capture_power_trace(&dev, &op, len)
        })
        .await
    }

    /// Capture `n` traces of `operation` and install them as the baseline.
    /// Missed traces are skipped.
    pub async fn establish_baseline(&self, device: &str, operation: &str, n: usize) -> Result<Arc<PowerBaseline>> {
        validate_device(device)?;
        validate_operation(operation)?;
        let mut traces = Vec::with_capacity(n);
        for _ in 0..n {
            match self.capture(device, operation).await {
                Ok(t) => traces.push(t),
                Err(e) if e.is_transient() => {
                    self.counters.missed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("[{device}] baseline trace missed: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        self.install_baseline(device, operation, &traces).await
    }

    /// Install a baseline built from already captured traces.
    pub async fn install_baseline(
        &self,
        device: &str,
        operation: &str,
        traces: &[Vec<f64>],
    ) -> Result<Arc<PowerBaseline>> {
        validate_device(device)?;
        validate_operation(operation)?;
        let baseline = build_baseline(device, operation, traces, self.config.spectrum_bins)?;
        log::info!(
            "[{device}] power baseline for {operation}: {:.2} ± {:.2} mW over {} traces",
            baseline.mean_power,
            baseline.std_power,
            baseline.trace_count
        );
        match self.services.baselines.put_power(baseline).await {
            Ok(b) => Ok(b),
            Err(e) => {
                log::warn!("[{device}] power baseline not persisted: {e}");
                self.services.baselines.require_power(device, operation)
            }
        }
    }

    /// Analyzer for `device`/`operation` against its current baseline.
    pub fn analyzer(&self, device: &str, operation: &str) -> Result<PowerAnalyzer> {
        validate_device(device)?;
        validate_operation(operation)?;
        let baseline = self.services.baselines.require_power(device, operation)?;
        Ok(PowerAnalyzer::new(self.config.clone(), baseline))
    }

    /// Run one trace through `analyzer` and respond to every finding.
    /// Returns the ids of the registered events.
    pub async fn process_trace(
        &self,
        analyzer: &mut PowerAnalyzer,
        device: &str,
        operation: &str,
        trace: Vec<f64>,
    ) -> Result<Vec<String>> {
        self.counters.traces.fetch_add(1, Ordering::Relaxed);
        let mut ids = Vec::new();
        for finding in analyzer.observe(trace) {
            ids.push(self.respond(device, operation, finding).await?);
        }
        Ok(ids)
    }

    async fn respond(&self, device: &str, operation: &str, finding: PowerFinding) -> Result<String> {
        let (event_type, severity, confidence, data, amplitude, attack) = match &finding {
            PowerFinding::Spa(f) => {
                self.counters.spa.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "[{device}] SPA suspected during {operation}: z = {:.2}, spectral deviation {:.2}",
                    f.z_score,
                    f.spectral_deviation
                );
                (
                    EVENT_SPA,
                    Severity::High,
                    1.0 - f.p_value,
                    json!({
                        "operation": operation,
                        "mean_power_mw": f.mean_power_mw,
                        "z_score": f.z_score,
                        "p_value": f.p_value,
                        "spectral_deviation": f.spectral_deviation,
                    }),
                    self.config.noise_amplitude_mw,
                    "spa",
                )
            }
            PowerFinding::Dpa(f) => {
                self.counters.dpa.fetch_add(1, Ordering::Relaxed);
                (
                    EVENT_DPA,
                    Severity::Critical,
                    f.mean_correlation.max((f.vov_ratio / (2.0 * self.config.vov_jump_factor)).min(1.0)),
                    json!({
                        "operation": operation,
                        "mean_correlation": f.mean_correlation,
                        "vov_ratio": f.vov_ratio,
                        "traces": f.traces,
                    }),
                    self.config.noise_amplitude_mw * self.config.dpa_noise_multiplier,
                    "dpa",
                )
            }
        };

        let event_id = self
            .services
            .registry
            .register_security_event(NewSecurityEvent {
                event_type: event_type.into(),
                source: EventSource::PowerAnalysis,
                device_id: device.to_string(),
                severity,
                confidence,
                data,
                threat_category: THREAT_CATEGORY.into(),
            })
            .await?;

        let dev = device.to_string();
        let profile = NoiseProfile {
            amplitude_mw: amplitude,
            attack: attack.to_string(),
        };
        self.services
            .mitigate(device, &event_id, actions::POWER_NOISE_INJECTION, move |a| {
                a.inject_power_noise(&dev, &profile)
            })
            .await;
        Ok(event_id)
    }

    // -----------------------------------------------------------------------
    // Monitoring lifecycle
    // -----------------------------------------------------------------------

    /// Start monitoring `device` while it runs `operation`.
    ///
    /// Fails immediately with `NotBaselined`, `InvalidDevice` or
    /// `InvalidOperation`; once running, no sensor or store failure ends the
    /// task.
    pub fn start_monitoring(self: &Arc<Self>, device: &str, operation: &str) -> Result<()> {
        let analyzer = self.analyzer(device, operation)?;
        let this = Arc::clone(self);
        let (dev, op) = (device.to_string(), operation.to_string());
        self.monitors
            .start(monitor_key(device, operation), move |cancel| this.run(dev, op, analyzer, cancel))
    }

    pub async fn stop_monitoring(&self, device: &str, operation: &str) -> Option<MonitorReport> {
        self.monitors.stop(&monitor_key(device, operation)).await
    }

    pub fn active_monitors(&self) -> Vec<String> {
        self.monitors.active()
    }

    pub async fn stop_all(&self) -> Vec<MonitorReport> {
        self.monitors.stop_all().await
    }

    async fn run(
        self: Arc<Self>,
        device: String,
        operation: String,
        mut analyzer: PowerAnalyzer,
        cancel: CancelFlag,
    ) -> MonitorReport {
        let mut report = MonitorReport {
            key: monitor_key(&device, &operation),
            ..Default::default()
        };
        while !cancel.is_cancelled() {
            report.cycles += 1;
            if let Some(current) = self.services.baselines.power(&device, &operation) {
                if !Arc::ptr_eq(&current, analyzer.baseline()) {
                    log::info!("[{device}] power monitor picked up re-established baseline");
                    analyzer.set_baseline(current);
                }
            }

            match self.capture(&device, &operation).await {
                Ok(trace) => match self.process_trace(&mut analyzer, &device, &operation, trace).await {
                    Ok(ids) => report.events += ids.len() as u64,
                    Err(e) => log::warn!("[{device}] power finding not registered: {e}"),
                },
                Err(e) => {
                    report.missed_samples += 1;
                    self.counters.missed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("[{device}] power trace missed: {e}");
                }
            }
            tokio::time::sleep(self.config.cycle_interval).await;
        }
        report
    }

    pub fn statistics(&self) -> PowerStatistics {
        PowerStatistics {
            baselines: self.services.baselines.power_count(),
            active_monitors: self.active_monitors(),
            traces_analyzed: self.counters.traces.load(Ordering::Relaxed),
            missed_traces: self.counters.missed.load(Ordering::Relaxed),
            spa_detections: self.counters.spa.load(Ordering::Relaxed),
            dpa_detections: self.counters.dpa.load(Ordering::Relaxed),
        }
    }
}

//! Thermal monitor (cold-boot defense).
//!
//! Samples device temperature into a sliding window. Each sample is checked
//! in order:
//!
//! 1. cooling rate (least-squares slope of temperature over time) below the
//!    rapid-cooling threshold: critical `cold_boot_attack_detected`, window
//!    tail attached as forensic evidence, memory wipe requested;
//! 2. temperature at or below freezing: critical
//!    `freezing_temperature_detected`, memory wipe requested;
//! 3. deviation from baseline beyond the absolute threshold: medium
//!    `abnormal_temperature`.
//!
//! A response latches the device until no check fires, so one incident
//! produces one event and at most one wipe. A later critical finding still
//! escalates a medium incident.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::config::ThermalConfig;
use crate::error::{GuardError, Result, validate_device};
use crate::model::{EventSource, Severity, ThermalBaseline, actions};
use crate::monitor::{CancelFlag, MonitorReport, MonitorSet};
use crate::registry::NewSecurityEvent;
use crate::sensor::{Reading, read_blocking};
use crate::services::Services;
use crate::window::ObservationWindow;

pub const EVENT_COLD_BOOT: &str = "cold_boot_attack_detected";
pub const EVENT_FREEZING: &str = "freezing_temperature_detected";
pub const EVENT_ABNORMAL: &str = "abnormal_temperature";
const CATEGORY_COLD_BOOT: &str = "cold_boot";
const CATEGORY_ANOMALY: &str = "thermal_anomaly";

const MIN_BASELINE_SAMPLES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalFindingKind {
    ColdBoot,
    Freezing,
    Abnormal,
}

impl ThermalFindingKind {
    pub fn severity(&self) -> Severity {
        match self {
            Self::ColdBoot | Self::Freezing => Severity::Critical,
            Self::Abnormal => Severity::Medium,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ColdBoot => EVENT_COLD_BOOT,
            Self::Freezing => EVENT_FREEZING,
            Self::Abnormal => EVENT_ABNORMAL,
        }
    }

    /// Whether the response includes an emergency memory wipe.
    pub fn wipes(&self) -> bool {
        self.severity() == Severity::Critical
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThermalFinding {
    pub kind: ThermalFindingKind,
    pub temperature_c: f64,
    pub baseline_c: f64,
    pub deviation_c: f64,
    /// `None` until the window holds enough samples for a fit.
    pub cooling_rate_c_per_min: Option<f64>,
    /// Most recent window samples, attached to cold-boot findings only.
    pub forensic_window: Vec<(DateTime<Utc>, f64)>,
}

/// Per-device detection state: sliding window plus incident latch.
pub struct ThermalAnalyzer {
    config: ThermalConfig,
    baseline: Arc<ThermalBaseline>,
    window: ObservationWindow<(DateTime<Utc>, f64)>,
    incident: Option<Severity>,
}

impl ThermalAnalyzer {
    pub fn new(config: ThermalConfig, baseline: Arc<ThermalBaseline>) -> Self {
        let window = ObservationWindow::new(config.window);
        Self {
            config,
            baseline,
            window,
            incident: None,
        }
    }

    pub fn baseline(&self) -> &Arc<ThermalBaseline> {
        &self.baseline
    }

    pub fn set_baseline(&mut self, baseline: Arc<ThermalBaseline>) {
        self.baseline = baseline;
    }

    /// Severity of the incident the device is latched in, if any.
    pub fn incident(&self) -> Option<Severity> {
        self.incident
    }

    /// Cooling rate in °C/min over the current window.
    pub fn cooling_rate(&self) -> Option<f64> {
        if self.window.len() < self.config.min_fit_samples {
            return None;
        }
        let origin = self.window.iter().next().map(|(t, _)| *t)?;
        let (xs, ys): (Vec<f64>, Vec<f64>) = self
            .window
            .iter()
            .map(|(t, v)| ((*t - origin).num_milliseconds() as f64 / 1000.0, *v))
            .unzip();
        Some(thermoguard_stats::linear_slope(&xs, &ys) * 60.0)
    }

    /// Add one sample and return the finding to respond to, if any.
    pub fn observe(&mut self, temperature_c: f64, at: DateTime<Utc>) -> Option<ThermalFinding> {
        self.window.push((at, temperature_c));
        let rate = self.cooling_rate();
        let deviation = temperature_c - self.baseline.mean_temperature_c;

        let kind = if rate.is_some_and(|r| r < self.config.rapid_cooling_c_per_min) {
            Some(ThermalFindingKind::ColdBoot)
        } else if temperature_c <= self.config.freezing_c {
            Some(ThermalFindingKind::Freezing)
        } else if deviation.abs() > self.config.deviation_threshold_c {
            Some(ThermalFindingKind::Abnormal)
        } else {
            None
        };

        let Some(kind) = kind else {
            if self.incident.take().is_some() {
                log::info!(
                    "[{}] temperature back to {temperature_c:.1} °C, incident cleared",
                    self.baseline.device_id
                );
            }
            return None;
        };
        if self.incident.is_some_and(|latched| latched >= kind.severity()) {
            return None;
        }
        self.incident = Some(kind.severity());

        let forensic_window = if kind == ThermalFindingKind::ColdBoot {
            let skip = self.window.len().saturating_sub(self.config.forensic_samples);
            self.window.iter().skip(skip).copied().collect()
        } else {
            Vec::new()
        };
        Some(ThermalFinding {
            kind,
            temperature_c,
            baseline_c: self.baseline.mean_temperature_c,
            deviation_c: deviation,
            cooling_rate_c_per_min: rate,
            forensic_window,
        })
    }
}

/// Build a baseline from already collected temperatures.
pub fn build_baseline(device: &str, temperatures: &[f64]) -> Result<ThermalBaseline> {
    if temperatures.len() < MIN_BASELINE_SAMPLES {
        return Err(GuardError::InsufficientSamples {
            got: temperatures.len(),
            need: MIN_BASELINE_SAMPLES,
        });
    }
    Ok(ThermalBaseline {
        device_id: device.to_string(),
        mean_temperature_c: thermoguard_stats::mean(temperatures),
        std_temperature_c: thermoguard_stats::std_dev(temperatures),
        sample_count: temperatures.len(),
        established_at: Utc::now(),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThermalStatistics {
    pub baselines: usize,
    pub active_monitors: Vec<String>,
    pub samples_analyzed: u64,
    pub missed_samples: u64,
    pub cold_boot_detections: u64,
    pub freezing_detections: u64,
    pub abnormal_detections: u64,
    pub memory_wipes_requested: u64,
}

#[derive(Default)]
struct Counters {
    samples: AtomicU64,
    missed: AtomicU64,
    cold_boot: AtomicU64,
    freezing: AtomicU64,
    abnormal: AtomicU64,
    wipes: AtomicU64,
}

pub struct ThermalMonitor {
    config: ThermalConfig,
    services: Services,
    monitors: MonitorSet,
    counters: Counters,
}

impl ThermalMonitor {
    pub fn new(config: ThermalConfig, services: Services) -> Self {
        Self {
            config,
            services,
            monitors: MonitorSet::new("thermal"),
            counters: Counters::default(),
        }
    }

    async fn read(&self, device: &str) -> Result<Reading> {
        let dev = device.to_string();
        read_blocking(&self.services.sensor, self.services.sensor_timeout, move |s| {
            s.read_thermal(&dev)
        })
        .await
    }

    /// Average readings taken every `sample_interval` over `duration`.
    pub async fn establish_baseline(&self, device: &str, duration: Duration) -> Result<Arc<ThermalBaseline>> {
        validate_device(device)?;
        let interval = self.config.sample_interval.max(Duration::from_millis(1));
        let n = ((duration.as_secs_f64() / interval.as_secs_f64()).round() as usize).max(MIN_BASELINE_SAMPLES);

        let mut temperatures = Vec::with_capacity(n);
        for i in 0..n {
            match self.read(device).await {
                Ok(r) => temperatures.push(r.value),
                Err(e) if e.is_transient() => {
                    self.counters.missed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("[{device}] baseline temperature missed: {e}");
                }
                Err(e) => return Err(e),
            }
            if i + 1 < n {
                tokio::time::sleep(interval).await;
            }
        }
        self.install_baseline(device, &temperatures).await
    }

    pub async fn install_baseline(&self, device: &str, temperatures: &[f64]) -> Result<Arc<ThermalBaseline>> {
        validate_device(device)?;
        let baseline = build_baseline(device, temperatures)?;
        log::info!(
            "[{device}] thermal baseline {:.2} ± {:.2} °C over {} samples",
            baseline.mean_temperature_c,
            baseline.std_temperature_c,
            baseline.sample_count
        );
        match self.services.baselines.put_thermal(baseline).await {
            Ok(b) => Ok(b),
            Err(e) => {
                log::warn!("[{device}] thermal baseline not persisted: {e}");
                self.services.baselines.require_thermal(device)
            }
        }
    }

    pub fn analyzer(&self, device: &str) -> Result<ThermalAnalyzer> {
        validate_device(device)?;
        let baseline = self.services.baselines.require_thermal(device)?;
        Ok(ThermalAnalyzer::new(self.config.clone(), baseline))
    }

    /// Run one reading through `analyzer` and respond to its finding.
    /// Returns the registered event id, if any.
    pub async fn process_reading(
        &self,
        analyzer: &mut ThermalAnalyzer,
        device: &str,
        temperature_c: f64,
        at: DateTime<Utc>,
    ) -> Result<Option<String>> {
        self.counters.samples.fetch_add(1, Ordering::Relaxed);
        match analyzer.observe(temperature_c, at) {
            Some(finding) => self.respond(device, finding).await.map(Some),
            None => Ok(None),
        }
    }

    async fn respond(&self, device: &str, finding: ThermalFinding) -> Result<String> {
        let kind = finding.kind;
        let confidence = match kind {
            ThermalFindingKind::ColdBoot => finding
                .cooling_rate_c_per_min
                .map(|r| (r / self.config.rapid_cooling_c_per_min / 2.0).clamp(0.5, 1.0))
                .unwrap_or(0.5),
            ThermalFindingKind::Freezing => 1.0,
            ThermalFindingKind::Abnormal => {
                (finding.deviation_c.abs() / (2.0 * self.config.deviation_threshold_c)).clamp(0.5, 1.0)
            }
        };
        let counter = match kind {
            ThermalFindingKind::ColdBoot => &self.counters.cold_boot,
            ThermalFindingKind::Freezing => &self.counters.freezing,
            ThermalFindingKind::Abnormal => &self.counters.abnormal,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if kind == ThermalFindingKind::Abnormal {
            log::warn!(
                "[{device}] abnormal temperature {:.1} °C ({:+.1} °C from baseline)",
                finding.temperature_c,
                finding.deviation_c
            );
        }

        let event_id = self
            .services
            .registry
            .register_security_event(NewSecurityEvent {
                event_type: kind.event_type().into(),
                source: EventSource::Thermal,
                device_id: device.to_string(),
                severity: kind.severity(),
                confidence,
                data: json!({
                    "temperature_c": finding.temperature_c,
                    "baseline_c": finding.baseline_c,
                    "deviation_c": finding.deviation_c,
                    "cooling_rate_c_per_min": finding.cooling_rate_c_per_min,
                }),
                threat_category: match kind {
                    ThermalFindingKind::Abnormal => CATEGORY_ANOMALY,
                    _ => CATEGORY_COLD_BOOT,
                }
                .into(),
            })
            .await?;

        if !finding.forensic_window.is_empty() {
            let samples: Vec<_> = finding
                .forensic_window
                .iter()
                .map(|(t, v)| json!({ "timestamp": t, "temperature_c": v }))
                .collect();
            if let Err(e) = self
                .services
                .registry
                .store_forensic_evidence(&event_id, "thermal_window", json!({ "samples": samples }))
                .await
            {
                log::error!("[{device}] forensic window for event {event_id} not stored: {e}");
            }
        }

        if kind.wipes() {
            self.counters.wipes.fetch_add(1, Ordering::Relaxed);
            let dev = device.to_string();
            self.services
                .mitigate(device, &event_id, actions::EMERGENCY_MEMORY_WIPE, move |a| {
                    a.wipe_sensitive_memory(&dev)
                })
                .await;
        }
        Ok(event_id)
    }

    /// Start sampling `device` every `sample_interval`.
    pub fn start_monitoring(self: &Arc<Self>, device: &str) -> Result<()> {
        let analyzer = self.analyzer(device)?;
        let this = Arc::clone(self);
        let dev = device.to_string();
        self.monitors
            .start(device.to_string(), move |cancel| this.run(dev, analyzer, cancel))
    }

    pub async fn stop_monitoring(&self, device: &str) -> Option<MonitorReport> {
        self.monitors.stop(device).await
    }

    pub fn active_monitors(&self) -> Vec<String> {
        self.monitors.active()
    }

    pub async fn stop_all(&self) -> Vec<MonitorReport> {
        self.monitors.stop_all().await
    }

    async fn run(self: Arc<Self>, device: String, mut analyzer: ThermalAnalyzer, cancel: CancelFlag) -> MonitorReport {
        let mut report = MonitorReport {
            key: device.clone(),
            ..Default::default()
        };
        while !cancel.is_cancelled() {
            report.cycles += 1;
            if let Some(current) = self.services.baselines.thermal(&device) {
                if !Arc::ptr_eq(&current, analyzer.baseline()) {
                    log::info!("[{device}] thermal monitor picked up re-established baseline");
                    analyzer.set_baseline(current);
                }
            }

            match self.read(&device).await {
                Ok(reading) => {
                    log::debug!("[{device}] {:.2} °C", reading.value);
                    match self
                        .process_reading(&mut analyzer, &device, reading.value, reading.timestamp)
                        .await
                    {
                        Ok(Some(_)) => report.events += 1,
                        Ok(None) => {}
                        Err(e) => log::warn!("[{device}] thermal finding not registered: {e}"),
                    }
                }
                Err(e) => {
                    report.missed_samples += 1;
                    self.counters.missed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("[{device}] temperature sample missed: {e}");
                }
            }
            tokio::time::sleep(self.config.sample_interval).await;
        }
        report
    }

    pub fn statistics(&self) -> ThermalStatistics {
        ThermalStatistics {
            baselines: self.services.baselines.thermal_count(),
            active_monitors: self.active_monitors(),
            samples_analyzed: self.counters.samples.load(Ordering::Relaxed),
            missed_samples: self.counters.missed.load(Ordering::Relaxed),
            cold_boot_detections: self.counters.cold_boot.load(Ordering::Relaxed),
            freezing_detections: self.counters.freezing.load(Ordering::Relaxed),
            abnormal_detections: self.counters.abnormal.load(Ordering::Relaxed),
            memory_wipes_requested: self.counters.wipes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::LoggingActuator;
    use crate::sensor::SimulatedSensor;
    use crate::services::{test_services, test_services_with};

    fn baseline(mean: f64) -> Arc<ThermalBaseline> {
        Arc::new(build_baseline("d", &[mean - 0.5, mean + 0.5]).unwrap())
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_steady_temperature_is_quiet() {
        let mut a = ThermalAnalyzer::new(ThermalConfig::default(), baseline(40.0));
        for s in 0..120 {
            let t = 40.0 + 0.2 * ((s % 7) as f64 - 3.0) / 3.0;
            assert!(a.observe(t, at(s)).is_none());
        }
        assert!(a.cooling_rate().unwrap().abs() < 1.0);
    }

    #[test]
    fn test_rapid_cooling_latches_once() {
        let mut a = ThermalAnalyzer::new(ThermalConfig::default(), baseline(25.0));
        let findings: Vec<ThermalFinding> = (0..=30)
            .filter_map(|s| a.observe(25.0 - s as f64, at(s)))
            .collect();
        assert_eq!(findings.len(), 1);
        let f = &findings[0];
        assert_eq!(f.kind, ThermalFindingKind::ColdBoot);
        assert!((f.cooling_rate_c_per_min.unwrap() + 60.0).abs() < 1e-6);
        assert_eq!(f.forensic_window.len(), 10);
        assert_eq!(a.incident(), Some(Severity::Critical));
    }

    #[test]
    fn test_slow_cooldown_to_freezing_is_not_cold_boot() {
        let config = ThermalConfig {
            deviation_threshold_c: 50.0,
            ..Default::default()
        };
        let mut a = ThermalAnalyzer::new(config, baseline(5.0));
        // 6 °C over ten minutes.
        let findings: Vec<ThermalFinding> = (0..=60)
            .filter_map(|i| a.observe(5.0 - 0.1 * i as f64, at(i * 10)))
            .collect();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, ThermalFindingKind::Freezing);
    }

    #[test]
    fn test_abnormal_then_escalation() {
        let mut a = ThermalAnalyzer::new(ThermalConfig::default(), baseline(40.0));
        let first = a.observe(55.0, at(0)).unwrap();
        assert_eq!(first.kind, ThermalFindingKind::Abnormal);
        assert!(a.observe(55.0, at(1)).is_none());
        let escalated = a.observe(-1.0, at(2)).unwrap();
        assert_eq!(escalated.kind, ThermalFindingKind::Freezing);
    }

    #[test]
    fn test_latch_clears_on_recovery() {
        let mut a = ThermalAnalyzer::new(ThermalConfig::default(), baseline(40.0));
        assert!(a.observe(55.0, at(0)).is_some());
        assert!(a.observe(40.0, at(1)).is_none());
        assert_eq!(a.incident(), None);
        assert!(a.observe(55.0, at(2)).is_some());
    }

    #[tokio::test]
    async fn test_cold_boot_response_wipes_once() {
        let actuator = Arc::new(LoggingActuator::new());
        let services = test_services_with(Arc::new(SimulatedSensor::new(1)), actuator.clone());
        let registry = Arc::clone(&services.registry);
        let monitor = ThermalMonitor::new(ThermalConfig::default(), services);
        monitor.install_baseline("d", &[24.8, 25.2]).await.unwrap();
        let mut analyzer = monitor.analyzer("d").unwrap();

        let mut ids = Vec::new();
        for s in 0..=30 {
            if let Some(id) = monitor
                .process_reading(&mut analyzer, "d", 25.0 - s as f64, at(s))
                .await
                .unwrap()
            {
                ids.push(id);
            }
        }
        assert_eq!(ids.len(), 1);
        let event = registry.event(&ids[0]).unwrap();
        assert_eq!(event.event_type, EVENT_COLD_BOOT);
        assert_eq!(event.severity, Severity::Critical);
        assert_eq!(actuator.wipe_count("d"), 1);
        assert_eq!(registry.evidence_for_event(&ids[0]).len(), 1);
        let mitigations = registry.mitigations_for_event(&ids[0]);
        assert_eq!(mitigations.len(), 1);
        assert_eq!(mitigations[0].action_type, actions::EMERGENCY_MEMORY_WIPE);
        assert_eq!(monitor.statistics().memory_wipes_requested, 1);
    }

    #[tokio::test]
    async fn test_monitor_requires_baseline() {
        let monitor = Arc::new(ThermalMonitor::new(
            ThermalConfig::default(),
            test_services(Arc::new(SimulatedSensor::new(1))),
        ));
        assert!(matches!(
            monitor.start_monitoring("d"),
            Err(GuardError::NotBaselined { .. })
        ));
    }

    #[tokio::test]
    async fn test_establish_baseline_from_sensor() {
        let config = ThermalConfig {
            sample_interval: Duration::from_millis(1),
            ..Default::default()
        };
        let monitor = ThermalMonitor::new(config, test_services(Arc::new(SimulatedSensor::new(1))));
        let b = monitor.establish_baseline("d", Duration::from_millis(20)).await.unwrap();
        assert!(b.sample_count >= 2);
        assert!((38.0..48.5).contains(&b.mean_temperature_c), "{}", b.mean_temperature_c);
    }
}

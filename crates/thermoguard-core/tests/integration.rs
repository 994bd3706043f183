//! Integration tests for thermoguard-core.
//!
//! These run the detection paths end to end through a `SecurityEngine`:
//! detector → registry → store / bus / actuator / federation.

use std::f64::consts::TAU;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;

use thermoguard_core::leakage::{self, LeakageSeverity};
use thermoguard_core::model::actions;
use thermoguard_core::power::{EVENT_DPA, EVENT_SPA};
use thermoguard_core::thermal::EVENT_COLD_BOOT;
use thermoguard_core::{
    ActuatorRequest, Collaborators, EngineConfig, EventSource, GuardError, HealthStatus, JsonFileStore,
    LeakageConfig, LoggingActuator, LoggingFederation, MemoryStore, NewSecurityEvent, NewThreatSignature,
    PowerConfig, SecurityEngine, SecurityStore, Severity, SimulatedSensor, ThermalConfig,
};

fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

/// Traces whose means scatter as N(mean, std) with small per-sample noise.
fn legitimate_traces(rng: &mut StdRng, n: usize, mean: f64, std: f64) -> Vec<Vec<f64>> {
    (0..n)
        .map(|_| {
            let level = mean + std * gaussian(rng);
            (0..128).map(|_| level + gaussian(rng)).collect()
        })
        .collect()
}

struct Harness {
    engine: SecurityEngine,
    sensor: Arc<SimulatedSensor>,
    actuator: Arc<LoggingActuator>,
    federation: Arc<LoggingFederation>,
}

fn harness(config: EngineConfig, seed: u64) -> Harness {
    harness_with_sensor(config, seed, SimulatedSensor::new(seed))
}

fn harness_with_sensor(config: EngineConfig, seed: u64, sensor: SimulatedSensor) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let sensor = Arc::new(sensor);
    let actuator = Arc::new(LoggingActuator::new());
    let federation = Arc::new(LoggingFederation::new());
    let collaborators = Collaborators::simulated(seed)
        .with_sensor(sensor.clone())
        .with_actuator(actuator.clone())
        .with_federation(federation.clone());
    Harness {
        engine: SecurityEngine::new(config, collaborators).unwrap(),
        sensor,
        actuator,
        federation,
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_750_000_000 + secs, 0).unwrap()
}

// ---------------------------------------------------------------------------
// Detection scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn spa_offset_trace_registers_high_event() {
    let h = harness(EngineConfig::default(), 1);
    let mut rng = StdRng::seed_from_u64(11);
    let power = h.engine.power();
    let baseline = power
        .install_baseline("hsm-01", "rsa", &legitimate_traces(&mut rng, 1000, 100.0, 5.0))
        .await
        .unwrap();
    assert!((baseline.mean_power - 100.0).abs() < 1.0);
    assert!((baseline.std_power - 5.0).abs() < 0.5);

    let mut analyzer = power.analyzer("hsm-01", "rsa").unwrap();
    let trace: Vec<f64> = (0..128).map(|_| 140.0 + gaussian(&mut rng)).collect();
    let ids = power.process_trace(&mut analyzer, "hsm-01", "rsa", trace).await.unwrap();

    assert_eq!(ids.len(), 1);
    let event = h.engine.registry().event(&ids[0]).unwrap();
    assert_eq!(event.event_type, EVENT_SPA);
    assert_eq!(event.severity, Severity::High);
    assert_eq!(event.source, EventSource::PowerAnalysis);
    assert!(event.thermodynamic_data["z_score"].as_f64().unwrap() > 6.0);

    let mitigations = h.engine.registry().mitigations_for_event(&ids[0]);
    assert_eq!(mitigations.len(), 1);
    assert_eq!(mitigations[0].action_type, actions::POWER_NOISE_INJECTION);
    assert_eq!(mitigations[0].result, "success");
}

#[tokio::test]
async fn dpa_correlated_window_is_critical_and_random_window_is_not() {
    let h = harness(EngineConfig::default(), 2);
    let mut rng = StdRng::seed_from_u64(12);
    let power = h.engine.power();
    power
        .install_baseline("hsm-01", "aes", &legitimate_traces(&mut rng, 300, 100.0, 5.0))
        .await
        .unwrap();

    // Near-identical traces: pairwise correlation ≈ 0.95.
    let pattern: Vec<f64> = (0..128).map(|i| 5.0 * (TAU * i as f64 / 16.0).sin()).collect();
    let mut analyzer = power.analyzer("hsm-01", "aes").unwrap();
    let mut dpa_events = Vec::new();
    for _ in 0..100 {
        let trace = pattern.iter().map(|p| 100.0 + p + 0.8 * gaussian(&mut rng)).collect();
        for id in power.process_trace(&mut analyzer, "hsm-01", "aes", trace).await.unwrap() {
            let event = h.engine.registry().event(&id).unwrap();
            if event.event_type == EVENT_DPA {
                dpa_events.push(event);
            }
        }
    }
    assert_eq!(dpa_events.len(), 1);
    assert_eq!(dpa_events[0].severity, Severity::Critical);
    assert!(dpa_events[0].thermodynamic_data["mean_correlation"].as_f64().unwrap() > 0.9);

    let amplified = h.actuator.requests().into_iter().any(|r| {
        matches!(r, ActuatorRequest::PowerNoise { ref profile, .. } if profile.attack == "dpa" && profile.amplitude_mw == 15.0)
    });
    assert!(amplified);

    // Independent traces: correlation ≈ 0.
    let mut analyzer = power.analyzer("hsm-01", "aes").unwrap();
    for trace in legitimate_traces(&mut rng, 100, 100.0, 1.0) {
        for id in power.process_trace(&mut analyzer, "hsm-01", "aes", trace).await.unwrap() {
            assert_ne!(h.engine.registry().event(&id).unwrap().event_type, EVENT_DPA);
        }
    }
    assert_eq!(power.statistics().dpa_detections, 1);
}

#[tokio::test]
async fn cold_boot_window_wipes_exactly_once() {
    let h = harness(EngineConfig::default(), 3);
    let thermal = h.engine.thermal();
    thermal.install_baseline("hsm-01", &[24.9, 25.0, 25.1]).await.unwrap();
    let mut analyzer = thermal.analyzer("hsm-01").unwrap();

    // 25 °C to -5 °C over 30 s.
    let mut ids = Vec::new();
    for s in 0..=30 {
        if let Some(id) = thermal
            .process_reading(&mut analyzer, "hsm-01", 25.0 - s as f64, at(s))
            .await
            .unwrap()
        {
            ids.push(id);
        }
    }

    let registry = h.engine.registry();
    let critical: Vec<_> = ids
        .iter()
        .filter_map(|id| registry.event(id))
        .filter(|e| e.severity == Severity::Critical)
        .collect();
    assert!(!critical.is_empty());
    assert_eq!(critical[0].event_type, EVENT_COLD_BOOT);

    let wipes: Vec<_> = registry
        .mitigations()
        .into_iter()
        .filter(|m| m.action_type == actions::EMERGENCY_MEMORY_WIPE)
        .collect();
    assert_eq!(wipes.len(), 1);
    assert_eq!(h.actuator.wipe_count("hsm-01"), 1);

    let evidence = registry.evidence_for_event(&critical[0].event_id);
    assert_eq!(evidence.len(), 1);
    assert_eq!(registry.verify_evidence(&evidence[0].evidence_id), Some(true));
}

#[test]
fn leakage_classification_follows_histogram_shape() {
    let config = LeakageConfig::default();
    let uniform: Vec<f64> = (0..2048).map(|i| i as f64 / 8.0).collect();
    let e = leakage::estimate(&uniform, config.histogram_bins, 256.0);
    assert!(LeakageSeverity::classify(e.leakage_bits, &config) <= LeakageSeverity::Low, "{e:?}");

    let mut constant = vec![3.3; 1999];
    constant.push(3.3001);
    let e = leakage::estimate(&constant, config.histogram_bins, 256.0);
    assert_eq!(LeakageSeverity::classify(e.leakage_bits, &config), LeakageSeverity::Critical);
}

// ---------------------------------------------------------------------------
// PUF
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clone_separation_and_authentication() {
    let h = harness(EngineConfig::default(), 4);
    let puf = h.engine.puf();
    let original = puf.enroll("hsm-01", 1000).await.unwrap();
    puf.enroll("hsm-02", 1000).await.unwrap();
    h.sensor.clone_device("counterfeit", "hsm-01");
    puf.enroll("counterfeit", 1000).await.unwrap();

    assert!(original.reproducibility_score > 0.6, "{}", original.reproducibility_score);

    let distinct = puf.detect_clone("hsm-01", "hsm-02").await.unwrap();
    let cloned = puf.detect_clone("hsm-01", "counterfeit").await.unwrap();
    assert!(!distinct.is_clone, "{distinct:?}");
    assert!(cloned.is_clone, "{cloned:?}");
    assert!(cloned.similarity > distinct.similarity);

    let alerts = h.engine.registry().events_for_device("counterfeit");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, Severity::Critical);

    let auth = puf.authenticate("hsm-01", true).await.unwrap();
    assert!(auth.authenticated, "{auth:?}");
    assert!(matches!(
        puf.authenticate("never-enrolled", false).await,
        Err(GuardError::NotEnrolled(_))
    ));
}

#[tokio::test]
async fn clone_separation_holds_across_seeds() {
    let threshold = EngineConfig::default().puf.clone_threshold;
    for seed in 0..12 {
        let h = harness(EngineConfig::default(), seed);
        let puf = h.engine.puf();
        puf.enroll("hsm-01", 1000).await.unwrap();
        puf.enroll("hsm-02", 1000).await.unwrap();
        h.sensor.clone_device("counterfeit", "hsm-01");
        puf.enroll("counterfeit", 1000).await.unwrap();

        let distinct = puf.detect_clone("hsm-01", "hsm-02").await.unwrap();
        let cloned = puf.detect_clone("hsm-01", "counterfeit").await.unwrap();
        assert!(distinct.similarity < threshold, "seed {seed}: {distinct:?}");
        assert!(cloned.similarity > threshold, "seed {seed}: {cloned:?}");
    }
}

#[tokio::test]
async fn quieter_devices_reproduce_better() {
    for seed in 0..12 {
        let quiet = harness_with_sensor(EngineConfig::default(), seed, SimulatedSensor::new(seed).with_noise_scale(0.25));
        let loud = harness_with_sensor(EngineConfig::default(), seed, SimulatedSensor::new(seed).with_noise_scale(4.0));
        let low_noise = quiet.engine.puf().enroll("hsm-01", 1000).await.unwrap();
        let high_noise = loud.engine.puf().enroll("hsm-01", 1000).await.unwrap();
        assert!(
            low_noise.reproducibility_score > high_noise.reproducibility_score,
            "seed {seed}: {} <= {}",
            low_noise.reproducibility_score,
            high_noise.reproducibility_score
        );
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

fn spa_event(device: &str, z: f64, severity: Severity) -> NewSecurityEvent {
    NewSecurityEvent {
        event_type: EVENT_SPA.into(),
        source: EventSource::PowerAnalysis,
        device_id: device.into(),
        severity,
        confidence: 0.9,
        data: json!({ "z_score": z, "mean_power_mw": 140.0 }),
        threat_category: "side_channel".into(),
    }
}

#[tokio::test]
async fn signature_match_is_inclusive_at_threshold() {
    let h = harness(EngineConfig::default(), 5);
    let registry = h.engine.registry();
    // z_score deviation 0.12 of 0.30 tolerance averaged over two features: similarity 0.8.
    let signature = registry
        .register_threat_signature(NewThreatSignature {
            threat_type: EVENT_SPA.into(),
            thermodynamic_fingerprint: json!({ "z_score": 10.0, "mean_power_mw": 140.0 }),
            severity: Severity::High,
            mitigation_strategy: actions::POWER_NOISE_INJECTION.into(),
        })
        .await
        .unwrap();

    let at_threshold = registry.register_security_event(spa_event("d1", 8.8, Severity::High)).await.unwrap();
    let below = registry.register_security_event(spa_event("d1", 8.7, Severity::High)).await.unwrap();
    assert_eq!(
        registry.event(&at_threshold).unwrap().matched_signature_id,
        Some(signature.signature_id)
    );
    assert_eq!(registry.event(&below).unwrap().matched_signature_id, None);
}

#[tokio::test]
async fn critical_events_reach_bus_and_federation() {
    let h = harness(EngineConfig::default(), 6);
    let mut rx = h.engine.subscribe();
    let id = h
        .engine
        .registry()
        .register_security_event(spa_event("d1", 12.0, Severity::Critical))
        .await
        .unwrap();

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(first.topic, "security.power_analysis.spa_attack_detected");
    assert_eq!(second.topic, "security.event.registered");
    assert_eq!(second.event.event_id, id);

    for _ in 0..50 {
        if !h.federation.broadcasts().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let broadcasts = h.federation.broadcasts();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0].severity, Severity::Critical);
}

#[tokio::test]
async fn health_and_false_positives() {
    let h = harness(EngineConfig::default(), 7);
    let registry = h.engine.registry();
    let id = registry.register_security_event(spa_event("d1", 9.0, Severity::Critical)).await.unwrap();
    assert_eq!(registry.get_device_security_health("d1").status, HealthStatus::Compromised);
    assert_eq!(registry.get_active_threats(None).len(), 1);

    registry.mark_false_positive(&id).await.unwrap();
    assert!(registry.get_active_threats(None).is_empty());
    assert!(registry.correlate_threats(&json!({ "z_score": 9.0 }), 60, 0.5).is_empty());
    assert_eq!(registry.get_device_security_health("d1").status, HealthStatus::Healthy);
    assert_eq!(registry.get_device_security_health("unknown").health_score, 100.0);
}

#[tokio::test]
async fn correlation_finds_coordinated_devices() {
    let h = harness(EngineConfig::default(), 8);
    let registry = h.engine.registry();
    for device in ["d1", "d2", "d3"] {
        registry.register_security_event(spa_event(device, 9.0, Severity::High)).await.unwrap();
    }
    registry.register_security_event(spa_event("d4", 30.0, Severity::High)).await.unwrap();

    let related = registry.correlate_threats(&json!({ "z_score": 9.1, "mean_power_mw": 140.0 }), 5, 0.8);
    let devices: Vec<&str> = related.iter().map(|e| e.device_id.as_str()).collect();
    assert_eq!(devices, ["d1", "d2", "d3"]);
}

// ---------------------------------------------------------------------------
// Resilience
// ---------------------------------------------------------------------------

#[tokio::test]
async fn store_outage_keeps_events_in_memory() {
    let store = Arc::new(MemoryStore::new());
    let mut config = EngineConfig::default();
    config.registry.store_retry_backoff = Duration::from_millis(1);
    let engine = SecurityEngine::new(config, Collaborators::simulated(9).with_store(store.clone())).unwrap();

    store.set_unavailable(true);
    let id = engine
        .registry()
        .register_security_event(spa_event("d1", 9.0, Severity::Critical))
        .await
        .unwrap();
    assert!(engine.registry().event(&id).is_some());
    assert!(engine.statistics().registry.store_write_failures >= 1);

    store.set_unavailable(false);
    assert!(store.load_events().unwrap().is_empty());
}

#[tokio::test]
async fn file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let sensor = Arc::new(SimulatedSensor::new(10));
    {
        let store: Arc<dyn SecurityStore> = Arc::new(JsonFileStore::open(dir.path()).unwrap());
        let engine = SecurityEngine::new(
            EngineConfig::default(),
            Collaborators::simulated(10).with_sensor(sensor.clone()).with_store(store),
        )
        .unwrap();
        engine.puf().enroll("hsm-01", 200).await.unwrap();
        engine
            .registry()
            .register_security_event(spa_event("hsm-01", 9.0, Severity::High))
            .await
            .unwrap();
    }

    let store: Arc<dyn SecurityStore> = Arc::new(JsonFileStore::open(dir.path()).unwrap());
    let engine = SecurityEngine::new(
        EngineConfig::default(),
        Collaborators::simulated(10).with_sensor(sensor).with_store(store),
    )
    .unwrap();
    assert!(engine.baselines().signature("hsm-01").is_some());
    assert_eq!(engine.registry().events_for_device("hsm-01").len(), 1);
    assert!(engine.puf().authenticate("hsm-01", false).await.unwrap().authenticated);
}

// ---------------------------------------------------------------------------
// Live monitors
// ---------------------------------------------------------------------------

fn fast_config() -> EngineConfig {
    EngineConfig {
        power: PowerConfig {
            trace_length: 64,
            dpa_window: 20,
            dpa_min_traces: 20,
            cycle_interval: Duration::from_millis(2),
            ..Default::default()
        },
        thermal: ThermalConfig {
            sample_interval: Duration::from_millis(20),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn power_monitor_detects_synchronized_capture() {
    let h = harness(fast_config(), 11);
    let power = h.engine.power();
    power.establish_baseline("hsm-01", "aes", 60).await.unwrap();
    power.start_monitoring("hsm-01", "aes").unwrap();
    assert!(matches!(
        power.start_monitoring("hsm-01", "aes"),
        Err(GuardError::AlreadyMonitoring { .. })
    ));

    h.sensor.set_synchronized_capture("hsm-01", true);
    let registry = Arc::clone(h.engine.registry());
    let detected = wait_for(|| {
        registry
            .events_for_device("hsm-01")
            .iter()
            .any(|e| e.event_type == EVENT_DPA)
    })
    .await;
    assert!(detected);

    let report = power.stop_monitoring("hsm-01", "aes").await.unwrap();
    assert!(report.cycles >= 20);
    assert!(report.events >= 1);
    assert!(power.active_monitors().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn thermal_monitor_survives_outage_and_detects_cooling() {
    let h = harness(fast_config(), 12);
    let thermal = h.engine.thermal();
    thermal.install_baseline("hsm-01", &[40.0, 40.0]).await.unwrap();
    h.sensor.set_offline("hsm-01", thermoguard_core::Channel::Thermal, true);
    thermal.start_monitoring("hsm-01").unwrap();

    assert!(wait_for(|| thermal.statistics().missed_samples >= 3).await);
    assert_eq!(thermal.active_monitors(), ["hsm-01"]);

    h.sensor.set_offline("hsm-01", thermoguard_core::Channel::Thermal, false);
    h.sensor.inject_cooling("hsm-01", 3000.0);
    assert!(wait_for(|| h.actuator.wipe_count("hsm-01") >= 1).await);

    let reports = h.engine.shutdown().await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].missed_samples >= 3);
    assert_eq!(h.actuator.wipe_count("hsm-01"), 1);
}

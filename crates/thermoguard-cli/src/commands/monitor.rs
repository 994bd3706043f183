use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thermoguard_core::{EVENT_REGISTERED, GuardError, SecurityEngine, SimulatedSensor};
use tokio::sync::broadcast::error::RecvError;

use super::{Context, event_line, fail};

/// Delay before a simulated attack is staged, so the first cycles run clean.
const ATTACK_DELAY: Duration = Duration::from_secs(3);
/// Cooling rate of a simulated cold-boot attack, °C per minute.
const COLD_BOOT_RATE: f64 = 30.0;

pub struct MonitorCommandConfig<'a> {
    pub ctx: &'a Context,
    pub device: &'a str,
    pub operation: &'a str,
    pub duration: Option<u64>,
    pub simulate_attack: Option<&'a str>,
    pub json: bool,
}

pub fn run(cfg: MonitorCommandConfig<'_>) {
    let ctx = cfg.ctx;
    let engine = &ctx.engine;
    if cfg.simulate_attack.is_some() && ctx.simulator.is_none() {
        fail("staging attack", "--simulate-attack needs the simulated sensor");
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    }) {
        fail("setting Ctrl+C handler", e);
    }

    let max_duration = cfg.duration.map(Duration::from_secs);
    println!("Monitoring {}", cfg.device);
    println!("  Operation: {}", cfg.operation);
    match max_duration {
        Some(d) => println!("  Duration:  {}s", d.as_secs()),
        None => println!("  Duration:  until Ctrl+C"),
    }
    if let Some(attack) = cfg.simulate_attack {
        println!("  Attack:    {attack} (staged after {}s)", ATTACK_DELAY.as_secs());
    }
    println!();

    ctx.block_on(async {
        let mut rx = engine.subscribe();
        start_monitors(engine, cfg.device, cfg.operation);

        let start = Instant::now();
        let mut staged = cfg.simulate_attack.is_none();
        let mut tick = tokio::time::interval(Duration::from_millis(200));

        while running.load(Ordering::SeqCst) {
            if let Some(max) = max_duration
                && start.elapsed() >= max
            {
                break;
            }
            if !staged
                && start.elapsed() >= ATTACK_DELAY
                && let (Some(sim), Some(attack)) = (&ctx.simulator, cfg.simulate_attack)
            {
                stage_attack(engine, sim, cfg.device, cfg.operation, attack);
                staged = true;
            }

            tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(msg) if msg.topic == EVENT_REGISTERED => {
                        if cfg.json {
                            match serde_json::to_string(&msg.event) {
                                Ok(line) => println!("{line}"),
                                Err(e) => eprintln!("Error serializing event: {e}"),
                            }
                        } else {
                            println!("{}", event_line(&msg.event));
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => eprintln!("Warning: {n} events dropped by a slow subscriber"),
                    Err(RecvError::Closed) => break,
                },
                _ = tick.tick() => {}
            }
        }

        let reports = engine.shutdown().await;
        println!();
        println!("Stopped after {:.1}s", start.elapsed().as_secs_f64());
        for report in reports {
            print!(
                "  {:<28} {} cycles, {} missed, {} events",
                report.key, report.cycles, report.missed_samples, report.events
            );
            match report.error {
                Some(err) => println!(" (failed: {err})"),
                None => println!(),
            }
        }
    });

    if let Some(sim) = &ctx.simulator {
        sim.reset(cfg.device);
    }
}

fn start_monitors(engine: &SecurityEngine, device: &str, operation: &str) {
    let started = engine
        .power()
        .start_monitoring(device, operation)
        .and_then(|()| engine.thermal().start_monitoring(device));
    if let Err(e) = started {
        if matches!(e, GuardError::NotBaselined { .. }) {
            eprintln!("Run `thermoguard baseline {device}` first.");
        }
        fail("starting monitor", e);
    }
}

fn stage_attack(engine: &SecurityEngine, sim: &SimulatedSensor, device: &str, operation: &str, attack: &str) {
    match attack {
        "spa" => {
            let offset = engine
                .baselines()
                .power(device, operation)
                .map_or(50.0, |b| b.mean_power.abs() * 0.5);
            sim.inject_power_offset(device, offset);
            println!(">>> staging SPA: +{offset:.1} mW on every trace");
        }
        "dpa" => {
            sim.set_synchronized_capture(device, true);
            println!(">>> staging DPA: traces captured in lock-step with operations");
        }
        "cold-boot" => {
            sim.inject_cooling(device, COLD_BOOT_RATE);
            println!(">>> staging cold boot: cooling at {COLD_BOOT_RATE} °C/min");
        }
        other => log::warn!("unknown attack {other}"),
    }
}

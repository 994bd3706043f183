use std::time::Duration;

use super::{Context, fail};

pub fn run(ctx: &Context, device: &str, operation: &str, traces: usize, thermal_secs: u64) {
    println!("Baselining {device}");

    let power = ctx
        .block_on(ctx.engine.power().establish_baseline(device, operation, traces))
        .unwrap_or_else(|e| fail("collecting power baseline", e));
    println!(
        "  Power ({operation}): {} traces, mean {:.2} mW, std {:.3} mW",
        power.trace_count, power.mean_power, power.std_power
    );

    let thermal_config = &ctx.engine.config().thermal;
    let expected = thermal_secs.saturating_mul(1000) / thermal_config.sample_interval.as_millis().max(1) as u64;
    println!("  Thermal: sampling for {thermal_secs}s (~{expected} samples)...");
    let thermal = ctx
        .block_on(ctx.engine.thermal().establish_baseline(device, Duration::from_secs(thermal_secs)))
        .unwrap_or_else(|e| fail("collecting thermal baseline", e));
    println!(
        "  Thermal: {} samples, mean {:.2} °C, std {:.3} °C",
        thermal.sample_count, thermal.mean_temperature_c, thermal.std_temperature_c
    );
}

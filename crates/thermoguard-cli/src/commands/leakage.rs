use thermoguard_core::{Channel, LeakageResult};

use super::{Context, fail, print_json};

pub struct LeakageCommandConfig<'a> {
    pub ctx: &'a Context,
    pub device: &'a str,
    pub operation: &'a str,
    /// `None` sweeps every leakage channel.
    pub channel: Option<&'a str>,
    pub secret_bits: f64,
    pub json: bool,
}

pub fn run(cfg: LeakageCommandConfig<'_>) {
    let leakage = cfg.ctx.engine.leakage();
    let observations = cfg.ctx.engine.config().leakage.observations;

    if let Some(name) = cfg.channel {
        let channel: Channel = name.parse().unwrap_or_else(|e: String| fail("parsing --channel", e));
        if !cfg.json {
            println!("Measuring {channel} leakage of {} ({observations} observations)...", cfg.operation);
        }
        let result = cfg
            .ctx
            .block_on(leakage.measure_leakage(cfg.device, cfg.operation, channel, cfg.secret_bits))
            .unwrap_or_else(|e| fail("measuring leakage", e));
        if cfg.json {
            print_json(&result);
        } else {
            print_header();
            print_row(&result);
            print_verdict(result.remaining_security_bits, &result.severity.to_string(), result.attack_complexity);
        }
        return;
    }

    if !cfg.json {
        println!(
            "Sweeping {} channels of {} ({observations} observations each)...",
            Channel::LEAKAGE.len(),
            cfg.operation
        );
    }
    let sweep = cfg
        .ctx
        .block_on(leakage.measure_all_channels(cfg.device, cfg.operation, cfg.secret_bits))
        .unwrap_or_else(|e| fail("measuring leakage", e));
    if cfg.json {
        print_json(&sweep);
        return;
    }

    print_header();
    for result in &sweep.channels {
        print_row(result);
    }
    for skipped in &sweep.skipped {
        println!("  {:<16} skipped: {}", skipped.channel, skipped.reason);
    }
    println!();
    println!("  Total leakage: {:.2} bits", sweep.total_leakage_bits);
    if let Some(weakest) = sweep.weakest_channel {
        println!("  Weakest:       {weakest}");
    }
    print_verdict(
        sweep.min_remaining_security_bits,
        &sweep.severity.to_string(),
        sweep.attack_complexity,
    );
}

fn print_header() {
    println!();
    println!(
        "  {:<16} {:>10} {:>10} {:>11} {:>10}",
        "Channel", "H (bits)", "Leaked", "Remaining", "Severity"
    );
    println!("  {}", "-".repeat(61));
}

fn print_row(r: &LeakageResult) {
    println!(
        "  {:<16} {:>10.3} {:>10.2} {:>11.2} {:>10}",
        r.channel, r.estimate.observation_entropy_bits, r.estimate.leakage_bits, r.remaining_security_bits, r.severity
    );
    if r.missed_observations > 0 {
        println!("  {:<16} ({} observations missed)", "", r.missed_observations);
    }
}

fn print_verdict(remaining: f64, severity: &str, complexity: &str) {
    println!("  Remaining security: {remaining:.2} bits ({severity})");
    println!("  Attack complexity:  {complexity}");
}

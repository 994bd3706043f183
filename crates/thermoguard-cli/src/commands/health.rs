use super::{Context, print_json};

pub fn run(ctx: &Context, device: &str, json: bool) {
    let health = ctx.engine.registry().get_device_security_health(device);
    if json {
        print_json(&health);
        return;
    }

    println!("{device}");
    println!("  Health score:   {:.1} / 100", health.health_score);
    println!("  Status:         {:?}", health.status);
    println!("  Events:         {}", health.total_events);
    for (severity, count) in &health.events_by_severity {
        println!("    {severity:<10} {count}");
    }
    println!("  Active threats: {}", health.active_threats);
    println!("  False positives: {}", health.false_positives);
    if let Some(at) = health.last_event_at {
        println!("  Last event:     {}", at.to_rfc3339());
    }

    let signature = ctx.engine.baselines().signature(device);
    let power = ctx.engine.baselines().power_count();
    let thermal = ctx.engine.baselines().thermal(device).is_some();
    println!(
        "  Enrolled: {}   Thermal baseline: {}   Power baselines (all devices): {power}",
        if signature.is_some() { "yes" } else { "no" },
        if thermal { "yes" } else { "no" },
    );
}

use thermoguard_core::Severity;

use super::{Context, event_line, fail, print_json};

pub fn run(ctx: &Context, severity: Option<&str>, json: bool) {
    let severity = severity.map(|s| s.parse::<Severity>().unwrap_or_else(|e| fail("parsing --severity", e)));
    let threats = ctx.engine.registry().get_active_threats(severity);
    if json {
        print_json(&threats);
        return;
    }

    if threats.is_empty() {
        println!("No active threats.");
        return;
    }
    println!("{} active threats", threats.len());
    for event in &threats {
        println!("  {}  {}", event_line(event), event.event_id);
    }
}

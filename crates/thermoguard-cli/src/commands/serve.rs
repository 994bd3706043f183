use super::{Context, fail};

pub fn run(ctx: Context, host: &str, port: u16, monitored: &[String], operation: &str) {
    let base = format!("http://{host}:{port}");
    let stats = ctx.engine.statistics();

    println!("Thermoguard Server v{}", thermoguard_core::VERSION);
    println!("   {base}");
    println!("   sensor {}, store {}", stats.sensor, stats.store);
    println!("   {} enrolled devices, {} events on record", stats.puf.enrolled_devices, stats.registry.total_events);
    println!();
    println!("   Endpoints:");
    println!("     GET  /                            API index (try: curl {base})");
    println!("     GET  /health                      Liveness check");
    println!("     GET  /devices/{{id}}/health         Device security health");
    println!("     GET  /threats?severity=high       Active threats");
    println!("     GET  /statistics                  Engine statistics");
    println!("     GET  /signatures                  Threat signatures");
    println!("     POST /signatures                  Register a threat signature");
    println!("     POST /correlate                   Events similar to a pattern");
    println!("     POST /events/{{id}}/false-positive  Mark a false positive");
    println!();

    let engine = ctx.engine.clone();
    ctx.block_on(async move {
        for device in monitored {
            let started = engine
                .power()
                .start_monitoring(device, operation)
                .and_then(|()| engine.thermal().start_monitoring(device));
            if let Err(e) = started {
                fail(&format!("monitoring {device}"), e);
            }
            println!("   monitoring {device} ({operation})");
        }
        if let Err(e) = thermoguard_server::run_server(engine, host, port).await {
            fail("serving", e);
        }
    });
}

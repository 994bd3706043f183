use super::{Context, fail};

pub fn run(ctx: &Context, device_a: &str, device_b: &str, simulate_clone: bool) {
    if simulate_clone {
        let Some(sim) = &ctx.simulator else {
            fail("staging clone", "--simulate-clone needs the simulated sensor");
        };
        sim.clone_device(device_b, device_a);
        // The clone has to be enrolled from its (copied) physics.
        ctx.block_on(ctx.engine.puf().enroll(device_b, ctx.engine.config().puf.enrollment_samples))
            .unwrap_or_else(|e| fail("enrolling clone", e));
    }

    let check = ctx
        .block_on(ctx.engine.puf().detect_clone(device_a, device_b))
        .unwrap_or_else(|e| fail("comparing devices", e));

    println!("{device_a} vs {device_b}");
    println!("  Similarity: {:.3}", check.similarity);
    if check.is_clone {
        println!("  CLONE DETECTED");
        std::process::exit(2);
    }
    println!("  Distinct devices");
}

use super::{Context, fail};

pub fn run(ctx: &Context, device: &str, samples: Option<usize>) {
    let samples = samples.unwrap_or(ctx.engine.config().puf.enrollment_samples);
    println!("Enrolling {device} ({samples} samples per channel)...");

    let signature = ctx
        .block_on(ctx.engine.puf().enroll(device, samples))
        .unwrap_or_else(|e| fail("enrolling", e));

    println!("  Fingerprint:     {}", signature.fingerprint);
    println!("  Reproducibility: {:.3}", signature.reproducibility_score);
    println!("  Features:        {}", signature.thermodynamic_feature_vector.len());
    if signature.low_confidence {
        println!("  Warning: low reproducibility, authentication of this device is unreliable.");
    }
}

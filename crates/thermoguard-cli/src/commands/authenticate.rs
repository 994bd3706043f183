use super::{Context, fail};

pub fn run(ctx: &Context, device: &str, fresh: bool) {
    let result = ctx
        .block_on(ctx.engine.puf().authenticate(device, fresh))
        .unwrap_or_else(|e| fail("authenticating", e));

    let verdict = if result.authenticated { "AUTHENTICATED" } else { "REJECTED" };
    println!("{device}: {verdict}");
    println!("  Confidence:         {:.3}", result.confidence);
    println!("  Feature similarity: {:.3}", result.feature_similarity);
    println!("  Hamming similarity: {:.3}", result.hamming_similarity);
    if result.low_confidence {
        println!("  (enrolled signature is low-confidence)");
    }
    if !result.authenticated {
        std::process::exit(2);
    }
}

//! Feature vectors, fingerprints and the shared similarity function.
//!
//! PUF clone detection, PUF authentication, threat-signature matching and
//! cross-device correlation all compare measurements with [`similarity`], so
//! a threshold means the same thing wherever it is configured.
//!
//! Feature vectors mix quantities of very different scale (milliwatts,
//! degrees, dimensionless correlations), so the comparison is made per
//! feature on relative deviation rather than by correlating the raw vectors,
//! which would be dominated by the largest-magnitude features.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

/// Named scalar statistics, ordered by name. The ordering is the canonical
/// serialization order used for fingerprints.
pub type FeatureVector = BTreeMap<String, f64>;

// ---------------------------------------------------------------------------
// Fingerprints
// ---------------------------------------------------------------------------

/// SHA-256 over the canonical serialization of `features`.
///
/// Each entry contributes `len(name) || name || value.to_bits()` (big endian),
/// in key order. `-0.0` is folded into `0.0` and every NaN into one bit
/// pattern so that equal vectors always hash equally.
pub fn fingerprint(features: &FeatureVector) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(b"thermoguard-puf-v1");
    for (name, &value) in features {
        h.update((name.len() as u32).to_be_bytes());
        h.update(name.as_bytes());
        h.update(canonical_bits(value).to_be_bytes());
    }
    h.finalize().into()
}

/// Hex form of [`fingerprint`].
pub fn fingerprint_hex(features: &FeatureVector) -> String {
    hex::encode(fingerprint(features))
}

fn canonical_bits(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else if value == 0.0 {
        0.0f64.to_bits()
    } else {
        value.to_bits()
    }
}

/// `1 - normalized Hamming distance` between two hex fingerprints.
///
/// Unparseable or differently sized fingerprints are fully dissimilar.
pub fn hamming_similarity(a_hex: &str, b_hex: &str) -> f64 {
    let (Ok(a), Ok(b)) = (hex::decode(a_hex), hex::decode(b_hex)) else {
        return 0.0;
    };
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let differing: u32 = a.iter().zip(&b).map(|(x, y)| (x ^ y).count_ones()).sum();
    1.0 - differing as f64 / (a.len() * 8) as f64
}

// ---------------------------------------------------------------------------
// Similarity
// ---------------------------------------------------------------------------

/// Similarity in `[0, 1]` of `candidate` to `reference`.
///
/// For every feature of `reference` the relative deviation
/// `|a - b| / max(|a|, |b|)` (capped at 1; a feature missing from
/// `candidate` counts as 1) is averaged, and the mean deviation is mapped
/// linearly so that `0` deviation is similarity `1` and a mean deviation of
/// `tolerance` or more is similarity `0`.
pub fn similarity(reference: &FeatureVector, candidate: &FeatureVector, tolerance: f64) -> f64 {
    if reference.is_empty() || tolerance <= 0.0 {
        return 0.0;
    }
    let total: f64 = reference
        .iter()
        .map(|(name, &a)| match candidate.get(name) {
            Some(&b) => relative_deviation(a, b),
            None => 1.0,
        })
        .sum();
    let mean_deviation = total / reference.len() as f64;
    (1.0 - mean_deviation / tolerance).clamp(0.0, 1.0)
}

fn relative_deviation(a: f64, b: f64) -> f64 {
    if !a.is_finite() || !b.is_finite() {
        return 1.0;
    }
    let scale = a.abs().max(b.abs());
    if scale < 1e-12 {
        0.0
    } else {
        ((a - b).abs() / scale).min(1.0)
    }
}

// ---------------------------------------------------------------------------
// Free-form measurement payloads
// ---------------------------------------------------------------------------

/// Flatten the numeric leaves of a JSON payload into a feature vector.
///
/// Object keys are joined with `.`, array elements are addressed by index,
/// booleans become `0`/`1`; strings and nulls are ignored.
pub fn flatten_json(value: &serde_json::Value) -> FeatureVector {
    let mut out = FeatureVector::new();
    flatten_into(value, String::new(), &mut out);
    out
}

fn flatten_into(value: &serde_json::Value, path: String, out: &mut FeatureVector) {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                out.insert(path, f);
            }
        }
        serde_json::Value::Bool(b) => {
            out.insert(path, if *b { 1.0 } else { 0.0 });
        }
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                let child = if path.is_empty() { k.clone() } else { format!("{path}.{k}") };
                flatten_into(v, child, out);
            }
        }
        serde_json::Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                let child = if path.is_empty() { i.to_string() } else { format!("{path}.{i}") };
                flatten_into(v, child, out);
            }
        }
        serde_json::Value::String(_) | serde_json::Value::Null => {}
    }
}

/// [`similarity`] between a reference pattern and a measurement payload.
pub fn payload_similarity(pattern: &serde_json::Value, data: &serde_json::Value, tolerance: f64) -> f64 {
    similarity(&flatten_json(pattern), &flatten_json(data), tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vector(pairs: &[(&str, f64)]) -> FeatureVector {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_fingerprint_deterministic_and_order_independent() {
        let a = vector(&[("power.mean", 101.5), ("thermal.mean", 44.2)]);
        let mut b = FeatureVector::new();
        b.insert("thermal.mean".into(), 44.2);
        b.insert("power.mean".into(), 101.5);
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint_hex(&a), fingerprint_hex(&a.clone()));
        assert_eq!(fingerprint_hex(&a).len(), 64);
    }

    #[test]
    fn test_fingerprint_sensitive_to_values_and_names() {
        let a = vector(&[("x", 1.0)]);
        let b = vector(&[("x", 1.0000001)]);
        let c = vector(&[("y", 1.0)]);
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn test_fingerprint_folds_negative_zero() {
        assert_eq!(
            fingerprint(&vector(&[("x", 0.0)])),
            fingerprint(&vector(&[("x", -0.0)]))
        );
    }

    #[test]
    fn test_hamming_similarity() {
        let a = "00ff";
        assert_eq!(hamming_similarity(a, a), 1.0);
        assert_eq!(hamming_similarity("00ff", "ff00"), 0.0);
        assert_eq!(hamming_similarity("0f", "00"), 0.5);
        assert_eq!(hamming_similarity("zz", "00"), 0.0);
        assert_eq!(hamming_similarity("00", "0000"), 0.0);
    }

    #[test]
    fn test_similarity_identical_and_missing() {
        let a = vector(&[("a", 10.0), ("b", -0.5), ("c", 0.0)]);
        assert_eq!(similarity(&a, &a, 0.3), 1.0);
        assert_eq!(similarity(&a, &FeatureVector::new(), 0.3), 0.0);
        assert_eq!(similarity(&FeatureVector::new(), &a, 0.3), 0.0);
    }

    #[test]
    fn test_similarity_scales_with_deviation() {
        let a = vector(&[("a", 100.0), ("b", 50.0)]);
        let close = vector(&[("a", 103.0), ("b", 51.0)]);
        let far = vector(&[("a", 140.0), ("b", 20.0)]);
        let s_close = similarity(&a, &close, 0.3);
        let s_far = similarity(&a, &far, 0.3);
        assert!(s_close > 0.9, "{s_close}");
        assert_eq!(s_far, 0.0);
        // Mean deviation (0.03/1.03 + 0.01/0.51 ~ 0.0244) / 0.3
        assert!((s_close - (1.0 - ((3.0 / 103.0 + 1.0 / 51.0) / 2.0) / 0.3)).abs() < 1e-12);
    }

    #[test]
    fn test_flatten_json() {
        let v = json!({
            "z_score": 8.1,
            "spectrum": [1.0, 2.0],
            "nested": {"ok": true, "label": "ignored"},
            "missing": null
        });
        let f = flatten_json(&v);
        assert_eq!(f.get("z_score"), Some(&8.1));
        assert_eq!(f.get("spectrum.1"), Some(&2.0));
        assert_eq!(f.get("nested.ok"), Some(&1.0));
        assert_eq!(f.len(), 4);
    }

    #[test]
    fn test_payload_similarity_uses_pattern_keys() {
        let pattern = json!({"mean_power_mw": 140.0});
        let data = json!({"mean_power_mw": 140.0, "z_score": 8.0, "trace": [1, 2, 3]});
        assert_eq!(payload_similarity(&pattern, &data, 0.3), 1.0);
        assert!(payload_similarity(&data, &pattern, 0.3) < 1.0);
    }
}

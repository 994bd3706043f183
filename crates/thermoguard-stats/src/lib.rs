//! Signal statistics for thermodynamic side-channel analysis.
//!
//! Every detector in `thermoguard-core` reduces raw sensor series to a handful
//! of numbers before comparing them against a baseline. Those reductions all
//! live here so they can be tested in isolation:
//!
//! - moments and order statistics ([`mean`], [`std_dev`], [`percentile`], [`summarize`])
//! - serial structure ([`lag1_autocorrelation`], [`magnitude_spectrum`], [`dominant_frequency`])
//! - cross-trace structure ([`pearson`], [`mean_abs_offdiagonal_correlation`])
//! - trend ([`linear_slope`])
//! - information content ([`histogram`], [`equal_frequency_histogram`], [`shannon_entropy_bits`],
//!   [`miller_madow_entropy_bits`])
//!
//! All functions take `&[f64]` and are total: empty or degenerate input yields
//! `0.0` rather than `NaN`.

use rustfft::{FftPlanner, num_complex::Complex};
use statrs::distribution::{ContinuousCDF, Normal};
use statrs::statistics::{Data, Median, OrderStatistics};

// ---------------------------------------------------------------------------
// Moments
// ---------------------------------------------------------------------------

/// Arithmetic mean. `0.0` for empty input.
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Population variance.
pub fn variance(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return 0.0;
    }
    let m = mean(data);
    data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / data.len() as f64
}

/// Population standard deviation.
pub fn std_dev(data: &[f64]) -> f64 {
    variance(data).sqrt()
}

// ---------------------------------------------------------------------------
// Order statistics
// ---------------------------------------------------------------------------

fn finite(data: &[f64]) -> Vec<f64> {
    data.iter().copied().filter(|x| x.is_finite()).collect()
}

/// Median of the finite values in `data`.
pub fn median(data: &[f64]) -> f64 {
    let values = finite(data);
    if values.is_empty() {
        return 0.0;
    }
    Data::new(values).median()
}

/// `p`-th percentile (0..=100) of the finite values in `data`.
pub fn percentile(data: &[f64], p: usize) -> f64 {
    let values = finite(data);
    if values.is_empty() {
        return 0.0;
    }
    let mut d = Data::new(values);
    d.percentile(p.min(100))
}

// ---------------------------------------------------------------------------
// Serial structure
// ---------------------------------------------------------------------------

/// Lag-1 autocorrelation coefficient.
///
/// Returns `0.0` for fewer than three samples or a constant series.
pub fn lag1_autocorrelation(data: &[f64]) -> f64 {
    let n = data.len();
    if n < 3 {
        return 0.0;
    }
    let m = mean(data);
    let var = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / n as f64;
    if var < 1e-12 {
        return 0.0;
    }
    let cov = data
        .windows(2)
        .map(|w| (w[0] - m) * (w[1] - m))
        .sum::<f64>()
        / (n - 1) as f64;
    (cov / var).clamp(-1.0, 1.0)
}

/// Magnitude spectrum of the mean-removed series, bins `1..=bins`.
///
/// The DC bin is excluded since the mean is compared separately. Magnitudes
/// are normalized by the series length so traces of different length compare.
/// Missing bins (series shorter than `2 * bins`) are reported as `0.0`.
pub fn magnitude_spectrum(data: &[f64], bins: usize) -> Vec<f64> {
    let n = data.len();
    let mut out = vec![0.0; bins];
    if n < 2 || bins == 0 {
        return out;
    }
    let m = mean(data);
    let mut buffer: Vec<Complex<f64>> = data.iter().map(|&x| Complex::new(x - m, 0.0)).collect();
    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n);
    fft.process(&mut buffer);

    let usable = (n / 2).min(bins);
    for k in 0..usable {
        out[k] = buffer[k + 1].norm() / n as f64;
    }
    out
}

/// Normalized frequency (cycles per sample, 0.0–0.5) of the strongest
/// non-DC spectral component.
pub fn dominant_frequency(data: &[f64]) -> f64 {
    let n = data.len();
    if n < 4 {
        return 0.0;
    }
    let spectrum = magnitude_spectrum(data, n / 2);
    let (idx, power) = spectrum
        .iter()
        .copied()
        .enumerate()
        .fold((0usize, 0.0f64), |best, (i, p)| if p > best.1 { (i, p) } else { best });
    if power <= 0.0 {
        return 0.0;
    }
    (idx + 1) as f64 / n as f64
}

// ---------------------------------------------------------------------------
// Cross-trace structure
// ---------------------------------------------------------------------------

/// Pearson correlation coefficient over the common prefix of `a` and `b`.
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let mean_a = mean(a);
    let mean_b = mean(b);

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    let denom = (var_a * var_b).sqrt();
    if denom < 1e-12 { 0.0 } else { (cov / denom).clamp(-1.0, 1.0) }
}

/// Mean of `|r_ij|` over all pairs `i < j` of the pairwise correlation matrix.
///
/// Independent traces average near zero; traces captured in lock-step with a
/// repeated operation approach one.
pub fn mean_abs_offdiagonal_correlation<T: AsRef<[f64]>>(traces: &[T]) -> f64 {
    let n = traces.len();
    if n < 2 {
        return 0.0;
    }
    let mut sum = 0.0;
    let mut pairs = 0usize;
    for i in 0..n {
        for j in (i + 1)..n {
            sum += pearson(traces[i].as_ref(), traces[j].as_ref()).abs();
            pairs += 1;
        }
    }
    sum / pairs as f64
}

// ---------------------------------------------------------------------------
// Trend
// ---------------------------------------------------------------------------

/// Least-squares slope of `ys` against `xs` (units of y per unit of x).
pub fn linear_slope(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return 0.0;
    }
    let (xs, ys) = (&xs[..n], &ys[..n]);
    let mx = mean(xs);
    let my = mean(ys);
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for i in 0..n {
        let dx = xs[i] - mx;
        sxy += dx * (ys[i] - my);
        sxx += dx * dx;
    }
    if sxx < 1e-12 { 0.0 } else { sxy / sxx }
}

// ---------------------------------------------------------------------------
// Information content
// ---------------------------------------------------------------------------

/// Equal-width histogram over `[min, max]` of the finite values.
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub counts: Vec<u64>,
    pub min: f64,
    pub max: f64,
    pub total: u64,
}

impl Histogram {
    /// Number of bins that received at least one observation.
    pub fn occupied(&self) -> usize {
        self.counts.iter().filter(|&&c| c > 0).count()
    }
}

/// Discretize `data` into `bins` equal-width bins. A constant series lands
/// entirely in the first bin.
pub fn histogram(data: &[f64], bins: usize) -> Histogram {
    let bins = bins.max(1);
    let values = finite(data);
    let mut counts = vec![0u64; bins];
    if values.is_empty() {
        return Histogram { counts, min: 0.0, max: 0.0, total: 0 };
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let width = (max - min) / bins as f64;
    for &v in &values {
        let idx = if width <= 0.0 {
            0
        } else {
            (((v - min) / width) as usize).min(bins - 1)
        };
        counts[idx] += 1;
    }
    Histogram {
        counts,
        min,
        max,
        total: values.len() as u64,
    }
}

/// Discretize `data` by rank into `bins` bins of (nearly) equal occupancy.
///
/// Distinct values are spread evenly whatever the shape of their
/// distribution, so only repeated values can concentrate mass: every copy of
/// a value lands in the bin of its lowest rank.
pub fn equal_frequency_histogram(data: &[f64], bins: usize) -> Histogram {
    let bins = bins.max(1);
    let mut values = finite(data);
    let mut counts = vec![0u64; bins];
    if values.is_empty() {
        return Histogram { counts, min: 0.0, max: 0.0, total: 0 };
    }
    values.sort_by(f64::total_cmp);
    let n = values.len();
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && values[end] == values[start] {
            end += 1;
        }
        counts[start * bins / n] += (end - start) as u64;
        start = end;
    }
    Histogram {
        counts,
        min: values[0],
        max: values[n - 1],
        total: n as u64,
    }
}

/// Plug-in Shannon entropy of a count vector, in bits.
pub fn shannon_entropy_bits(counts: &[u64]) -> f64 {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let n = total as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / n;
            -p * p.log2()
        })
        .sum()
}

/// Shannon entropy with the Miller-Madow bias correction, in bits.
///
/// The plug-in estimator is biased low by roughly `(m - 1) / 2N` nats for
/// `m` occupied bins and `N` observations; this adds that term back.
pub fn miller_madow_entropy_bits(counts: &[u64]) -> f64 {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let occupied = counts.iter().filter(|&&c| c > 0).count();
    let correction = (occupied.saturating_sub(1)) as f64 / (2.0 * total as f64 * std::f64::consts::LN_2);
    shannon_entropy_bits(counts) + correction
}

/// Two-sided tail probability of a standard normal z-score.
pub fn normal_two_sided_p(z: f64) -> f64 {
    if !z.is_finite() {
        return 0.0;
    }
    match Normal::new(0.0, 1.0) {
        Ok(dist) => (2.0 * dist.sf(z.abs())).clamp(0.0, 1.0),
        Err(_) => 0.0,
    }
}

// ---------------------------------------------------------------------------
// Channel summary
// ---------------------------------------------------------------------------

/// The per-channel statistics a PUF feature vector is built from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub mean: f64,
    pub median: f64,
    pub std_dev: f64,
    pub p10: f64,
    pub p90: f64,
    pub lag1_autocorrelation: f64,
    pub dominant_frequency: f64,
}

impl Summary {
    /// `(name, value)` pairs in a fixed order.
    pub fn fields(&self) -> [(&'static str, f64); 7] {
        [
            ("mean", self.mean),
            ("median", self.median),
            ("std_dev", self.std_dev),
            ("p10", self.p10),
            ("p90", self.p90),
            ("lag1_autocorrelation", self.lag1_autocorrelation),
            ("dominant_frequency", self.dominant_frequency),
        ]
    }
}

/// Summarize a single channel's time series.
pub fn summarize(data: &[f64]) -> Summary {
    let values = finite(data);
    Summary {
        mean: mean(&values),
        median: median(&values),
        std_dev: std_dev(&values),
        p10: percentile(&values, 10),
        p90: percentile(&values, 90),
        lag1_autocorrelation: lag1_autocorrelation(&values),
        dominant_frequency: dominant_frequency(&values),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn noise_seeded(n: usize, seed: u64) -> Vec<f64> {
        let mut state: u64 = seed;
        (0..n)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 33) as f64 / (1u64 << 31) as f64) - 0.5
            })
            .collect()
    }

    fn sine(n: usize, period: f64, amplitude: f64) -> Vec<f64> {
        (0..n)
            .map(|i| amplitude * (2.0 * PI * i as f64 / period).sin())
            .collect()
    }

    #[test]
    fn test_moments() {
        let data = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((mean(&data) - 5.0).abs() < 1e-12);
        assert!((std_dev(&data) - 2.0).abs() < 1e-12);
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(variance(&[3.0]), 0.0);
    }

    #[test]
    fn test_order_statistics() {
        let data: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert!((median(&data) - 50.5).abs() < 1e-9);
        let p10 = percentile(&data, 10);
        let p90 = percentile(&data, 90);
        assert!(p10 > 9.0 && p10 < 12.0, "p10 = {p10}");
        assert!(p90 > 89.0 && p90 < 92.0, "p90 = {p90}");
        assert_eq!(median(&[]), 0.0);
    }

    #[test]
    fn test_autocorrelation_noise_vs_sine() {
        let noise = noise_seeded(4000, 0xdeadbeef);
        assert!(lag1_autocorrelation(&noise).abs() < 0.1);
        let slow = sine(4000, 50.0, 1.0);
        assert!(lag1_autocorrelation(&slow) > 0.9);
        assert_eq!(lag1_autocorrelation(&[1.0; 100]), 0.0);
    }

    #[test]
    fn test_dominant_frequency_finds_period() {
        let data = sine(1024, 16.0, 3.0);
        let f = dominant_frequency(&data);
        assert!((f - 1.0 / 16.0).abs() < 2.0 / 1024.0, "f = {f}");
    }

    #[test]
    fn test_magnitude_spectrum_shape() {
        let data = sine(256, 32.0, 1.0);
        let spec = magnitude_spectrum(&data, 16);
        assert_eq!(spec.len(), 16);
        // Bin k corresponds to index k-1; period 32 over 256 samples is bin 8.
        let peak = spec
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert_eq!(peak, 7);
        assert_eq!(magnitude_spectrum(&[1.0], 4), vec![0.0; 4]);
    }

    #[test]
    fn test_pearson() {
        let a: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let b: Vec<f64> = a.iter().map(|x| 3.0 * x + 1.0).collect();
        let c: Vec<f64> = a.iter().map(|x| -x).collect();
        assert!((pearson(&a, &b) - 1.0).abs() < 1e-9);
        assert!((pearson(&a, &c) + 1.0).abs() < 1e-9);
        let x = noise_seeded(1000, 1);
        let y = noise_seeded(1000, 0xcafebabe12345678);
        assert!(pearson(&x, &y).abs() < 0.1);
    }

    #[test]
    fn test_offdiagonal_correlation_separates_lockstep_from_independent() {
        let template = sine(128, 16.0, 10.0);
        let lockstep: Vec<Vec<f64>> = (0..20)
            .map(|s| {
                let n = noise_seeded(128, s + 1);
                template.iter().zip(n).map(|(t, e)| t + e).collect()
            })
            .collect();
        let independent: Vec<Vec<f64>> = (0..20).map(|s| noise_seeded(128, s * 7919 + 3)).collect();
        assert!(mean_abs_offdiagonal_correlation(&lockstep) > 0.9);
        assert!(mean_abs_offdiagonal_correlation(&independent) < 0.2);
    }

    #[test]
    fn test_linear_slope() {
        let xs: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 25.0 - x).collect();
        assert!((linear_slope(&xs, &ys) + 1.0).abs() < 1e-9);
        assert_eq!(linear_slope(&[1.0], &[2.0]), 0.0);
        assert_eq!(linear_slope(&[1.0, 1.0, 1.0], &[2.0, 3.0, 4.0]), 0.0);
    }

    #[test]
    fn test_histogram_constant_series() {
        let h = histogram(&[5.0; 50], 16);
        assert_eq!(h.counts[0], 50);
        assert_eq!(h.occupied(), 1);
        assert_eq!(shannon_entropy_bits(&h.counts), 0.0);
    }

    #[test]
    fn test_equal_frequency_histogram_ignores_shape() {
        // Heavy right tail: equal-width bins would crowd into the first bin.
        let skewed: Vec<f64> = (1..=1024).map(|i| (i as f64 / 100.0).exp()).collect();
        let h = equal_frequency_histogram(&skewed, 256);
        assert!(h.counts.iter().all(|&c| c == 4), "{:?}", h.counts);
        assert!((shannon_entropy_bits(&h.counts) - 8.0).abs() < 1e-9);
        assert!(shannon_entropy_bits(&histogram(&skewed, 256).counts) < 6.0);
    }

    #[test]
    fn test_equal_frequency_histogram_keeps_ties_together() {
        let mut data = vec![2.0; 90];
        data.extend((0..10).map(|i| 10.0 + i as f64));
        let h = equal_frequency_histogram(&data, 10);
        assert_eq!(h.counts[0], 90);
        assert_eq!(h.counts[9], 10);
        assert_eq!(h.occupied(), 2);
        assert_eq!(h.total, 100);
        assert_eq!(equal_frequency_histogram(&[], 8).total, 0);
    }

    #[test]
    fn test_entropy_uniform_counts() {
        let counts = vec![10u64; 256];
        assert!((shannon_entropy_bits(&counts) - 8.0).abs() < 1e-9);
        assert!(miller_madow_entropy_bits(&counts) > 8.0);
        assert_eq!(shannon_entropy_bits(&[]), 0.0);
    }

    #[test]
    fn test_normal_tail() {
        assert!((normal_two_sided_p(0.0) - 1.0).abs() < 1e-9);
        assert!((normal_two_sided_p(1.959964) - 0.05).abs() < 1e-4);
        assert!(normal_two_sided_p(8.0) < 1e-10);
    }

    #[test]
    fn test_summarize_fields_order() {
        let s = summarize(&sine(512, 32.0, 1.0));
        let names: Vec<&str> = s.fields().iter().map(|(n, _)| *n).collect();
        assert_eq!(names[0], "mean");
        assert_eq!(names[6], "dominant_frequency");
        assert!((s.dominant_frequency - 1.0 / 32.0).abs() < 1e-9);
    }
}

//! Statistical kernels shared by the analysis jobs.
//!
//! Everything here is pure and synchronous. Degenerate inputs (empty samples,
//! zero variance, insufficient history) return the neutral value instead of
//! failing; callers that need to distinguish "no result" get an `Option`.

/// Linear-interpolation quantile over a pre-sorted sample.
/// `q = 0` returns the minimum, `q = 1` the maximum.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

pub fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    quantile_sorted(&sorted, 0.5)
}

/// Median absolute deviation from the median.
pub fn mad(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let med = median(values);
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    median(&deviations)
}

/// Robust z-score: `0.6745 * (x - median) / MAD`, 0 when MAD is 0.
pub fn robust_z(x: f64, median: f64, mad: f64) -> f64 {
    if mad == 0.0 {
        return 0.0;
    }
    0.6745 * (x - median) / mad
}

/// Tukey fences `[Q1 - k*IQR, Q3 + k*IQR]` over a pre-sorted sample.
pub fn iqr_bounds_sorted(sorted: &[f64], k: f64) -> (f64, f64) {
    let q1 = quantile_sorted(sorted, 0.25);
    let q3 = quantile_sorted(sorted, 0.75);
    let iqr = q3 - q1;
    (q1 - k * iqr, q3 + k * iqr)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Unbiased sample variance; 0 for fewer than two points.
pub fn sample_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    values.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (values.len() - 1) as f64
}

pub fn sample_stddev(values: &[f64]) -> f64 {
    sample_variance(values).sqrt()
}

/// Abramowitz & Stegun 7.1.26 rational approximation of erf.
/// |error| < 1.5e-7 for |x| <= 4.
pub fn erf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t) * (-x * x).exp();
    sign * y
}

pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct WelchResult {
    pub t: f64,
    pub df: f64,
    /// Two-sided p-value from the standard-normal approximation.
    pub p_value: f64,
    pub mean_a: f64,
    pub mean_b: f64,
    pub var_a: f64,
    pub var_b: f64,
    pub effect_size: f64,
    pub n_a: usize,
    pub n_b: usize,
}

/// Welch's unequal-variance t-test. Requires two or more points per sample.
///
/// When both standard errors vanish the test degenerates: equal means give
/// `t = 0, p = 1`; unequal means give `t = ±inf, p = 0`.
pub fn welch_t_test(a: &[f64], b: &[f64]) -> Option<WelchResult> {
    if a.len() < 2 || b.len() < 2 {
        return None;
    }
    let n_a = a.len() as f64;
    let n_b = b.len() as f64;
    let mean_a = mean(a);
    let mean_b = mean(b);
    let var_a = sample_variance(a);
    let var_b = sample_variance(b);
    let se2_a = var_a / n_a;
    let se2_b = var_b / n_b;
    let se2 = se2_a + se2_b;
    let effect_size = mean_a - mean_b;

    let (t, df, p_value) = if se2 == 0.0 {
        if effect_size == 0.0 {
            (0.0, n_a + n_b - 2.0, 1.0)
        } else {
            let t = if effect_size > 0.0 {
                f64::INFINITY
            } else {
                f64::NEG_INFINITY
            };
            (t, n_a + n_b - 2.0, 0.0)
        }
    } else {
        let t = effect_size / se2.sqrt();
        // Welch–Satterthwaite degrees of freedom.
        let df = se2 * se2
            / (se2_a * se2_a / (n_a - 1.0) + se2_b * se2_b / (n_b - 1.0));
        let p = 2.0 * (1.0 - normal_cdf(t.abs()));
        (t, df, p.clamp(0.0, 1.0))
    };

    Some(WelchResult {
        t,
        df,
        p_value,
        mean_a,
        mean_b,
        var_a,
        var_b,
        effect_size,
        n_a: a.len(),
        n_b: b.len(),
    })
}

#[derive(Debug, Clone, Copy)]
pub struct BhEntry {
    pub q_value: f64,
    pub significant: bool,
}

/// Benjamini–Hochberg step-up correction.
///
/// Returns one entry per input p-value, in input order. Walking ranks from
/// largest to smallest enforces monotone q-values:
/// `q_i = min(q_{i+1}, p_i * m / rank_i)`.
pub fn benjamini_hochberg(p_values: &[f64], alpha: f64) -> Vec<BhEntry> {
    let m = p_values.len();
    if m == 0 {
        return Vec::new();
    }

    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&i, &j| p_values[i].total_cmp(&p_values[j]));

    let mut q_sorted = vec![0.0f64; m];
    let mut running_min = f64::INFINITY;
    for rank_idx in (0..m).rev() {
        let p = p_values[order[rank_idx]];
        let raw_q = p * m as f64 / (rank_idx + 1) as f64;
        running_min = running_min.min(raw_q.min(1.0));
        q_sorted[rank_idx] = running_min;
    }

    let mut out = vec![
        BhEntry {
            q_value: 0.0,
            significant: false,
        };
        m
    ];
    for (rank_idx, &orig) in order.iter().enumerate() {
        let q = q_sorted[rank_idx];
        out[orig] = BhEntry {
            q_value: q,
            significant: q <= alpha,
        };
    }
    out
}

/// Exponentially weighted moving average: `e_0 = x_0`,
/// `e_i = lambda*x_i + (1-lambda)*e_{i-1}`.
pub fn ewma(values: &[f64], lambda: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let mut prev = 0.0;
    for (i, &x) in values.iter().enumerate() {
        let e = if i == 0 { x } else { lambda * x + (1.0 - lambda) * prev };
        out.push(e);
        prev = e;
    }
    out
}

#[derive(Debug, Clone)]
pub struct CusumResult {
    pub s_pos: Vec<f64>,
    pub s_neg: Vec<f64>,
    /// Indices where either side crossed the threshold.
    pub signals: Vec<usize>,
}

impl CusumResult {
    pub fn signaled_at_last(&self) -> bool {
        match self.s_pos.len().checked_sub(1) {
            Some(last) => self.signals.contains(&last),
            None => false,
        }
    }
}

/// Two-sided CUSUM on deviations from `target` with slack `k` and threshold `h`.
pub fn cusum(values: &[f64], target: f64, k: f64, h: f64) -> CusumResult {
    let mut s_pos = Vec::with_capacity(values.len());
    let mut s_neg = Vec::with_capacity(values.len());
    let mut signals = Vec::new();
    let mut pos = 0.0f64;
    let mut neg = 0.0f64;
    for (i, &x) in values.iter().enumerate() {
        pos = (pos + (x - target - k)).max(0.0);
        neg = (neg + (x - target + k)).min(0.0);
        s_pos.push(pos);
        s_neg.push(neg);
        if pos > h || neg.abs() > h {
            signals.push(i);
        }
    }
    CusumResult {
        s_pos,
        s_neg,
        signals,
    }
}

/// Population Stability Index between a baseline and a current sample.
///
/// Bin edges come from baseline quantiles (`n_bins + 1` edges, deduplicated).
/// A value lands in `max{i : edge_i <= x}`, clamped into range, so the final
/// bin is closed on both sides. Probabilities are floored at 1e-6 before the
/// log-ratio.
pub fn psi(baseline: &[f64], current: &[f64], n_bins: usize) -> f64 {
    const EPS: f64 = 1e-6;
    if baseline.is_empty() || current.is_empty() || n_bins == 0 {
        return 0.0;
    }

    let mut sorted_base = baseline.to_vec();
    sorted_base.sort_by(|a, b| a.total_cmp(b));

    let mut edges = Vec::with_capacity(n_bins + 1);
    for i in 0..=n_bins {
        edges.push(quantile_sorted(&sorted_base, i as f64 / n_bins as f64));
    }
    edges.dedup();
    if edges.len() < 2 {
        // Constant baseline: one collapsed bin, no measurable shift.
        return 0.0;
    }
    let bins = edges.len() - 1;

    let assign = |x: f64| -> usize {
        let mut idx = 0usize;
        for (i, &edge) in edges.iter().enumerate() {
            if edge <= x {
                idx = i;
            } else {
                break;
            }
        }
        idx.min(bins - 1)
    };

    let mut base_counts = vec![0usize; bins];
    for &x in baseline {
        base_counts[assign(x)] += 1;
    }
    let mut cur_counts = vec![0usize; bins];
    for &x in current {
        cur_counts[assign(x)] += 1;
    }

    let mut total = 0.0;
    for i in 0..bins {
        let p_b = (base_counts[i] as f64 / baseline.len() as f64).max(EPS);
        let p_c = (cur_counts[i] as f64 / current.len() as f64).max(EPS);
        total += (p_c - p_b) * (p_c / p_b).ln();
    }
    total
}

/// 1D Wasserstein distance between two samples of possibly unequal length.
///
/// Both samples are sorted, then `n = min(n_a, n_b)` aligned points are drawn
/// at positions `floor(i * n_x / n)` and compared pairwise.
pub fn wasserstein_1d(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut sa = a.to_vec();
    let mut sb = b.to_vec();
    sa.sort_by(|x, y| x.total_cmp(y));
    sb.sort_by(|x, y| x.total_cmp(y));

    let n = sa.len().min(sb.len());
    let mut total = 0.0;
    for i in 0..n {
        let ia = i * sa.len() / n;
        let ib = i * sb.len() / n;
        total += (sa[ia] - sb[ib]).abs();
    }
    total / n as f64
}

/// Pearson correlation; 0 on degenerate inputs (mismatched length, < 2 points,
/// or zero variance on either side).
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.len() < 2 {
        return 0.0;
    }
    let mean_a = mean(a);
    let mean_b = mean(b);
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..a.len() {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

pub const DEFAULT_ANNUALIZATION: f64 = 252.0;

/// Annualized Sharpe ratio: `mean / stddev * sqrt(annualization)`.
pub fn sharpe(returns: &[f64], annualization: f64) -> f64 {
    let sd = sample_stddev(returns);
    if sd == 0.0 {
        return 0.0;
    }
    mean(returns) / sd * annualization.sqrt()
}

/// t-statistic of the sample mean: `mean / (stddev / sqrt(n))`.
pub fn t_stat_of_mean(values: &[f64]) -> f64 {
    let sd = sample_stddev(values);
    if sd == 0.0 || values.is_empty() {
        return 0.0;
    }
    mean(values) / (sd / (values.len() as f64).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() < tol,
            "expected {} within {} of {}",
            actual,
            tol,
            expected
        );
    }

    #[test]
    fn quantile_interpolates_linearly() {
        let xs = [1.0, 2.0, 3.0, 4.0];
        assert_close(quantile_sorted(&xs, 0.0), 1.0, 1e-12);
        assert_close(quantile_sorted(&xs, 1.0), 4.0, 1e-12);
        assert_close(quantile_sorted(&xs, 0.5), 2.5, 1e-12);
        assert_close(quantile_sorted(&xs, 0.25), 1.75, 1e-12);
        assert_eq!(quantile_sorted(&[], 0.5), 0.0);
        assert_close(quantile_sorted(&[7.0], 0.9), 7.0, 1e-12);
    }

    #[test]
    fn mad_and_robust_z() {
        let xs = [1.0, 1.0, 2.0, 2.0, 4.0, 6.0, 9.0];
        assert_close(median(&xs), 2.0, 1e-12);
        assert_close(mad(&xs), 1.0, 1e-12);
        assert_close(robust_z(9.0, 2.0, 1.0), 0.6745 * 7.0, 1e-12);
        // Zero MAD never divides.
        assert_eq!(robust_z(5.0, 2.0, 0.0), 0.0);
    }

    #[test]
    fn iqr_fences_default_k() {
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        let (lo, hi) = iqr_bounds_sorted(&xs, 1.5);
        // Q1 = 2, Q3 = 4, IQR = 2.
        assert_close(lo, -1.0, 1e-12);
        assert_close(hi, 7.0, 1e-12);
    }

    #[test]
    fn erf_matches_published_values() {
        // Abramowitz & Stegun table values.
        assert_close(erf(0.0), 0.0, 1e-9);
        assert_close(erf(0.5), 0.5204999, 1.5e-7);
        assert_close(erf(1.0), 0.8427008, 1.5e-7);
        assert_close(erf(2.0), 0.9953223, 1.5e-7);
        assert_close(erf(-1.0), -0.8427008, 1.5e-7);
    }

    #[test]
    fn welch_detects_separated_means() {
        let a: Vec<f64> = (0..50).map(|i| 1.0 + 0.001 * (i % 5) as f64).collect();
        let b: Vec<f64> = (0..50).map(|i| 0.5 + 0.001 * (i % 5) as f64).collect();
        let r = welch_t_test(&a, &b).expect("enough samples");
        assert!(r.t > 10.0);
        assert!(r.p_value < 1e-3);
        assert_close(r.effect_size, 0.5, 1e-2);
        assert_eq!(r.n_a, 50);
        assert_eq!(r.n_b, 50);
    }

    #[test]
    fn welch_degenerate_boundaries() {
        let same = [1.0, 1.0, 1.0];
        let r = welch_t_test(&same, &same).unwrap();
        assert_eq!(r.t, 0.0);
        assert_eq!(r.p_value, 1.0);

        let lower = [0.5, 0.5, 0.5];
        let r = welch_t_test(&same, &lower).unwrap();
        assert!(r.t.is_infinite() && r.t > 0.0);
        assert_eq!(r.p_value, 0.0);

        assert!(welch_t_test(&[1.0], &same).is_none());
    }

    #[test]
    fn welch_satterthwaite_df_equal_variance() {
        // Equal n and equal variance collapses to n_a + n_b - 2.
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [2.0, 3.0, 4.0, 5.0];
        let r = welch_t_test(&a, &b).unwrap();
        assert_close(r.df, 6.0, 1e-9);
    }

    #[test]
    fn bh_q_values_monotone_and_scaled() {
        let ps = [0.01, 0.04, 0.03, 0.005];
        let entries = benjamini_hochberg(&ps, 0.05);
        // Sorted: 0.005 (r1), 0.01 (r2), 0.03 (r3), 0.04 (r4).
        assert_close(entries[3].q_value, 0.02, 1e-12);
        assert_close(entries[0].q_value, 0.02, 1e-12);
        assert_close(entries[2].q_value, 0.04, 1e-12);
        assert_close(entries[1].q_value, 0.04, 1e-12);
        assert!(entries.iter().all(|e| e.significant));

        // Sorting by p, q must be non-decreasing.
        let mut order: Vec<usize> = (0..ps.len()).collect();
        order.sort_by(|&i, &j| ps[i].total_cmp(&ps[j]));
        let qs: Vec<f64> = order.iter().map(|&i| entries[i].q_value).collect();
        assert!(qs.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn bh_insignificant_tail() {
        let ps = [0.2, 0.9];
        let entries = benjamini_hochberg(&ps, 0.05);
        assert!(!entries[0].significant);
        assert!(!entries[1].significant);
        assert_close(entries[0].q_value, 0.4, 1e-12);
        assert_close(entries[1].q_value, 0.9, 1e-12);
    }

    #[test]
    fn ewma_seeds_with_first_value() {
        let out = ewma(&[1.0, 2.0, 3.0], 0.5);
        assert_close(out[0], 1.0, 1e-12);
        assert_close(out[1], 1.5, 1e-12);
        assert_close(out[2], 2.25, 1e-12);
        assert!(ewma(&[], 0.3).is_empty());
    }

    #[test]
    fn cusum_fires_on_sustained_shift() {
        let mut xs = vec![0.0; 10];
        xs.extend(vec![0.5; 5]);
        let r = cusum(&xs, 0.0, 0.1, 1.0);
        assert!(r.signaled_at_last());
        assert!(r.signals[0] >= 10);
        // Stable series never fires.
        let quiet = cusum(&vec![0.0; 20], 0.0, 0.1, 1.0);
        assert!(quiet.signals.is_empty());
        assert!(!quiet.signaled_at_last());
    }

    #[test]
    fn cusum_negative_side() {
        let mut xs = vec![1.0; 10];
        xs.extend(vec![0.2; 6]);
        let r = cusum(&xs, 1.0, 0.05, 1.5);
        assert!(r.signaled_at_last());
        assert!(r.s_neg.last().unwrap().abs() > 1.5);
    }

    #[test]
    fn psi_zero_for_identical_distributions() {
        let base: Vec<f64> = (0..200).map(|i| (i as f64) / 200.0).collect();
        let value = psi(&base, &base, 10);
        assert!(value.abs() < 1e-6, "psi {} should be ~0", value);
    }

    #[test]
    fn psi_large_for_shifted_distributions() {
        let base: Vec<f64> = (0..200).map(|i| 0.8 + 0.001 * (i % 100) as f64).collect();
        let cur: Vec<f64> = (0..60).map(|i| 0.5 + 0.001 * (i % 60) as f64).collect();
        assert!(psi(&base, &cur, 10) >= 0.35);
    }

    #[test]
    fn psi_constant_baseline_is_neutral() {
        let base = vec![1.0; 50];
        let cur = vec![2.0; 50];
        assert_eq!(psi(&base, &cur, 10), 0.0);
    }

    #[test]
    fn wasserstein_translation_distance() {
        let a: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let b: Vec<f64> = (0..100).map(|i| i as f64 + 3.0).collect();
        assert_close(wasserstein_1d(&a, &b), 3.0, 1e-9);
        assert_eq!(wasserstein_1d(&[], &b), 0.0);
    }

    #[test]
    fn wasserstein_unequal_lengths() {
        let a = vec![0.0; 100];
        let b = vec![1.0; 30];
        assert_close(wasserstein_1d(&a, &b), 1.0, 1e-9);
    }

    #[test]
    fn pearson_perfect_and_degenerate() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let up: Vec<f64> = a.iter().map(|x| 2.0 * x + 1.0).collect();
        let down: Vec<f64> = a.iter().map(|x| -x).collect();
        assert_close(pearson(&a, &up), 1.0, 1e-9);
        assert_close(pearson(&a, &down), -1.0, 1e-9);
        assert_eq!(pearson(&a, &[1.0, 1.0, 1.0, 1.0]), 0.0);
        assert_eq!(pearson(&a, &a[..2]), 0.0);
    }

    #[test]
    fn sharpe_and_t_stat() {
        let rets = [0.01, 0.02, 0.015, 0.012];
        let s = sharpe(&rets, DEFAULT_ANNUALIZATION);
        assert!(s > 0.0);
        assert_eq!(sharpe(&[0.01, 0.01], DEFAULT_ANNUALIZATION), 0.0);
        assert!(t_stat_of_mean(&rets) > 0.0);
        assert_eq!(t_stat_of_mean(&[5.0, 5.0]), 0.0);
    }
}

//! Per-run metric normalization and weighted aggregation.
//!
//! A workflow's config is the global default with an optional per-workflow
//! override shallow-merged on top. The worker resolves the config once per
//! event and scores the run; the same scoring is replay-safe because it only
//! depends on the event payload and the resolved config.

use crate::config::normalization::Override;

pub const NORMALIZATION_VERSION: &str = "norm-v1";
pub const WEIGHTING_VERSION: &str = "weights-v1";
pub const DEFAULT_EVALUATOR_VERSION: &str = "builtin-v1";

/// Shrinkage constant for orchestration-level quality: `alpha = n / (n + K)`.
pub const SHRINKAGE_K: f64 = 50.0;
pub const SHRINKAGE_PRIOR: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityWeights {
    pub faithfulness: f64,
    pub coverage: f64,
    pub confidence: f64,
    pub hallucination: f64,
    pub latency: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        // Defaults sum to 1.0.
        Self {
            faithfulness: 0.3,
            coverage: 0.2,
            confidence: 0.1,
            hallucination: 0.25,
            latency: 0.15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizationConfig {
    /// Target latency treated as the 99th percentile for log-scaled
    /// normalization.
    pub latency_p99_target_ms: f64,
    pub quality_weights: QualityWeights,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            latency_p99_target_ms: 5_000.0,
            quality_weights: QualityWeights::default(),
        }
    }
}

/// Shallow-merge a workflow override onto the global default.
pub fn resolve_config(workflow_override: Option<&Override>) -> NormalizationConfig {
    let mut config = NormalizationConfig::default();
    let Some(over) = workflow_override else {
        return config;
    };
    if let Some(target) = over.latency_p99_target_ms {
        config.latency_p99_target_ms = target;
    }
    let w = &over.quality_weights;
    if let Some(v) = w.faithfulness {
        config.quality_weights.faithfulness = v;
    }
    if let Some(v) = w.coverage {
        config.quality_weights.coverage = v;
    }
    if let Some(v) = w.confidence {
        config.quality_weights.confidence = v;
    }
    if let Some(v) = w.hallucination {
        config.quality_weights.hallucination = v;
    }
    if let Some(v) = w.latency {
        config.quality_weights.latency = v;
    }
    config
}

/// Raw metrics as reported on an AgentRunCompleted event.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawMetrics {
    pub latency_ms: f64,
    pub faithfulness: Option<f64>,
    pub hallucination_flag: Option<bool>,
    pub coverage: Option<f64>,
    pub confidence: Option<f64>,
}

/// Normalized metrics plus the weighted aggregates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredMetrics {
    pub latency_norm: f64,
    pub faithfulness_norm: Option<f64>,
    pub hallucination_norm: Option<f64>,
    pub coverage_norm: Option<f64>,
    pub confidence_norm: Option<f64>,
    pub run_quality_score: Option<f64>,
    pub risk_score: f64,
}

pub fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// Log-scaled latency normalization against the p99 target: 1.0 at zero
/// latency, ~0.01 at the target, clamped to [0, 1] beyond it.
fn normalize_latency(latency_ms: f64, target_ms: f64) -> f64 {
    let scaled = (latency_ms.max(0.0)).ln_1p() / (target_ms.max(1.0)).ln_1p();
    clamp01(1.0 - scaled)
}

pub fn score(raw: &RawMetrics, config: &NormalizationConfig) -> ScoredMetrics {
    let latency_norm = normalize_latency(raw.latency_ms, config.latency_p99_target_ms);
    let faithfulness_norm = raw.faithfulness.map(clamp01);
    let coverage_norm = raw.coverage.map(clamp01);
    let confidence_norm = raw.confidence.map(clamp01);
    let hallucination_norm = raw
        .hallucination_flag
        .map(|flagged| if flagged { 0.0 } else { 1.0 });

    let w = &config.quality_weights;
    let components = [
        (faithfulness_norm, w.faithfulness),
        (coverage_norm, w.coverage),
        (confidence_norm, w.confidence),
        (hallucination_norm, w.hallucination),
        (Some(latency_norm), w.latency),
    ];

    // Weighted sum over present components, with the present-component
    // weights re-normalized to sum to 1.
    let present_weight: f64 = components
        .iter()
        .filter(|(value, _)| value.is_some())
        .map(|(_, weight)| weight)
        .sum();
    let run_quality_score = if present_weight > 0.0 {
        let total: f64 = components
            .iter()
            .filter_map(|(value, weight)| value.map(|v| v * weight))
            .sum();
        Some(clamp01(total / present_weight))
    } else {
        None
    };

    let risk_score = clamp01(
        1.0 - faithfulness_norm.unwrap_or(1.0) * hallucination_norm.unwrap_or(1.0),
    );

    ScoredMetrics {
        latency_norm,
        faithfulness_norm,
        hallucination_norm,
        coverage_norm,
        confidence_norm,
        run_quality_score,
        risk_score,
    }
}

/// Shrink a small-sample mean toward the prior: `alpha = n / (n + k)`.
pub fn shrunk_mean(sample_mean: f64, n: u64, prior: f64) -> f64 {
    let n = n as f64;
    let alpha = n / (n + SHRINKAGE_K);
    alpha * sample_mean + (1.0 - alpha) * prior
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::normalization::WeightsOverride;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn default_weights_sum_to_one() {
        let w = QualityWeights::default();
        assert!(close(
            w.faithfulness + w.coverage + w.confidence + w.hallucination + w.latency,
            1.0
        ));
    }

    #[test]
    fn override_merges_shallowly() {
        let over = Override {
            latency_p99_target_ms: Some(1_000.0),
            quality_weights: WeightsOverride {
                faithfulness: Some(0.5),
                ..Default::default()
            },
        };
        let config = resolve_config(Some(&over));
        assert!(close(config.latency_p99_target_ms, 1_000.0));
        assert!(close(config.quality_weights.faithfulness, 0.5));
        // Untouched fields keep the global default.
        assert!(close(config.quality_weights.coverage, 0.2));
        assert_eq!(resolve_config(None), NormalizationConfig::default());
    }

    #[test]
    fn latency_normalization_bounds() {
        let config = NormalizationConfig::default();
        let zero = score(
            &RawMetrics {
                latency_ms: 0.0,
                ..Default::default()
            },
            &config,
        );
        assert!(close(zero.latency_norm, 1.0));

        let at_target = score(
            &RawMetrics {
                latency_ms: 5_000.0,
                ..Default::default()
            },
            &config,
        );
        assert!(close(at_target.latency_norm, 0.0));

        let beyond = score(
            &RawMetrics {
                latency_ms: 500_000.0,
                ..Default::default()
            },
            &config,
        );
        assert_eq!(beyond.latency_norm, 0.0);

        let negative = score(
            &RawMetrics {
                latency_ms: -50.0,
                ..Default::default()
            },
            &config,
        );
        assert!(close(negative.latency_norm, 1.0));
    }

    #[test]
    fn zero_one_metrics_clamp() {
        let config = NormalizationConfig::default();
        let scored = score(
            &RawMetrics {
                latency_ms: 100.0,
                faithfulness: Some(1.7),
                coverage: Some(-0.2),
                confidence: Some(0.4),
                hallucination_flag: Some(false),
            },
            &config,
        );
        assert_eq!(scored.faithfulness_norm, Some(1.0));
        assert_eq!(scored.coverage_norm, Some(0.0));
        assert_eq!(scored.confidence_norm, Some(0.4));
        assert_eq!(scored.hallucination_norm, Some(1.0));
    }

    #[test]
    fn hallucination_flag_maps_to_zero() {
        let config = NormalizationConfig::default();
        let scored = score(
            &RawMetrics {
                latency_ms: 10.0,
                faithfulness: Some(0.9),
                hallucination_flag: Some(true),
                ..Default::default()
            },
            &config,
        );
        assert_eq!(scored.hallucination_norm, Some(0.0));
        // risk = 1 - 0.9 * 0 = 1.
        assert!(close(scored.risk_score, 1.0));
    }

    #[test]
    fn quality_renormalizes_present_weights() {
        let config = NormalizationConfig::default();
        // Only faithfulness and latency present.
        let scored = score(
            &RawMetrics {
                latency_ms: 0.0,
                faithfulness: Some(0.8),
                ..Default::default()
            },
            &config,
        );
        let w = QualityWeights::default();
        let expected = (0.8 * w.faithfulness + 1.0 * w.latency) / (w.faithfulness + w.latency);
        assert!(close(scored.run_quality_score.unwrap(), expected));
    }

    #[test]
    fn full_metrics_quality_in_unit_interval() {
        let config = NormalizationConfig::default();
        let scored = score(
            &RawMetrics {
                latency_ms: 800.0,
                faithfulness: Some(0.92),
                coverage: Some(0.7),
                confidence: Some(0.85),
                hallucination_flag: Some(false),
            },
            &config,
        );
        let q = scored.run_quality_score.unwrap();
        assert!((0.0..=1.0).contains(&q));
        assert!(scored.risk_score >= 0.0 && scored.risk_score <= 1.0);
    }

    #[test]
    fn risk_defaults_missing_factors_to_one() {
        let config = NormalizationConfig::default();
        let scored = score(
            &RawMetrics {
                latency_ms: 10.0,
                ..Default::default()
            },
            &config,
        );
        // No faithfulness, no hallucination flag: risk = 1 - 1*1 = 0.
        assert!(close(scored.risk_score, 0.0));
    }

    #[test]
    fn shrinkage_pulls_small_samples_to_prior() {
        let tiny = shrunk_mean(1.0, 1, SHRINKAGE_PRIOR);
        assert!((tiny - SHRINKAGE_PRIOR).abs() < 0.01);
        let big = shrunk_mean(1.0, 10_000, SHRINKAGE_PRIOR);
        assert!(big > 0.99);
        // alpha = 50 / 100 at n = 50.
        assert!(close(shrunk_mean(1.0, 50, 0.5), 0.75));
    }
}

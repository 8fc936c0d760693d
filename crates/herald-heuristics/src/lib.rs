//! Pure threshold tuning for the content gate policy.
//!
//! `evaluate` maps a fixed baseline plus trailing telemetry onto the adaptive
//! policy for the next cycle. It is deliberately free of I/O and clocks so the
//! tuning rules can be tested as plain functions; callers assemble
//! [`PolicyFeatures`] from their telemetry store.

use serde::{Deserialize, Serialize};

/// Progress below this fraction of the pro-rated target loosens discovery
/// minimums.
pub const UNDER_TARGET_PROGRESS: f64 = 0.45;
/// Progress above this fraction tightens duplicate gates and raises discovery
/// minimums.
pub const OVER_TARGET_PROGRESS: f64 = 1.05;
/// Fallback-template usage rate at which trend minimums are eased.
pub const FALLBACK_PRESSURE_RATE: f64 = 0.35;
/// Post-generation failure rate at which trend minimums are eased.
pub const FAILURE_PRESSURE_RATE: f64 = 0.5;
/// Duplicate-classified failures in the trailing window that ease duplicate
/// thresholds.
pub const DUPLICATE_PRESSURE_COUNT: u64 = 2;

const POST_DUPLICATE_BAND: (f64, f64) = (0.65, 0.86);
const POST_NARRATIVE_BAND: (f64, f64) = (0.70, 0.90);
const REPLY_DUPLICATE_BAND: (f64, f64) = (0.70, 0.90);
const REPLY_NARRATIVE_BAND: (f64, f64) = (0.74, 0.92);
const TREND_SCORE_BAND: (f64, f64) = (0.35, 0.80);
const TREND_ENGAGEMENT_BAND: (f64, f64) = (40.0, 400.0);
const SOURCE_TRUST_BAND: (f64, f64) = (0.40, 0.75);

/// Fixed starting thresholds for the adaptive gate policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyBaseline {
    pub post_duplicate_threshold: f64,
    pub post_narrative_threshold: f64,
    pub reply_duplicate_threshold: f64,
    pub reply_narrative_threshold: f64,
    pub min_trend_score: f64,
    pub min_trend_engagement: f64,
    pub min_source_trust: f64,
}

impl Default for PolicyBaseline {
    fn default() -> Self {
        Self {
            post_duplicate_threshold: 0.78,
            post_narrative_threshold: 0.80,
            reply_duplicate_threshold: 0.82,
            reply_narrative_threshold: 0.86,
            min_trend_score: 0.55,
            min_trend_engagement: 120.0,
            min_source_trust: 0.55,
        }
    }
}

/// Trailing telemetry the tuner reacts to.
///
/// `progress_ratio` is posts-so-far divided by the pro-rated daily target at
/// evaluation time; rates are over the trailing window of post-generation
/// runs (0.0 when no runs happened yet).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyFeatures {
    pub progress_ratio: f64,
    pub post_runs: u64,
    pub fallback_rate: f64,
    pub failure_rate: f64,
    pub duplicate_failures: u64,
}

/// The tuned policy for one cycle. `rationale` lists the triggered adjustment
/// reasons in rule order, for observability only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdaptivePolicy {
    pub post_duplicate_threshold: f64,
    pub post_narrative_threshold: f64,
    pub reply_duplicate_threshold: f64,
    pub reply_narrative_threshold: f64,
    pub min_trend_score: f64,
    pub min_trend_engagement: f64,
    pub min_source_trust: f64,
    pub rationale: String,
}

impl AdaptivePolicy {
    fn from_baseline(baseline: &PolicyBaseline) -> Self {
        Self {
            post_duplicate_threshold: baseline.post_duplicate_threshold,
            post_narrative_threshold: baseline.post_narrative_threshold,
            reply_duplicate_threshold: baseline.reply_duplicate_threshold,
            reply_narrative_threshold: baseline.reply_narrative_threshold,
            min_trend_score: baseline.min_trend_score,
            min_trend_engagement: baseline.min_trend_engagement,
            min_source_trust: baseline.min_source_trust,
            rationale: String::new(),
        }
    }

    fn clamp_to_bands(&mut self) {
        self.post_duplicate_threshold = clamp(self.post_duplicate_threshold, POST_DUPLICATE_BAND);
        self.post_narrative_threshold = clamp(self.post_narrative_threshold, POST_NARRATIVE_BAND);
        self.reply_duplicate_threshold =
            clamp(self.reply_duplicate_threshold, REPLY_DUPLICATE_BAND);
        self.reply_narrative_threshold =
            clamp(self.reply_narrative_threshold, REPLY_NARRATIVE_BAND);
        self.min_trend_score = clamp(self.min_trend_score, TREND_SCORE_BAND);
        self.min_trend_engagement = clamp(self.min_trend_engagement, TREND_ENGAGEMENT_BAND);
        self.min_source_trust = clamp(self.min_source_trust, SOURCE_TRUST_BAND);
    }
}

fn clamp(value: f64, band: (f64, f64)) -> f64 {
    value.clamp(band.0, band.1)
}

/// Compute the adaptive policy for the next cycle.
pub fn evaluate(baseline: &PolicyBaseline, features: &PolicyFeatures) -> AdaptivePolicy {
    let mut policy = AdaptivePolicy::from_baseline(baseline);
    let mut reasons: Vec<&'static str> = Vec::new();

    if features.progress_ratio < UNDER_TARGET_PROGRESS {
        policy.min_trend_score -= 0.08;
        policy.min_source_trust -= 0.05;
        policy.min_trend_engagement *= 0.7;
        reasons.push("under-target");
    } else if features.progress_ratio > OVER_TARGET_PROGRESS {
        policy.post_duplicate_threshold -= 0.06;
        policy.post_narrative_threshold -= 0.05;
        policy.reply_duplicate_threshold -= 0.04;
        policy.reply_narrative_threshold -= 0.04;
        policy.min_trend_score += 0.08;
        policy.min_trend_engagement *= 1.3;
        policy.min_source_trust += 0.05;
        reasons.push("over-target");
    }

    if features.fallback_rate >= FALLBACK_PRESSURE_RATE {
        policy.min_trend_score -= 0.04;
        reasons.push("fallback-pressure");
    }
    if features.failure_rate >= FAILURE_PRESSURE_RATE {
        policy.min_trend_score -= 0.04;
        reasons.push("failure-pressure");
    }
    if features.duplicate_failures >= DUPLICATE_PRESSURE_COUNT {
        policy.post_duplicate_threshold += 0.04;
        policy.reply_duplicate_threshold += 0.04;
        reasons.push("duplicate-pressure");
    }

    policy.clamp_to_bands();
    policy.rationale = if reasons.is_empty() {
        "baseline".to_string()
    } else {
        reasons.join(",")
    };
    policy
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neutral_features() -> PolicyFeatures {
        PolicyFeatures {
            progress_ratio: 0.8,
            post_runs: 4,
            fallback_rate: 0.0,
            failure_rate: 0.0,
            duplicate_failures: 0,
        }
    }

    #[test]
    fn neutral_telemetry_returns_baseline() {
        let baseline = PolicyBaseline::default();
        let policy = evaluate(&baseline, &neutral_features());
        assert_eq!(policy.rationale, "baseline");
        assert_eq!(
            policy.post_duplicate_threshold,
            baseline.post_duplicate_threshold
        );
        assert_eq!(policy.min_trend_score, baseline.min_trend_score);
    }

    #[test]
    fn under_target_loosens_discovery_minimums() {
        let baseline = PolicyBaseline::default();
        let mut features = neutral_features();
        features.progress_ratio = 0.2;
        let policy = evaluate(&baseline, &features);
        assert!(policy.min_trend_score < baseline.min_trend_score);
        assert!(policy.min_source_trust < baseline.min_source_trust);
        assert!(policy.min_trend_engagement < baseline.min_trend_engagement);
        assert_eq!(policy.rationale, "under-target");
    }

    #[test]
    fn over_target_tightens_duplicate_gates() {
        let baseline = PolicyBaseline::default();
        let mut features = neutral_features();
        features.progress_ratio = 1.4;
        let policy = evaluate(&baseline, &features);
        assert!(policy.post_duplicate_threshold < baseline.post_duplicate_threshold);
        assert!(policy.post_narrative_threshold < baseline.post_narrative_threshold);
        assert!(policy.min_trend_score > baseline.min_trend_score);
        assert!(policy.min_trend_engagement > baseline.min_trend_engagement);
        assert_eq!(policy.rationale, "over-target");
    }

    #[test]
    fn duplicate_pressure_raises_thresholds_within_band() {
        let mut baseline = PolicyBaseline::default();
        baseline.post_duplicate_threshold = 0.85;
        let mut features = neutral_features();
        features.duplicate_failures = 3;
        let policy = evaluate(&baseline, &features);
        assert!(policy.post_duplicate_threshold > 0.85);
        assert!(policy.post_duplicate_threshold <= 0.86);
        assert!(policy.reply_duplicate_threshold > baseline.reply_duplicate_threshold);
        assert_eq!(policy.rationale, "duplicate-pressure");
    }

    #[test]
    fn pressure_reasons_accumulate_in_rule_order() {
        let baseline = PolicyBaseline::default();
        let features = PolicyFeatures {
            progress_ratio: 0.1,
            post_runs: 6,
            fallback_rate: 0.5,
            failure_rate: 0.6,
            duplicate_failures: 2,
        };
        let policy = evaluate(&baseline, &features);
        assert_eq!(
            policy.rationale,
            "under-target,fallback-pressure,failure-pressure,duplicate-pressure"
        );
        assert!(policy.min_trend_score >= TREND_SCORE_BAND.0);
    }

    #[test]
    fn clamps_hold_for_extreme_baselines() {
        let baseline = PolicyBaseline {
            post_duplicate_threshold: 0.95,
            post_narrative_threshold: 0.99,
            reply_duplicate_threshold: 0.99,
            reply_narrative_threshold: 0.99,
            min_trend_score: 0.05,
            min_trend_engagement: 5.0,
            min_source_trust: 0.05,
        };
        let policy = evaluate(&baseline, &neutral_features());
        assert!(policy.post_duplicate_threshold <= 0.86);
        assert!(policy.min_trend_score >= 0.35);
        assert!(policy.min_trend_engagement >= 40.0);
        assert!(policy.min_source_trust >= 0.40);
    }
}

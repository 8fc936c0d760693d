//! Assembles tuner inputs from telemetry and publishes the cycle policy.
//!
//! The tuning rules live in `herald-heuristics`; this hub only gathers the
//! trailing features, runs the pure evaluation, and announces the result.

use herald_events::Bus;
use herald_heuristics::{evaluate, AdaptivePolicy, PolicyBaseline, PolicyFeatures};
use herald_topics as topics;
use serde_json::json;

use crate::clock::Clock;
use crate::config::Config;
use crate::memory::MemoryService;
use crate::responses;
use crate::util;

/// Pro-rated expectation below which progress reads as neutral. Right after
/// local midnight the expected count is near zero and any post would register
/// as wildly over target.
const MIN_EXPECTED_PROGRESS: f64 = 0.1;
/// Days of post-generation history feeding the tuner.
const TRAILING_METRIC_DAYS: i64 = 3;
/// Failure-reason substrings that count as duplicate-classified. Covers all
/// three novelty-gate reasons plus the plain duplicate checks.
const DUPLICATE_REASON_MARKERS: [&str; 4] = ["duplicate", "narrative", "opening", "banned"];

pub struct PolicyHub {
    bus: Bus,
    baseline: PolicyBaseline,
}

impl PolicyHub {
    pub fn new(bus: Bus) -> Self {
        Self {
            bus,
            baseline: PolicyBaseline::default(),
        }
    }

    /// Recompute the gate policy for the coming cycle and publish it.
    pub async fn tune(
        &self,
        config: &Config,
        memory: &MemoryService,
        clock: &dyn Clock,
    ) -> AdaptivePolicy {
        let features = assemble_features(config, memory, clock).await;
        let policy = evaluate(&self.baseline, &features);
        let mut payload = json!({
            "rationale": policy.rationale,
            "progress_ratio": features.progress_ratio,
            "post_runs": features.post_runs,
            "fallback_rate": features.fallback_rate,
            "failure_rate": features.failure_rate,
            "duplicate_failures": features.duplicate_failures,
        });
        if let Ok(snapshot) = serde_json::to_value(&policy) {
            payload["policy"] = snapshot;
        }
        responses::attach_corr(&mut payload);
        self.bus.publish(topics::TOPIC_POLICY_TUNED, &payload);
        policy
    }
}

async fn assemble_features(
    config: &Config,
    memory: &MemoryService,
    clock: &dyn Clock,
) -> PolicyFeatures {
    let today = memory.today_activity_count().await;
    let day_fraction = util::local_day_fraction(&config.timezone_offset, clock.now_utc());
    let expected = config.daily_target as f64 * day_fraction;
    let progress_ratio = if expected <= MIN_EXPECTED_PROGRESS {
        1.0
    } else {
        today as f64 / expected
    };

    let metrics = memory.trailing_post_metrics(TRAILING_METRIC_DAYS).await;
    let runs = metrics.post_runs;
    let rate = |count: u64| {
        if runs == 0 {
            0.0
        } else {
            count as f64 / runs as f64
        }
    };
    let duplicate_failures = metrics
        .fail_reasons
        .iter()
        .filter(|(reason, _)| {
            DUPLICATE_REASON_MARKERS
                .iter()
                .any(|marker| reason.contains(marker))
        })
        .map(|(_, count)| *count)
        .sum();

    PolicyFeatures {
        progress_ratio,
        post_runs: runs,
        fallback_rate: rate(metrics.fallback_used),
        failure_rate: rate(metrics.post_failures),
        duplicate_failures,
    }
}

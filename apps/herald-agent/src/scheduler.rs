//! The cycle scheduler: one cooperative governance pass at a time.
//!
//! A cycle walks Init, DigestIngest, MentionPass, ActionLoop, Finalize and
//! always runs to completion. Quota that cannot be spent carries forward to
//! the next cycle; nothing in here block-waits mid-cycle. The outer loop
//! sleeps a randomized interval between cycles through the injectable
//! sleeper, so tests drive whole cycles without wall-clock waits.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use herald_heuristics::AdaptivePolicy;
use herald_topics as topics;
use rand::Rng;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::actions::{self, TrendContext};
use crate::app_state::AppState;
use crate::config::Config;
use crate::connectors::PendingMention;
use crate::digest::{digest_nutrients, DigestOptions, DigestOutcome, ScoredNutrient};
use crate::market::MarketSnapshot;
use crate::responses;
use crate::tasks::{spawn_supervised, TaskHandle};
use crate::trend::{build_onchain_evidence, build_trend_events, TrendEvent};

/// Budgeted read kinds, one per acquisition surface.
pub(crate) const KIND_SIGNAL_NUTRIENTS: &str = "signals.nutrients";
pub(crate) const KIND_SIGNAL_NEWS: &str = "signals.news";
pub(crate) const KIND_SIGNAL_MARKET: &str = "signals.market";
pub(crate) const KIND_SIGNAL_MENTIONS: &str = "signals.mentions";

/// Trailing ledger entries consulted for digest consistency scoring.
const CONSISTENCY_LOOKBACK: usize = 60;
/// Evidence items kept in the cycle pool before the planner truncates.
const EVIDENCE_POOL: usize = 8;
/// Posts behind the lane-usage snapshot in the cycle summary.
const LANE_USAGE_WINDOW: usize = 20;
/// Source trust moves per digested record.
const TRUST_DELTA_ACCEPTED: f64 = 0.02;
const TRUST_DELTA_REJECTED: f64 = -0.01;
/// Qualification score weights over blended trust and freshness.
const TREND_TRUST_WEIGHT: f64 = 0.6;
const TREND_FRESHNESS_WEIGHT: f64 = 0.4;

/// What one finished cycle did, mirrored into the `cycle.completed` event.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CycleReport {
    pub(crate) target: u64,
    pub(crate) executed: u64,
    pub(crate) remaining: u64,
    pub(crate) digest_gate: bool,
    pub(crate) cache_hits: u64,
    pub(crate) cache_misses: u64,
}

/// Spawn the scheduler as a supervised background task.
pub(crate) fn start(state: AppState) -> TaskHandle {
    spawn_supervised("scheduler.cycles", move || {
        let state = state.clone();
        async move { run_loop(state).await }
    })
}

/// Cycles never overlap: each pass finishes before its wait begins.
pub(crate) async fn run_loop(state: AppState) {
    loop {
        let report = run_cycle(&state).await;
        let wait = next_wait(state.config(), report.remaining);
        debug!(
            target: "herald::scheduler",
            wait_secs = wait.as_secs(),
            "sleeping until next cycle"
        );
        state.sleeper().sleep(wait).await;
    }
}

/// Inter-cycle wait: a short fixed pause once the quota is met, otherwise a
/// uniform draw over the configured window.
pub(crate) fn next_wait(config: &Config, remaining: u64) -> Duration {
    if remaining == 0 {
        return Duration::from_secs(config.quota_met_wait_minutes * 60);
    }
    let min_secs = config.cycle_min_minutes * 60;
    let max_secs = config.cycle_max_minutes.max(config.cycle_min_minutes) * 60;
    Duration::from_secs(rand::rng().random_range(min_secs..=max_secs))
}

pub(crate) async fn run_cycle(state: &AppState) -> CycleReport {
    let config = state.config();
    let clock = state.clock();
    let memory = state.memory();

    let target = config.daily_target;
    let today = memory.today_activity_count().await;
    let mut remaining = target.saturating_sub(today);

    let policy = state.policy().tune(config, memory, clock.as_ref()).await;

    let mut started = json!({
        "target": target,
        "today": today,
        "remaining": remaining,
        "rationale": policy.rationale,
    });
    responses::attach_corr(&mut started);
    state.bus().publish(topics::TOPIC_CYCLE_STARTED, &started);
    info!(
        target: "herald::scheduler",
        today,
        remaining,
        rationale = %policy.rationale,
        "cycle started"
    );

    if remaining == 0 {
        info!(target: "herald::scheduler", "daily quota already met");
        let report = CycleReport {
            target,
            executed: 0,
            remaining: 0,
            digest_gate: false,
            cache_hits: 0,
            cache_misses: 0,
        };
        finalize_cycle(state, &policy, &report, None).await;
        return report;
    }

    let digest = ingest_digest(state).await;
    let digest_gate = digest.accepted_count == 0;
    if digest_gate {
        info!(
            target: "herald::scheduler",
            intake = digest.intake_count,
            "no accepted signal; proactive posting suppressed this cycle"
        );
    }

    let mut executed: u64 = 0;
    let mut mentions = fetch_mentions(state).await;

    // MentionPass claims at most half the action budget; committed replies
    // run even under the digest gate.
    let mention_cap = (config.max_actions_per_cycle / 2).max(1);
    let mut processed: u64 = 0;
    while processed < mention_cap && executed < config.max_actions_per_cycle && remaining > 0 {
        let Some(mention) = mentions.pop_front() else {
            break;
        };
        processed += 1;
        if actions::attempt_reply(state, &policy, &mention)
            .await
            .executed()
        {
            executed += 1;
            remaining = remaining.saturating_sub(1);
        }
    }

    let mut cache = TrendCache::default();
    if !digest_gate {
        let mut posts_this_cycle: u64 = 0;
        let mut prefer_post = true;
        while executed < config.max_actions_per_cycle && remaining > 0 {
            let acted = if prefer_post {
                try_post(state, &policy, &digest.records, &mut cache, &mut posts_this_cycle).await
                    || try_reply(state, &policy, &mut mentions).await
            } else {
                try_reply(state, &policy, &mut mentions).await
                    || try_post(state, &policy, &digest.records, &mut cache, &mut posts_this_cycle)
                        .await
            };
            if !acted {
                debug!(
                    target: "herald::scheduler",
                    executed,
                    remaining,
                    "no action available; quota carries forward"
                );
                break;
            }
            executed += 1;
            remaining = remaining.saturating_sub(1);
            prefer_post = !prefer_post;
        }
    }

    let report = CycleReport {
        target,
        executed,
        remaining,
        digest_gate,
        cache_hits: cache.hits,
        cache_misses: cache.misses,
    };
    finalize_cycle(state, &policy, &report, Some(&digest)).await;
    report
}

/// Check a read admission and record the read when allowed. A block reads as
/// "no signal this cycle" for the caller.
async fn admit_read(state: &AppState, kind: &str) -> bool {
    let policy = state.config().read_policy(kind);
    let decision = state.budget().check_read_allowance(&policy).await;
    if !decision.allowed {
        let reason = decision
            .block_reason
            .map(|block| block.as_str())
            .unwrap_or("blocked");
        state.metrics().admission_blocked(reason);
        debug!(target: "herald::scheduler", kind, reason, "signal read blocked");
        return false;
    }
    state.budget().record_read(&policy).await;
    true
}

/// Pull nutrients, score them, persist accepted ledger entries, and nudge
/// per-source trust by outcome. Publishes one `digest.ingested` event.
async fn ingest_digest(state: &AppState) -> DigestOutcome {
    let config = state.config();
    let nutrients = if admit_read(state, KIND_SIGNAL_NUTRIENTS).await {
        match state.signals().fetch_nutrients().await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(
                    target: "herald::scheduler",
                    error = %err,
                    "nutrient fetch failed; zero signal this cycle"
                );
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };

    let ledger = state.memory().recent_nutrient_ledger(CONSISTENCY_LOOKBACK).await;
    let now = state.clock().now_utc();
    let outcome = digest_nutrients(
        nutrients,
        &ledger,
        &DigestOptions {
            min_digest_score: config.digest_min_score,
            max_items: config.digest_max_intake,
        },
        now,
    );

    let entries = outcome.ledger_entries(now);
    if !entries.is_empty() {
        state.memory().record_nutrient_batch_intake(entries).await;
    }
    let deltas = trust_deltas(&outcome);
    state.memory().apply_source_trust_deltas(&deltas).await;

    let mut payload = json!({
        "intake": outcome.intake_count,
        "accepted": outcome.accepted_count,
        "avg_digest_score": outcome.avg_digest_score,
        "xp_gain_total": outcome.xp_gain_total,
    });
    responses::attach_corr(&mut payload);
    state.bus().publish(topics::TOPIC_DIGEST_INGESTED, &payload);
    debug!(
        target: "herald::scheduler",
        intake = outcome.intake_count,
        accepted = outcome.accepted_count,
        "digest pass finished"
    );
    outcome
}

fn trust_deltas(outcome: &DigestOutcome) -> BTreeMap<String, f64> {
    let mut deltas: BTreeMap<String, f64> = BTreeMap::new();
    for record in &outcome.records {
        let delta = if record.accepted {
            TRUST_DELTA_ACCEPTED
        } else {
            TRUST_DELTA_REJECTED
        };
        *deltas
            .entry(record.nutrient.source.as_str().to_string())
            .or_insert(0.0) += delta;
    }
    deltas
}

async fn fetch_mentions(state: &AppState) -> VecDeque<PendingMention> {
    if !admit_read(state, KIND_SIGNAL_MENTIONS).await {
        return VecDeque::new();
    }
    match state.signals().pending_mentions().await {
        Ok(batch) => batch.into(),
        Err(err) => {
            warn!(
                target: "herald::scheduler",
                error = %err,
                "mention fetch failed; treating as none pending"
            );
            VecDeque::new()
        }
    }
}

/// Cycle-scoped trend context memo keyed by the market regime fingerprint.
/// The news pass reruns only when the regime moves mid-cycle; the cache dies
/// with the cycle.
#[derive(Default)]
struct TrendCache {
    slot: Option<TrendContext>,
    last_snapshot: MarketSnapshot,
    hits: u64,
    misses: u64,
}

async fn refresh_trend_context(
    state: &AppState,
    policy: &AdaptivePolicy,
    records: &[ScoredNutrient],
    cache: &mut TrendCache,
) {
    let snapshot = if admit_read(state, KIND_SIGNAL_MARKET).await {
        match state.signals().market_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    target: "herald::scheduler",
                    error = %err,
                    "market snapshot failed; keeping last regime"
                );
                cache.last_snapshot.clone()
            }
        }
    } else {
        cache.last_snapshot.clone()
    };

    let fingerprint = snapshot.fingerprint();
    let stale = cache
        .slot
        .as_ref()
        .map(|context| context.fingerprint != fingerprint)
        .unwrap_or(true);
    if !stale {
        cache.hits += 1;
        cache.last_snapshot = snapshot;
        return;
    }

    cache.misses += 1;
    let rows = if admit_read(state, KIND_SIGNAL_NEWS).await {
        match state.signals().fetch_news().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(
                    target: "herald::scheduler",
                    error = %err,
                    "news fetch failed; zero signal this pass"
                );
                Vec::new()
            }
        }
    } else {
        Vec::new()
    };
    let events = build_trend_events(&rows, state.clock().now_utc());
    let events = qualify_events(state, policy, events).await;
    let evidence = build_onchain_evidence(records, EVIDENCE_POOL);
    debug!(
        target: "herald::scheduler",
        events = events.len(),
        evidence = evidence.len(),
        fingerprint = %fingerprint,
        "trend context rebuilt"
    );
    cache.last_snapshot = snapshot.clone();
    cache.slot = Some(TrendContext {
        events,
        evidence,
        snapshot,
        fingerprint,
    });
}

/// Hold fresh events to the tuned discovery minimums. Provider trust and the
/// learned per-source score each get a vote before the thresholds apply.
async fn qualify_events(
    state: &AppState,
    policy: &AdaptivePolicy,
    events: Vec<TrendEvent>,
) -> Vec<TrendEvent> {
    let memory = state.memory();
    let mut kept = Vec::with_capacity(events.len());
    for mut event in events {
        let learned = memory.source_trust(&event.source).await;
        event.trust = ((event.trust + learned) / 2.0).clamp(0.0, 1.0);
        if event.trust < policy.min_source_trust {
            debug!(
                target: "herald::scheduler",
                source = %event.source,
                trust = event.trust,
                "event dropped: source trust below minimum"
            );
            continue;
        }
        if event
            .engagement
            .map(|value| value < policy.min_trend_engagement)
            .unwrap_or(false)
        {
            debug!(
                target: "herald::scheduler",
                headline = %event.headline,
                "event dropped: engagement below minimum"
            );
            continue;
        }
        let score = TREND_TRUST_WEIGHT * event.trust + TREND_FRESHNESS_WEIGHT * event.freshness;
        if score < policy.min_trend_score {
            debug!(
                target: "herald::scheduler",
                headline = %event.headline,
                score,
                "event dropped: trend score below minimum"
            );
            continue;
        }
        kept.push(event);
    }
    kept
}

async fn try_post(
    state: &AppState,
    policy: &AdaptivePolicy,
    records: &[ScoredNutrient],
    cache: &mut TrendCache,
    posts_this_cycle: &mut u64,
) -> bool {
    let config = state.config();
    if *posts_this_cycle >= config.max_posts_per_cycle {
        debug!(
            target: "herald::scheduler",
            cap = config.max_posts_per_cycle,
            "post cap for this cycle reached"
        );
        return false;
    }

    // Content pacing rides the ledger's per-kind interval tracking; a check
    // leaves no record, so probing here never moves the ledger itself.
    let mut gap_policy = config.create_policy(actions::KIND_POST_CREATE);
    gap_policy.min_interval_minutes = config.min_post_gap_minutes;
    let gap = state.budget().check_create_allowance(&gap_policy).await;
    if !gap.allowed {
        debug!(
            target: "herald::scheduler",
            wait_seconds = gap.wait_seconds.unwrap_or(0),
            "post unavailable: inter-post gap or budget"
        );
        return false;
    }

    refresh_trend_context(state, policy, records, cache).await;
    let Some(context) = cache.slot.as_ref() else {
        return false;
    };
    let executed = actions::attempt_post(state, policy, context).await.executed();
    if executed {
        *posts_this_cycle += 1;
    }
    executed
}

async fn try_reply(
    state: &AppState,
    policy: &AdaptivePolicy,
    mentions: &mut VecDeque<PendingMention>,
) -> bool {
    let Some(mention) = mentions.pop_front() else {
        debug!(target: "herald::scheduler", "no pending mention to reply to");
        return false;
    };
    actions::attempt_reply(state, policy, &mention)
        .await
        .executed()
}

/// Publish the one-per-cycle summary and commit the telemetry store.
async fn finalize_cycle(
    state: &AppState,
    policy: &AdaptivePolicy,
    report: &CycleReport,
    digest: Option<&DigestOutcome>,
) {
    let config = state.config();
    let usage = state.budget().today_usage(&config.timezone_offset).await;
    let lanes = state.memory().lane_usage(LANE_USAGE_WINDOW).await;

    let mut payload = json!({
        "target": report.target,
        "executed": report.executed,
        "remaining": report.remaining,
        "digest": {
            "intake": digest.map(|outcome| outcome.intake_count).unwrap_or(0),
            "accepted": digest.map(|outcome| outcome.accepted_count).unwrap_or(0),
            "gate": report.digest_gate,
        },
        "cache": {
            "hits": report.cache_hits,
            "misses": report.cache_misses,
        },
    });
    if let Ok(snapshot) = serde_json::to_value(policy) {
        payload["policy"] = snapshot;
    }
    if let Ok(snapshot) = serde_json::to_value(&usage) {
        payload["budget"] = snapshot;
    }
    if let Ok(snapshot) = serde_json::to_value(&lanes) {
        payload["lanes"] = snapshot;
    }
    responses::attach_corr(&mut payload);
    state.bus().publish(topics::TOPIC_CYCLE_COMPLETED, &payload);
    state.metrics().cycle_completed();
    state.memory().flush().await;
    info!(
        target: "herald::scheduler",
        executed = report.executed,
        remaining = report.remaining,
        cache_hits = report.cache_hits,
        cache_misses = report.cache_misses,
        "cycle completed"
    );
}

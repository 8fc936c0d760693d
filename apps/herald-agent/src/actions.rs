//! Post and reply actions: plan, generate, gate, govern, admit, dispatch.
//!
//! Every rejection along the way is a value that feeds metrics and the
//! policy tuner; only collaborator faults are logged as errors, and none of
//! them escape the action.

use herald_heuristics::AdaptivePolicy;
use herald_topics as topics;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::autonomy::{evaluate_autonomy_governor, AutonomyDecision, GovernLevel, GovernorInput};
use crate::connectors::{DispatchKind, PendingMention, PromptContext};
use crate::market::MarketSnapshot;
use crate::memory::PostGenerationOutcome;
use crate::narrative::{
    build_banned_openers, build_narrative_plan, pick_narrative_mode, validate_narrative_novelty,
    NarrativePlan,
};
use crate::planner::{plan_event_evidence_act, validate_event_evidence_contract, EventEvidencePlan};
use crate::quality;
use crate::responses;
use crate::trend::{OnchainEvidence, TrendEvent};

pub(crate) const KIND_POST_CREATE: &str = "post.create";
pub(crate) const KIND_REPLY_CREATE: &str = "reply.create";

/// Posts considered for lane-usage ratios and narrative rotation.
const RECENT_POST_WINDOW: usize = 20;
/// Replies can be short; posts use the configured minimum.
const REPLY_MIN_CHARS: usize = 12;

/// Everything the planner needs for one cycle, built once per market regime.
pub(crate) struct TrendContext {
    pub events: Vec<TrendEvent>,
    pub evidence: Vec<OnchainEvidence>,
    pub snapshot: MarketSnapshot,
    pub fingerprint: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ActionOutcome {
    Executed,
    /// Nothing actionable: no plan, no candidate surviving the gates, or no
    /// pending work.
    NoCandidate,
    /// Governor or admission said no.
    Blocked,
    /// Dispatch itself failed.
    Failed,
}

impl ActionOutcome {
    pub(crate) fn executed(&self) -> bool {
        matches!(self, ActionOutcome::Executed)
    }
}

pub(crate) async fn attempt_post(
    state: &AppState,
    policy: &AdaptivePolicy,
    trend: &TrendContext,
) -> ActionOutcome {
    let config = state.config();
    let memory = state.memory();
    let metrics = state.metrics();

    let lane_usage = memory.lane_usage(RECENT_POST_WINDOW).await;
    let recent_texts = memory.recent_own_texts(RECENT_POST_WINDOW).await;
    let records = memory.recent_posts(RECENT_POST_WINDOW).await;

    let Some(plan) =
        plan_event_evidence_act(&trend.events, &trend.evidence, &recent_texts, &lane_usage)
    else {
        debug!(target: "herald::actions", "no event with two usable evidence items");
        return ActionOutcome::NoCandidate;
    };
    let mode = pick_narrative_mode(plan.lane, &records);
    let banned = build_banned_openers(&recent_texts);
    let narrative = build_narrative_plan(plan.lane, mode, banned);

    let mut retries: u64 = 0;
    let mut fail_reasons: Vec<String> = Vec::new();
    let mut fallback_used = false;
    let mut accepted: Option<String> = None;

    let mut context = PromptContext::for_post(
        plan.event.clone(),
        plan.evidence.clone(),
        narrative.clone(),
        trend.fingerprint.clone(),
    );
    let max_attempts = config.max_generation_attempts.max(1);
    for attempt in 1..=max_attempts {
        context.attempt = attempt;
        let candidate = match state.generator().generate(&context).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                retries += 1;
                fail_reasons.push("no-candidate".to_string());
                continue;
            }
            Err(err) => {
                warn!(target: "herald::actions", error = %err, attempt, "generator fault");
                retries += 1;
                fail_reasons.push("generator-error".to_string());
                continue;
            }
        };
        match gate_post_candidate(
            &candidate,
            config.min_candidate_chars,
            policy,
            &plan,
            &narrative,
            &recent_texts,
            &trend.snapshot,
        ) {
            Ok(text) => {
                accepted = Some(text);
                break;
            }
            Err(reason) => {
                debug!(target: "herald::actions", reason = %reason, attempt, "candidate rejected");
                metrics.gate_rejected(&reason);
                fail_reasons.push(reason);
                retries += 1;
            }
        }
    }

    if accepted.is_none() {
        let template = build_fallback_post(&plan, &narrative);
        match gate_post_candidate(
            &template,
            config.min_candidate_chars,
            policy,
            &plan,
            &narrative,
            &recent_texts,
            &trend.snapshot,
        ) {
            Ok(text) => {
                fallback_used = true;
                accepted = Some(text);
            }
            Err(reason) => {
                metrics.gate_rejected(&reason);
                fail_reasons.push(reason);
            }
        }
    }

    let Some(text) = accepted else {
        memory
            .record_post_generation(&PostGenerationOutcome {
                success: false,
                retries,
                fallback_used: false,
                fail_reasons,
            })
            .await;
        return ActionOutcome::NoCandidate;
    };

    let decision = govern_candidate(state, DispatchKind::Post, &text, Some(&plan)).await;
    if !decision.allow {
        for reason in &decision.reasons {
            metrics.governor_blocked(reason);
        }
        fail_reasons.extend(decision.reasons.iter().cloned());
        memory
            .record_post_generation(&PostGenerationOutcome {
                success: false,
                retries,
                fallback_used,
                fail_reasons,
            })
            .await;
        return ActionOutcome::Blocked;
    }

    let create_policy = config.create_policy(KIND_POST_CREATE);
    let admission = state.budget().check_create_allowance(&create_policy).await;
    if !admission.allowed {
        let reason = admission
            .block_reason
            .map(|block| block.as_str())
            .unwrap_or("blocked");
        metrics.admission_blocked(reason);
        fail_reasons.push(reason.to_string());
        memory
            .record_post_generation(&PostGenerationOutcome {
                success: false,
                retries,
                fallback_used,
                fail_reasons,
            })
            .await;
        debug!(target: "herald::actions", reason, "post admission blocked");
        return ActionOutcome::Blocked;
    }

    // The platform call is about to happen; it draws down the budget whether
    // or not it succeeds.
    state.budget().record_create(&create_policy).await;
    match state.dispatcher().dispatch(DispatchKind::Post, &text).await {
        Ok(receipt) => {
            memory.record_own_post(text.clone(), plan.lane, Some(mode)).await;
            memory.record_activity().await;
            memory
                .record_post_generation(&PostGenerationOutcome {
                    success: true,
                    retries,
                    fallback_used,
                    fail_reasons,
                })
                .await;
            metrics.dispatch_completed(DispatchKind::Post.as_str());
            let mut payload = json!({
                "kind": DispatchKind::Post.as_str(),
                "lane": plan.lane.as_str(),
                "mode": mode.as_str(),
                "receipt_id": receipt.id,
                "dry_run": receipt.dry_run,
                "chars": text.chars().count(),
                "fallback": fallback_used,
            });
            responses::attach_corr(&mut payload);
            state.bus().publish(topics::TOPIC_DISPATCH_COMPLETED, &payload);
            info!(
                target: "herald::actions",
                lane = plan.lane.as_str(),
                mode = mode.as_str(),
                fallback = fallback_used,
                "post dispatched"
            );
            ActionOutcome::Executed
        }
        Err(err) => {
            warn!(target: "herald::actions", error = %err, "post dispatch failed");
            metrics.dispatch_failed();
            fail_reasons.push("dispatch-failed".to_string());
            memory
                .record_post_generation(&PostGenerationOutcome {
                    success: false,
                    retries,
                    fallback_used,
                    fail_reasons,
                })
                .await;
            let payload = json!({
                "kind": DispatchKind::Post.as_str(),
                "error": err.to_string(),
            });
            state.bus().publish(topics::TOPIC_DISPATCH_REJECTED, &payload);
            ActionOutcome::Failed
        }
    }
}

pub(crate) async fn attempt_reply(
    state: &AppState,
    policy: &AdaptivePolicy,
    mention: &PendingMention,
) -> ActionOutcome {
    let config = state.config();
    let metrics = state.metrics();
    let recent_texts = state.memory().recent_own_texts(RECENT_POST_WINDOW).await;

    let mut context = PromptContext::for_reply(mention.clone());
    let mut accepted: Option<String> = None;
    let max_attempts = config.max_generation_attempts.max(1);
    for attempt in 1..=max_attempts {
        context.attempt = attempt;
        let candidate = match state.generator().generate(&context).await {
            Ok(Some(text)) => text,
            Ok(None) => continue,
            Err(err) => {
                warn!(target: "herald::actions", error = %err, attempt, "reply generator fault");
                continue;
            }
        };
        match gate_reply_candidate(&candidate, policy, &recent_texts, mention) {
            Ok(text) => {
                accepted = Some(text);
                break;
            }
            Err(reason) => {
                debug!(target: "herald::actions", reason = %reason, "reply candidate rejected");
                metrics.gate_rejected(&reason);
            }
        }
    }
    // No fallback template for replies; silence beats a canned answer in a
    // conversation.
    let Some(text) = accepted else {
        return ActionOutcome::NoCandidate;
    };

    let decision = govern_candidate(state, DispatchKind::Reply, &text, None).await;
    if !decision.allow {
        for reason in &decision.reasons {
            metrics.governor_blocked(reason);
        }
        return ActionOutcome::Blocked;
    }

    let create_policy = config.create_policy(KIND_REPLY_CREATE);
    let admission = state.budget().check_create_allowance(&create_policy).await;
    if !admission.allowed {
        let reason = admission
            .block_reason
            .map(|block| block.as_str())
            .unwrap_or("blocked");
        metrics.admission_blocked(reason);
        debug!(target: "herald::actions", reason, "reply admission blocked");
        return ActionOutcome::Blocked;
    }

    state.budget().record_create(&create_policy).await;
    match state.dispatcher().dispatch(DispatchKind::Reply, &text).await {
        Ok(receipt) => {
            state.memory().record_activity().await;
            metrics.dispatch_completed(DispatchKind::Reply.as_str());
            let mut payload = json!({
                "kind": DispatchKind::Reply.as_str(),
                "mention_id": mention.id,
                "receipt_id": receipt.id,
                "dry_run": receipt.dry_run,
            });
            responses::attach_corr(&mut payload);
            state.bus().publish(topics::TOPIC_DISPATCH_COMPLETED, &payload);
            info!(target: "herald::actions", mention = %mention.id, "reply dispatched");
            ActionOutcome::Executed
        }
        Err(err) => {
            warn!(target: "herald::actions", error = %err, "reply dispatch failed");
            metrics.dispatch_failed();
            let payload = json!({
                "kind": DispatchKind::Reply.as_str(),
                "error": err.to_string(),
            });
            state.bus().publish(topics::TOPIC_DISPATCH_REJECTED, &payload);
            ActionOutcome::Failed
        }
    }
}

/// Run the autonomy governor for a candidate and publish the decision.
/// Replies carry no evidence plan, so the evidence mandates read as
/// satisfied for them.
async fn govern_candidate(
    state: &AppState,
    kind: DispatchKind,
    text: &str,
    plan: Option<&EventEvidencePlan>,
) -> AutonomyDecision {
    let config = state.config();
    let usage = state.budget().today_usage(&config.timezone_offset).await;
    let (headline, summary) = plan
        .map(|plan| (plan.event.headline.as_str(), plan.event.summary.as_str()))
        .unwrap_or(("", ""));
    let decision = evaluate_autonomy_governor(&GovernorInput {
        candidate_text: text,
        event_headline: headline,
        trend_summary: summary,
        current_cost_usd: usage.est_total_cost_usd,
        one_create_cost_usd: config.create_cost_usd,
        daily_max_usd: config.budget_daily_max_usd,
        budget_ceiling_ratio: config.budget_ceiling_ratio,
        has_onchain_evidence: plan.map(|plan| plan.has_onchain_evidence()).unwrap_or(true),
        evidence_source_diversity: plan
            .map(|plan| plan.evidence_source_diversity())
            .unwrap_or(2),
        mandate_onchain_evidence: config.mandate_onchain_evidence,
        mandate_cross_source: config.mandate_cross_source,
        enforce_korean: config.enforce_korean_posts,
        risk_threshold: config.risk_threshold,
    });
    if decision.level == GovernLevel::Warn {
        warn!(
            target: "herald::actions",
            kind = kind.as_str(),
            reasons = ?decision.reasons,
            "governor warning"
        );
    }
    let mut payload = json!({
        "kind": kind.as_str(),
        "level": decision.level.as_str(),
        "reasons": decision.reasons,
        "diagnostics": decision.diagnostics,
    });
    responses::attach_corr(&mut payload);
    state.bus().publish(topics::TOPIC_AUTONOMY_DECIDED, &payload);
    decision
}

fn gate_post_candidate(
    candidate: &str,
    min_chars: usize,
    policy: &AdaptivePolicy,
    plan: &EventEvidencePlan,
    narrative: &NarrativePlan,
    recent_texts: &[String],
    snapshot: &MarketSnapshot,
) -> Result<String, String> {
    let text = quality::sanitize(candidate);
    if text.chars().count() < min_chars {
        return Err("candidate-too-short".to_string());
    }
    let duplicate = quality::check_duplicate(&text, recent_texts, policy.post_duplicate_threshold);
    if duplicate.is_duplicate {
        return Err("duplicate-content".to_string());
    }
    let novelty = validate_narrative_novelty(&text, recent_texts, narrative);
    if !novelty.ok {
        return Err(novelty.reason.unwrap_or("narrative-novelty").to_string());
    }
    let skeleton =
        quality::find_narrative_duplicate(&text, recent_texts, policy.post_narrative_threshold);
    if skeleton.is_duplicate {
        return Err("narrative-duplicate".to_string());
    }
    let market = quality::validate_market_consistency(&text, snapshot);
    if !market.ok {
        return Err(market.reason.unwrap_or("market-price-mismatch").to_string());
    }
    let contract = validate_event_evidence_contract(&text, plan);
    if !contract.ok {
        return Err(contract.reason.unwrap_or("evidence-anchor-missing").to_string());
    }
    Ok(text)
}

fn gate_reply_candidate(
    candidate: &str,
    policy: &AdaptivePolicy,
    recent_texts: &[String],
    mention: &PendingMention,
) -> Result<String, String> {
    let text = quality::sanitize(candidate);
    if text.chars().count() < REPLY_MIN_CHARS {
        return Err("candidate-too-short".to_string());
    }
    // Replying with the mention's own words back is the cheapest failure mode.
    let echo = quality::check_duplicate(
        &text,
        std::slice::from_ref(&mention.text),
        policy.reply_duplicate_threshold,
    );
    if echo.is_duplicate {
        return Err("duplicate-content".to_string());
    }
    let duplicate = quality::check_duplicate(&text, recent_texts, policy.reply_duplicate_threshold);
    if duplicate.is_duplicate {
        return Err("duplicate-content".to_string());
    }
    let skeleton =
        quality::find_narrative_duplicate(&text, recent_texts, policy.reply_narrative_threshold);
    if skeleton.is_duplicate {
        return Err("narrative-duplicate".to_string());
    }
    Ok(text)
}

/// Deterministic template used after generation attempts are exhausted. It
/// quotes the headline and both evidence anchors so the evidence contract
/// holds by construction.
pub(crate) fn build_fallback_post(plan: &EventEvidencePlan, narrative: &NarrativePlan) -> String {
    let mut lines = Vec::with_capacity(4);
    lines.push(format!("{} {}", narrative.opening_directive, plan.event.headline));
    lines.push("근거는 두 가지다.".to_string());
    for (index, item) in plan.evidence.iter().enumerate() {
        let marker = if index == 0 { "첫째" } else { "둘째" };
        lines.push(format!("{marker}, {} {}.", item.label, item.value));
    }
    lines.push("수치가 말하는 방향을 이어서 확인한다.".to_string());
    lines.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::AppState;
    use crate::budget::BudgetLedger;
    use crate::config::Config;
    use crate::digest::NutrientSource;
    use crate::memory::MemoryService;
    use crate::test_support::clock::ManualClock;
    use crate::test_support::fakes::{RecordingDispatch, ScriptedGenerator, ScriptedSignals};
    use crate::trend::{build_trend_events, Lane, LaneUsage, NewsRow};
    use chrono::{TimeZone, Utc};
    use herald_events::Bus;
    use herald_heuristics::{evaluate, PolicyBaseline, PolicyFeatures};
    use std::sync::Arc;

    fn neutral_policy() -> AdaptivePolicy {
        evaluate(
            &PolicyBaseline::default(),
            &PolicyFeatures {
                progress_ratio: 0.8,
                ..PolicyFeatures::default()
            },
        )
    }

    struct Rig {
        state: AppState,
        generator: Arc<ScriptedGenerator>,
        dispatcher: Arc<RecordingDispatch>,
    }

    async fn rig_with_config(config: Config) -> Rig {
        let bus = Bus::new_with_replay(16, 16);
        let clock = ManualClock::at(
            Utc.with_ymd_and_hms(2025, 11, 3, 4, 0, 0).single().expect("ts"),
        );
        let generator = ScriptedGenerator::new();
        let dispatcher = RecordingDispatch::new();
        let state = AppState::builder(bus.clone(), config)
            .with_clock(clock.clone())
            .with_budget(BudgetLedger::new(bus.clone(), clock.clone()))
            .with_memory(MemoryService::new(bus.clone(), clock.clone(), "+09:00"))
            .with_signals(ScriptedSignals::new())
            .with_generator(generator.clone())
            .with_dispatcher(dispatcher.clone())
            .build()
            .await;
        Rig {
            state,
            generator,
            dispatcher,
        }
    }

    async fn rig() -> Rig {
        rig_with_config(Config::default()).await
    }

    fn evidence_item(
        id: &str,
        lane: Lane,
        source: NutrientSource,
        label: &str,
        value: &str,
    ) -> OnchainEvidence {
        OnchainEvidence {
            id: id.to_string(),
            lane,
            nutrient_id: format!("n-{id}"),
            source,
            label: label.to_string(),
            value: value.to_string(),
            summary: format!("{label} {value}"),
            trust: 0.85,
            freshness: 0.9,
            digest_score: Some(0.8),
            captured_at: Utc.with_ymd_and_hms(2025, 11, 3, 3, 0, 0).single().expect("ts"),
        }
    }

    fn korean_trend_context() -> TrendContext {
        let captured = Utc.with_ymd_and_hms(2025, 11, 3, 3, 30, 0).single().expect("ts");
        let events = build_trend_events(
            &[NewsRow {
                headline: "거래소 보유량 감소 지속".to_string(),
                summary: "온체인 순유출 확대".to_string(),
                source: "coindesk".to_string(),
                trust: 0.9,
                engagement: Some(220.0),
            }],
            captured,
        );
        let evidence = vec![
            evidence_item("e1", Lane::Onchain, NutrientSource::Onchain, "netflow", "-4200 BTC"),
            evidence_item("e2", Lane::Onchain, NutrientSource::Market, "reserves", "2.31M BTC"),
        ];
        TrendContext {
            events,
            evidence,
            snapshot: MarketSnapshot::default(),
            fingerprint: MarketSnapshot::default().fingerprint(),
        }
    }

    fn english_trend_context() -> TrendContext {
        let captured = Utc.with_ymd_and_hms(2025, 11, 3, 3, 30, 0).single().expect("ts");
        let events = build_trend_events(
            &[NewsRow {
                headline: "Exchange reserves drop accelerates".to_string(),
                summary: "outflows continue".to_string(),
                source: "coindesk".to_string(),
                trust: 0.9,
                engagement: Some(220.0),
            }],
            captured,
        );
        let evidence = vec![
            evidence_item("e1", Lane::Onchain, NutrientSource::Onchain, "netflow", "-4200 BTC"),
            evidence_item("e2", Lane::Onchain, NutrientSource::Market, "reserves", "2.31M BTC"),
        ];
        TrendContext {
            events,
            evidence,
            snapshot: MarketSnapshot::default(),
            fingerprint: MarketSnapshot::default().fingerprint(),
        }
    }

    const GOOD_KOREAN_CANDIDATE: &str = "거래소 보유량 감소가 이어진다. netflow -4200 BTC 흐름에 reserves 2.31M BTC 수치까지 내려왔다. 추세 확인이 먼저다.";

    #[tokio::test]
    async fn post_happy_path_dispatches_and_records() {
        let rig = rig().await;
        rig.generator.push(Some(GOOD_KOREAN_CANDIDATE));
        let trend = korean_trend_context();

        let outcome = attempt_post(&rig.state, &neutral_policy(), &trend).await;
        assert_eq!(outcome, ActionOutcome::Executed);

        let sent = rig.dispatcher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, DispatchKind::Post);

        assert_eq!(rig.state.memory().today_activity_count().await, 1);
        let posts = rig.state.memory().recent_posts(5).await;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].lane, Lane::Onchain);

        let metrics = rig.state.memory().today_post_generation_metrics().await;
        assert_eq!(metrics.post_runs, 1);
        assert_eq!(metrics.post_successes, 1);
        assert_eq!(metrics.total_retries, 0);

        let usage = rig.state.budget().today_usage("+09:00").await;
        assert_eq!(usage.create_requests, 1);
        assert_eq!(usage.counts_by_kind.get(KIND_POST_CREATE), Some(&1));
    }

    #[tokio::test]
    async fn exhausted_generation_falls_back_to_template() {
        let rig = rig().await;
        // Generator never produces anything; the queue stays empty.
        let trend = korean_trend_context();

        let outcome = attempt_post(&rig.state, &neutral_policy(), &trend).await;
        assert_eq!(outcome, ActionOutcome::Executed);
        assert_eq!(rig.generator.calls(), 3);

        let sent = rig.dispatcher.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("netflow -4200 BTC"));
        assert!(sent[0].1.contains("reserves 2.31M BTC"));
        assert!(sent[0].1.contains("거래소 보유량 감소 지속"));

        let metrics = rig.state.memory().today_post_generation_metrics().await;
        assert_eq!(metrics.fallback_used, 1);
        assert_eq!(metrics.total_retries, 3);
        assert_eq!(metrics.fail_reasons.get("no-candidate"), Some(&3));
    }

    #[tokio::test]
    async fn english_candidate_is_governor_blocked() {
        let rig = rig().await;
        rig.generator.push(Some(
            "Exchange reserves drop is accelerating. netflow -4200 BTC and reserves 2.31M BTC confirm the trend.",
        ));
        // The template would also be English-anchored, so the run ends blocked
        // rather than falling back to a passing Korean post.
        let trend = english_trend_context();

        let outcome = attempt_post(&rig.state, &neutral_policy(), &trend).await;
        assert_eq!(outcome, ActionOutcome::Blocked);
        assert!(rig.dispatcher.sent().is_empty());

        let summary = rig.state.metrics().summary();
        assert_eq!(
            summary.engine.governor_blocks.get("post_language_not_korean"),
            Some(&1)
        );
        let metrics = rig.state.memory().today_post_generation_metrics().await;
        assert_eq!(metrics.post_failures, 1);
        assert!(metrics.fail_reasons.contains_key("post_language_not_korean"));
        assert_eq!(rig.state.budget().today_usage("+09:00").await.create_requests, 0);
    }

    #[tokio::test]
    async fn admission_block_stops_before_dispatch() {
        let mut config = Config::default();
        config.create_daily_limit = 1;
        let rig = rig_with_config(config).await;
        // Spend the day's single create on a reply kind; the post kind then
        // carries no pacing stamp and the class cap is what blocks.
        let reply_create = rig.state.config().create_policy(KIND_REPLY_CREATE);
        rig.state.budget().record_create(&reply_create).await;
        rig.generator.push(Some(GOOD_KOREAN_CANDIDATE));
        let trend = korean_trend_context();

        let outcome = attempt_post(&rig.state, &neutral_policy(), &trend).await;
        assert_eq!(outcome, ActionOutcome::Blocked);
        assert!(rig.dispatcher.sent().is_empty());
        let summary = rig.state.metrics().summary();
        assert_eq!(
            summary.engine.admission_blocks.get("daily-request-limit"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn no_plan_means_no_candidate() {
        let rig = rig().await;
        let trend = TrendContext {
            events: Vec::new(),
            evidence: Vec::new(),
            snapshot: MarketSnapshot::default(),
            fingerprint: MarketSnapshot::default().fingerprint(),
        };
        let outcome = attempt_post(&rig.state, &neutral_policy(), &trend).await;
        assert_eq!(outcome, ActionOutcome::NoCandidate);
        assert_eq!(rig.generator.calls(), 0);
    }

    #[tokio::test]
    async fn reply_happy_path_counts_activity_but_not_posts() {
        let rig = rig().await;
        rig.generator
            .push(Some("좋은 지적이다. 데이터 기준으로는 순유출 흐름이 아직 이어지고 있다."));
        let mention = PendingMention {
            id: "m1".to_string(),
            author: "reader".to_string(),
            text: "보유량 감소가 정말 의미 있는 신호인가요?".to_string(),
            captured_at: Utc.with_ymd_and_hms(2025, 11, 3, 3, 0, 0).single().expect("ts"),
        };

        let outcome = attempt_reply(&rig.state, &neutral_policy(), &mention).await;
        assert_eq!(outcome, ActionOutcome::Executed);

        let sent = rig.dispatcher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, DispatchKind::Reply);
        assert_eq!(rig.state.memory().today_activity_count().await, 1);
        assert!(rig.state.memory().recent_posts(5).await.is_empty());
        let usage = rig.state.budget().today_usage("+09:00").await;
        assert_eq!(usage.counts_by_kind.get(KIND_REPLY_CREATE), Some(&1));
    }

    #[tokio::test]
    async fn reply_without_candidate_is_skipped_silently() {
        let rig = rig().await;
        let mention = PendingMention {
            id: "m2".to_string(),
            author: "reader".to_string(),
            text: "의견이 궁금합니다".to_string(),
            captured_at: Utc.with_ymd_and_hms(2025, 11, 3, 3, 0, 0).single().expect("ts"),
        };
        let outcome = attempt_reply(&rig.state, &neutral_policy(), &mention).await;
        assert_eq!(outcome, ActionOutcome::NoCandidate);
        assert!(rig.dispatcher.sent().is_empty());
        assert_eq!(rig.state.memory().today_activity_count().await, 0);
    }

    #[tokio::test]
    async fn dispatch_failure_still_draws_down_budget() {
        let rig = rig().await;
        rig.generator.push(Some(GOOD_KOREAN_CANDIDATE));
        rig.dispatcher.fail_next();
        let trend = korean_trend_context();

        let outcome = attempt_post(&rig.state, &neutral_policy(), &trend).await;
        assert_eq!(outcome, ActionOutcome::Failed);
        assert!(rig.dispatcher.sent().is_empty());
        let usage = rig.state.budget().today_usage("+09:00").await;
        assert_eq!(usage.create_requests, 1);
        let metrics = rig.state.memory().today_post_generation_metrics().await;
        assert_eq!(metrics.post_failures, 1);
        assert!(metrics.fail_reasons.contains_key("dispatch-failed"));
        assert_eq!(rig.state.memory().today_activity_count().await, 0);
    }

    #[test]
    fn fallback_template_carries_both_anchors() {
        let captured = Utc.with_ymd_and_hms(2025, 11, 3, 3, 30, 0).single().expect("ts");
        let events = build_trend_events(
            &[NewsRow {
                headline: "거래소 보유량 감소 지속".to_string(),
                summary: "온체인 순유출 확대".to_string(),
                source: "coindesk".to_string(),
                trust: 0.9,
                engagement: None,
            }],
            captured,
        );
        let evidence = vec![
            evidence_item("e1", Lane::Onchain, NutrientSource::Onchain, "netflow", "-4200 BTC"),
            evidence_item("e2", Lane::Onchain, NutrientSource::Market, "reserves", "2.31M BTC"),
        ];
        let usage = LaneUsage::default();
        let plan = plan_event_evidence_act(&events, &evidence, &[], &usage).expect("plan");
        let narrative = build_narrative_plan(
            plan.lane,
            crate::narrative::NarrativeMode::DataBrief,
            Vec::new(),
        );
        let text = build_fallback_post(&plan, &narrative);
        let verdict = validate_event_evidence_contract(&text, &plan);
        assert!(verdict.ok, "fallback must satisfy the contract: {:?}", verdict.reason);
        assert!(text.contains("첫째"));
        assert!(text.contains("둘째"));
    }
}

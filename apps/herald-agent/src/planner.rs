//! Event/evidence planning for a post attempt.
//!
//! Scores candidate trend events against recent own output and lane usage,
//! attaches exactly two evidence items, and validates that generated text
//! actually anchors the plan. A lane over its usage cap is penalized in the
//! score, never filtered outright: the best non-limited event wins, and only
//! when every candidate is limited does the best limited one go through.

use serde::Serialize;

use crate::quality::{self, GateVerdict};
use crate::trend::{Lane, LaneUsage, OnchainEvidence, TrendEvent};

/// Every plan carries exactly this many evidence items.
pub const EVIDENCE_REQUIRED: usize = 2;
/// Novelty is judged against this many recent own posts.
const NOVELTY_WINDOW: usize = 16;
const NOVELTY_REPEAT: f64 = 0.2;
const NOVELTY_OVERLAP: f64 = 0.45;
const NOVELTY_FRESH: f64 = 0.82;
const NOVELTY_DEFAULT: f64 = 0.4;

const W_TRUST: f64 = 0.42;
const W_FRESHNESS: f64 = 0.20;
const W_NOVELTY: f64 = 0.22;
const W_EVIDENCE: f64 = 0.16;
const W_OVERUSE: f64 = 0.35;

#[derive(Clone, Debug, Serialize)]
pub struct EventEvidencePlan {
    pub lane: Lane,
    pub event: TrendEvent,
    pub evidence: Vec<OnchainEvidence>,
    pub lane_usage: LaneUsage,
    pub lane_projected_ratio: f64,
    pub lane_quota_limited: bool,
    pub score: f64,
}

impl EventEvidencePlan {
    /// Count of distinct evidence sources, for the governor's diversity rule.
    pub fn evidence_source_diversity(&self) -> usize {
        let mut sources: Vec<&'static str> = self
            .evidence
            .iter()
            .map(|item| item.source.as_str())
            .collect();
        sources.sort_unstable();
        sources.dedup();
        sources.len()
    }

    pub fn has_onchain_evidence(&self) -> bool {
        self.evidence
            .iter()
            .any(|item| item.source == crate::digest::NutrientSource::Onchain)
    }
}

/// Picks the event to post about, or `None` when no event can be backed by
/// two evidence items. Posting requires a plan; there is no eventless post.
pub fn plan_event_evidence_act(
    events: &[TrendEvent],
    evidence: &[OnchainEvidence],
    recent_posts: &[String],
    lane_usage: &LaneUsage,
) -> Option<EventEvidencePlan> {
    let mut best_clear: Option<EventEvidencePlan> = None;
    let mut best_limited: Option<EventEvidencePlan> = None;

    for event in events {
        let picked = select_evidence(event.lane, evidence);
        if picked.len() < EVIDENCE_REQUIRED {
            continue;
        }
        let novelty = headline_novelty(&event.headline, recent_posts);
        let avg_strength = picked.iter().map(|item| item.strength()).sum::<f64>()
            / picked.len() as f64;
        let ratio = lane_usage.projected_ratio(event.lane);
        let cap = event.lane.usage_cap();
        let over = (ratio - cap).max(0.0);
        let score = W_TRUST * event.trust
            + W_FRESHNESS * event.freshness
            + W_NOVELTY * novelty
            + W_EVIDENCE * avg_strength
            - W_OVERUSE * over;
        let plan = EventEvidencePlan {
            lane: event.lane,
            event: event.clone(),
            evidence: picked,
            lane_usage: lane_usage.clone(),
            lane_projected_ratio: ratio,
            lane_quota_limited: ratio > cap,
            score,
        };
        let slot = if plan.lane_quota_limited {
            &mut best_limited
        } else {
            &mut best_clear
        };
        if slot.as_ref().map(|held| plan.score > held.score).unwrap_or(true) {
            *slot = Some(plan);
        }
    }

    best_clear.or(best_limited)
}

/// Up to two evidence items: same lane first, then on-chain provenance,
/// then anything left. Input order (strength-sorted upstream) is preserved
/// within each preference class.
fn select_evidence(lane: Lane, evidence: &[OnchainEvidence]) -> Vec<OnchainEvidence> {
    let mut picked: Vec<OnchainEvidence> = Vec::with_capacity(EVIDENCE_REQUIRED);
    let classes: [&dyn Fn(&OnchainEvidence) -> bool; 3] = [
        &|item| item.lane == lane,
        &|item| item.source == crate::digest::NutrientSource::Onchain,
        &|_| true,
    ];
    for accepts in classes {
        for item in evidence {
            if picked.len() >= EVIDENCE_REQUIRED {
                return picked;
            }
            if picked.iter().any(|held| held.id == item.id) {
                continue;
            }
            if accepts(item) {
                picked.push(item.clone());
            }
        }
    }
    picked
}

/// How novel a headline is against the recent own-post window. Repeats score
/// low, token-overlapping topics mid, unseen topics high; with no history at
/// all the value stays neutral.
pub(crate) fn headline_novelty(headline: &str, recent_posts: &[String]) -> f64 {
    let window: Vec<&String> = recent_posts.iter().take(NOVELTY_WINDOW).collect();
    if window.is_empty() {
        return NOVELTY_DEFAULT;
    }
    let needle = quality::sanitize(headline).to_lowercase();
    if !needle.is_empty()
        && window
            .iter()
            .any(|post| quality::sanitize(post).to_lowercase().contains(&needle))
    {
        return NOVELTY_REPEAT;
    }
    let headline_tokens = quality::tokenize(headline);
    let overlaps = window.iter().any(|post| {
        let post_tokens = quality::tokenize(post);
        headline_tokens.iter().any(|token| post_tokens.contains(token))
    });
    if overlaps {
        NOVELTY_OVERLAP
    } else {
        NOVELTY_FRESH
    }
}

/// The generated text must literally anchor the plan: at least one event
/// token, and every evidence item through a label/value/summary token.
/// Matching runs as substring containment over a canonical form with `$` and
/// `,` stripped, so `$BTC` matches `BTC`, `4,200` matches `4200`, and Korean
/// particles glued to a noun still count as the noun appearing.
pub fn validate_event_evidence_contract(text: &str, plan: &EventEvidencePlan) -> GateVerdict {
    let haystack = canon(text);

    let mut event_tokens = anchor_tokens(&plan.event.headline);
    event_tokens.extend(plan.event.keywords.iter().cloned());
    let event_anchored = event_tokens.iter().any(|token| haystack.contains(token));
    if !event_anchored {
        return GateVerdict::fail("event-anchor-missing", 0.0);
    }

    let mut anchored = 0usize;
    for item in &plan.evidence {
        let tokens =
            anchor_tokens(&format!("{} {} {}", item.label, item.value, item.summary));
        if tokens.iter().any(|token| haystack.contains(token)) {
            anchored += 1;
        }
    }
    let fraction = anchored as f64 / plan.evidence.len().max(1) as f64;
    if anchored < plan.evidence.len() {
        GateVerdict::fail("evidence-anchor-missing", fraction)
    } else {
        GateVerdict::pass(1.0)
    }
}

/// Lowercased comparison form with ticker sigils and thousands separators
/// removed.
fn canon(text: &str) -> String {
    quality::sanitize(text)
        .to_lowercase()
        .chars()
        .filter(|ch| *ch != '$' && *ch != ',')
        .collect()
}

fn anchor_tokens(text: &str) -> Vec<String> {
    canon(text)
        .split_whitespace()
        .map(|raw| {
            raw.trim_matches(|ch: char| !ch.is_alphanumeric())
                .to_string()
        })
        .filter(|token| token.chars().count() >= 2)
        .collect()
}

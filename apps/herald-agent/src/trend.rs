//! Trend events, lanes, and evidence assembly.
//!
//! Lane inference is a prioritized rule table: rules are checked top to
//! bottom and the first hit wins, with `market-structure` as the fallback.
//! Keeping the table explicit makes every routing decision auditable after
//! the fact.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::digest::{NutrientSource, ScoredNutrient};
use crate::quality;

/// Freshness assigned to the first deduplicated headline.
const FRESHNESS_TOP: f64 = 1.0;
/// Freshness lost per input rank, floored.
const FRESHNESS_STEP: f64 = 0.06;
const FRESHNESS_MIN: f64 = 0.35;
const KEYWORDS_PER_EVENT: usize = 8;
/// On-chain posts may take at most this share of recent output.
const LANE_CAP_ONCHAIN: f64 = 0.3;
const LANE_CAP_DEFAULT: f64 = 0.4;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Lane {
    Protocol,
    Ecosystem,
    Regulation,
    Macro,
    Onchain,
    MarketStructure,
}

impl Lane {
    pub const ALL: [Lane; 6] = [
        Lane::Protocol,
        Lane::Ecosystem,
        Lane::Regulation,
        Lane::Macro,
        Lane::Onchain,
        Lane::MarketStructure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Protocol => "protocol",
            Lane::Ecosystem => "ecosystem",
            Lane::Regulation => "regulation",
            Lane::Macro => "macro",
            Lane::Onchain => "onchain",
            Lane::MarketStructure => "market-structure",
        }
    }

    /// Usage-ratio cap before the planner starts penalizing the lane.
    pub fn usage_cap(&self) -> f64 {
        match self {
            Lane::Onchain => LANE_CAP_ONCHAIN,
            _ => LANE_CAP_DEFAULT,
        }
    }
}

// Checked top to bottom; first match wins, market-structure is the default.
static LANE_RULES: Lazy<Vec<(Lane, Regex)>> = Lazy::new(|| {
    vec![
        (
            Lane::Regulation,
            Regex::new(r"(?i)\bsec\b|regulat|lawsuit|approval|court|\bban\b|규제|소송|승인|기소|법원|금지|당국")
                .expect("regulation lane regex"),
        ),
        (
            Lane::Protocol,
            Regex::new(r"(?i)upgrade|hard\s?fork|mainnet|testnet|halving|protocol|\beip-?\d+\b|업그레이드|하드포크|반감기|프로토콜")
                .expect("protocol lane regex"),
        ),
        (
            Lane::Onchain,
            Regex::new(r"(?i)on-?chain|whale|wallet|netflow|exchange\s+(?:reserve|balance)|온체인|고래|지갑|보유량|순유입|순유출")
                .expect("onchain lane regex"),
        ),
        (
            Lane::Macro,
            Regex::new(r"(?i)\bfed\b|fomc|\bcpi\b|inflation|rate\s*(?:cut|hike)|treasury|연준|금리|물가|인플레이션|국채")
                .expect("macro lane regex"),
        ),
        (
            Lane::Ecosystem,
            Regex::new(r"(?i)partnership|integration|launch|ecosystem|defi|nft|dapp|파트너십|제휴|출시|생태계|디파이")
                .expect("ecosystem lane regex"),
        ),
    ]
});

pub fn infer_lane(text: &str) -> Lane {
    for (lane, rule) in LANE_RULES.iter() {
        if rule.is_match(text) {
            return *lane;
        }
    }
    Lane::MarketStructure
}

/// Raw headline row as supplied by the signal source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewsRow {
    pub headline: String,
    pub summary: String,
    pub source: String,
    pub trust: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engagement: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrendEvent {
    pub id: String,
    pub lane: Lane,
    pub headline: String,
    pub summary: String,
    pub source: String,
    pub trust: f64,
    pub freshness: f64,
    pub captured_at: DateTime<Utc>,
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engagement: Option<f64>,
}

/// One trend event per distinct headline, lane-routed, freshness falling
/// with input rank.
pub fn build_trend_events(rows: &[NewsRow], captured_at: DateTime<Utc>) -> Vec<TrendEvent> {
    let mut seen: Vec<String> = Vec::new();
    let mut events = Vec::new();
    for row in rows {
        let normalized = normalize_headline(&row.headline);
        if normalized.is_empty() || seen.contains(&normalized) {
            continue;
        }
        seen.push(normalized);
        let rank = events.len();
        let lane = infer_lane(&format!("{} {}", row.headline, row.summary));
        let mut keywords = quality::content_tokens(&row.headline);
        keywords.truncate(KEYWORDS_PER_EVENT);
        events.push(TrendEvent {
            id: Uuid::new_v4().to_string(),
            lane,
            headline: row.headline.clone(),
            summary: row.summary.clone(),
            source: row.source.clone(),
            trust: row.trust.clamp(0.0, 1.0),
            freshness: (FRESHNESS_TOP - rank as f64 * FRESHNESS_STEP).max(FRESHNESS_MIN),
            captured_at,
            keywords,
            engagement: row.engagement,
        });
    }
    events
}

fn normalize_headline(headline: &str) -> String {
    headline
        .to_lowercase()
        .chars()
        .filter(|ch| ch.is_alphanumeric() || ch.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Evidence item backing a post, derived 1:1 from an accepted nutrient.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OnchainEvidence {
    pub id: String,
    pub lane: Lane,
    pub nutrient_id: String,
    pub source: NutrientSource,
    pub label: String,
    pub value: String,
    pub summary: String,
    pub trust: f64,
    pub freshness: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest_score: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl OnchainEvidence {
    pub fn strength(&self) -> f64 {
        self.digest_score.unwrap_or(0.5) * self.trust * self.freshness
    }
}

/// Maps accepted nutrients to evidence, dedups by `(lane,label,value)`,
/// strongest first, truncated to `max_items`. Every item carries strictly
/// positive trust and freshness; records at zero on either are dropped.
pub fn build_onchain_evidence(
    records: &[ScoredNutrient],
    max_items: usize,
) -> Vec<OnchainEvidence> {
    let mut evidence: Vec<OnchainEvidence> = Vec::new();
    for record in records.iter().filter(|record| record.accepted) {
        let nutrient = &record.nutrient;
        if nutrient.trust <= 0.0 || nutrient.freshness <= 0.0 {
            continue;
        }
        let lane = evidence_lane(
            nutrient.source,
            &format!("{} {} {}", nutrient.category, nutrient.label, nutrient.evidence),
        );
        if evidence.iter().any(|prior| {
            prior.lane == lane && prior.label == nutrient.label && prior.value == nutrient.value
        }) {
            continue;
        }
        evidence.push(OnchainEvidence {
            id: Uuid::new_v4().to_string(),
            lane,
            nutrient_id: nutrient.id.clone(),
            source: nutrient.source,
            label: nutrient.label.clone(),
            value: nutrient.value.clone(),
            summary: nutrient.evidence.clone(),
            trust: nutrient.trust.clamp(0.0, 1.0),
            freshness: nutrient.freshness.clamp(0.0, 1.0),
            digest_score: Some(record.score.total),
            captured_at: nutrient.captured_at,
        });
    }
    evidence.sort_by(|a, b| {
        b.strength()
            .partial_cmp(&a.strength())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    evidence.truncate(max_items);
    evidence
}

fn evidence_lane(source: NutrientSource, text: &str) -> Lane {
    let inferred = infer_lane(text);
    if inferred == Lane::MarketStructure && source == NutrientSource::Onchain {
        Lane::Onchain
    } else {
        inferred
    }
}

/// Lane distribution over the recent own-post window.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct LaneUsage {
    pub total_posts: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub by_lane: BTreeMap<Lane, u64>,
}

impl LaneUsage {
    pub fn from_lanes<I: IntoIterator<Item = Lane>>(lanes: I) -> Self {
        let mut usage = LaneUsage::default();
        for lane in lanes {
            usage.total_posts += 1;
            *usage.by_lane.entry(lane).or_insert(0) += 1;
        }
        usage
    }

    /// Laplace-smoothed share the lane would hold after one more post.
    pub fn projected_ratio(&self, lane: Lane) -> f64 {
        let prior = self.by_lane.get(&lane).copied().unwrap_or(0);
        (prior + 1) as f64 / (self.total_posts + 1) as f64
    }
}

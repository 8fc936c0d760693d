//! Nutrient digestion: scoring raw signals into ledger records.
//!
//! Pure functions; the scheduler supplies the clock reading and the trailing
//! ledger window. A nutrient is accepted when its digest score clears the
//! configured minimum, and accepted items earn an XP value recorded in the
//! nutrient ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Freshness is taken at face value for this many hours.
const FRESHNESS_GRACE_HOURS: f64 = 2.0;
/// Past the grace window the decay runs linearly down to the floor here.
const FRESHNESS_HORIZON_HOURS: f64 = 36.0;
const FRESHNESS_FLOOR: f64 = 0.15;
const LABEL_REPEAT_PENALTY: f64 = 0.08;
const LABEL_REPEAT_CAP: u64 = 3;
const DEFAULT_CONSISTENCY: f64 = 0.6;
const XP_CUTOFF_TOTAL: f64 = 0.4;
const XP_MIN: u32 = 1;
const XP_MAX: u32 = 18;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum NutrientSource {
    Onchain,
    Market,
    News,
}

impl NutrientSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            NutrientSource::Onchain => "onchain",
            NutrientSource::Market => "market",
            NutrientSource::News => "news",
        }
    }
}

/// Raw signal supplied by a collaborator; consumed once by the digest pass.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OnchainNutrient {
    pub id: String,
    pub source: NutrientSource,
    pub category: String,
    pub label: String,
    pub value: String,
    pub evidence: String,
    pub trust: f64,
    pub freshness: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consistency_hint: Option<f64>,
    pub captured_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DigestScore {
    pub trust: f64,
    pub freshness: f64,
    pub consistency: f64,
    pub total: f64,
    pub reason_codes: Vec<String>,
}

/// Persisted outcome of an accepted nutrient.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NutrientLedgerEntry {
    pub id: String,
    pub source: NutrientSource,
    pub category: String,
    pub label: String,
    pub value: String,
    pub digest_score: f64,
    pub xp_gain: u32,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ScoredNutrient {
    pub nutrient: OnchainNutrient,
    pub score: DigestScore,
    pub accepted: bool,
    pub xp_gain: u32,
}

#[derive(Clone, Debug, Serialize, Default)]
pub struct DigestOutcome {
    pub records: Vec<ScoredNutrient>,
    pub intake_count: usize,
    pub accepted_count: usize,
    /// Mean total over everything scored this pass, 0.0 when nothing was.
    pub avg_digest_score: f64,
    pub xp_gain_total: u32,
}

impl DigestOutcome {
    pub fn accepted(&self) -> impl Iterator<Item = &ScoredNutrient> {
        self.records.iter().filter(|record| record.accepted)
    }

    pub fn ledger_entries(&self, recorded_at: DateTime<Utc>) -> Vec<NutrientLedgerEntry> {
        self.accepted()
            .map(|record| NutrientLedgerEntry {
                id: record.nutrient.id.clone(),
                source: record.nutrient.source,
                category: record.nutrient.category.clone(),
                label: record.nutrient.label.clone(),
                value: record.nutrient.value.clone(),
                digest_score: record.score.total,
                xp_gain: record.xp_gain,
                recorded_at,
            })
            .collect()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DigestOptions {
    pub min_digest_score: f64,
    pub max_items: usize,
}

/// Scores a batch: dedup by `(source,category,label,value)`, truncate to the
/// intake cap, score each against the trailing ledger, accept at the minimum.
pub fn digest_nutrients(
    nutrients: Vec<OnchainNutrient>,
    recent_ledger: &[NutrientLedgerEntry],
    opts: &DigestOptions,
    now: DateTime<Utc>,
) -> DigestOutcome {
    let mut seen: Vec<(NutrientSource, String, String, String)> = Vec::new();
    let mut intake: Vec<OnchainNutrient> = Vec::new();
    for nutrient in nutrients {
        let key = (
            nutrient.source,
            nutrient.category.clone(),
            nutrient.label.clone(),
            nutrient.value.clone(),
        );
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        intake.push(nutrient);
        if intake.len() >= opts.max_items {
            break;
        }
    }

    let mut records = Vec::with_capacity(intake.len());
    let mut total_sum = 0.0;
    let mut accepted_count = 0usize;
    let mut xp_gain_total = 0u32;
    for nutrient in intake {
        let score = compute_digest_score(&nutrient, recent_ledger, now);
        let accepted = score.total >= opts.min_digest_score;
        let xp_gain = if accepted {
            convert_digest_to_xp(&score, &nutrient)
        } else {
            0
        };
        total_sum += score.total;
        if accepted {
            accepted_count += 1;
            xp_gain_total += xp_gain;
        }
        records.push(ScoredNutrient {
            nutrient,
            score,
            accepted,
            xp_gain,
        });
    }

    let intake_count = records.len();
    DigestOutcome {
        intake_count,
        accepted_count,
        avg_digest_score: if intake_count == 0 {
            0.0
        } else {
            total_sum / intake_count as f64
        },
        xp_gain_total,
        records,
    }
}

/// `total = 0.45·trust + 0.30·freshness + 0.25·consistency`. Freshness is
/// the reported value scaled by the age decay; consistency averages the
/// trailing same `(source,category)` scores with a capped penalty per
/// repeated label, falling back to the hint, then to a neutral default.
pub fn compute_digest_score(
    nutrient: &OnchainNutrient,
    recent_ledger: &[NutrientLedgerEntry],
    now: DateTime<Utc>,
) -> DigestScore {
    let mut reason_codes = Vec::new();

    let trust = nutrient.trust.clamp(0.0, 1.0);
    let decay = freshness_decay(nutrient.captured_at, now);
    if decay < 1.0 {
        reason_codes.push("aged-freshness".to_string());
    }
    let freshness = (nutrient.freshness.clamp(0.0, 1.0) * decay).clamp(0.0, 1.0);

    let peers: Vec<&NutrientLedgerEntry> = recent_ledger
        .iter()
        .filter(|entry| entry.source == nutrient.source && entry.category == nutrient.category)
        .collect();
    let consistency = if peers.is_empty() {
        match nutrient.consistency_hint {
            Some(hint) => {
                reason_codes.push("hint-consistency".to_string());
                hint.clamp(0.0, 1.0)
            }
            None => {
                reason_codes.push("default-consistency".to_string());
                DEFAULT_CONSISTENCY
            }
        }
    } else {
        let avg = peers.iter().map(|entry| entry.digest_score).sum::<f64>() / peers.len() as f64;
        let label_repeats = peers
            .iter()
            .filter(|entry| entry.label == nutrient.label)
            .count() as u64;
        if label_repeats > 0 {
            reason_codes.push("label-repeat".to_string());
        }
        let penalty = LABEL_REPEAT_PENALTY * label_repeats.min(LABEL_REPEAT_CAP) as f64;
        (avg - penalty).clamp(0.0, 1.0)
    };

    let total = 0.45 * trust + 0.30 * freshness + 0.25 * consistency;
    DigestScore {
        trust,
        freshness,
        consistency,
        total,
        reason_codes,
    }
}

/// XP from an accepted digest: 0 below the cutoff, else `total×10` plus
/// small bonuses for on-chain provenance and high importance, clamped.
pub fn convert_digest_to_xp(score: &DigestScore, nutrient: &OnchainNutrient) -> u32 {
    if score.total < XP_CUTOFF_TOTAL {
        return 0;
    }
    let mut xp = (score.total * 10.0).round() as i64;
    if nutrient.source == NutrientSource::Onchain {
        xp += 2;
    }
    if importance_is_high(nutrient) {
        xp += 1;
    }
    xp.clamp(XP_MIN as i64, XP_MAX as i64) as u32
}

fn importance_is_high(nutrient: &OnchainNutrient) -> bool {
    nutrient
        .metadata
        .as_ref()
        .and_then(|meta| meta.get("importance"))
        .and_then(|value| value.as_str())
        .map(|raw| raw.eq_ignore_ascii_case("high"))
        .unwrap_or(false)
}

fn freshness_decay(captured_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_hours = now
        .signed_duration_since(captured_at)
        .num_minutes()
        .max(0) as f64
        / 60.0;
    if age_hours <= FRESHNESS_GRACE_HOURS {
        return 1.0;
    }
    if age_hours >= FRESHNESS_HORIZON_HOURS {
        return FRESHNESS_FLOOR;
    }
    let span = FRESHNESS_HORIZON_HOURS - FRESHNESS_GRACE_HOURS;
    let progressed = (age_hours - FRESHNESS_GRACE_HOURS) / span;
    1.0 - progressed * (1.0 - FRESHNESS_FLOOR)
}

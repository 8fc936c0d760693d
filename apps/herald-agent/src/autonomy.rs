//! Final pre-dispatch governor.
//!
//! Pure rule evaluation over budget utilization, evidence diversity, language
//! policy, and a keyword risk score. Rules run strictest first; the outcome is
//! a value the caller publishes and acts on, never an error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Hangul share of alphabetic characters required to call a text Korean.
const KOREAN_HANGUL_RATIO: f64 = 0.3;
const RISK_POINTS_PER_HIT: u32 = 2;
const RISK_SCORE_MAX: u32 = 10;

// Hangul terms carry no \b anchors: particles attach directly to the noun
// ("해킹으로"), so a boundary between two word characters never fires.
static RE_RISK_TERMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:hack(?:ed|ing|s)?|exploit(?:ed|s)?|rug\s?pull|depeg(?:ged|ging)?|liquidat(?:ion|ions|ed)|insolven(?:t|cy)|lawsuit|indict(?:ed|ment)?|fraud|scam|breach)\b|해킹|익스플로잇|러그풀|탈취|디페깅|대규모\s*청산|연쇄\s*청산|청산|파산|소송|기소|사기|보안\s*사고",
    )
    .expect("risk terms regex")
});

static RE_ASSERTIVE_TONE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:guaranteed|definitely|certainly|surely)\b|100\s?%|반드시|무조건|확실|틀림없|올인|전재산")
        .expect("assertive tone regex")
});

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GovernLevel {
    Allow,
    Warn,
    Block,
}

impl GovernLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            GovernLevel::Allow => "allow",
            GovernLevel::Warn => "warn",
            GovernLevel::Block => "block",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AutonomyDecision {
    pub allow: bool,
    pub level: GovernLevel,
    pub reasons: Vec<String>,
    pub diagnostics: Value,
}

/// Everything the governor looks at for one candidate post.
#[derive(Clone, Debug)]
pub struct GovernorInput<'a> {
    pub candidate_text: &'a str,
    pub event_headline: &'a str,
    pub trend_summary: &'a str,
    pub current_cost_usd: f64,
    pub one_create_cost_usd: f64,
    pub daily_max_usd: f64,
    pub budget_ceiling_ratio: f64,
    pub has_onchain_evidence: bool,
    pub evidence_source_diversity: usize,
    pub mandate_onchain_evidence: bool,
    pub mandate_cross_source: bool,
    pub enforce_korean: bool,
    pub risk_threshold: u32,
}

pub fn evaluate_autonomy_governor(input: &GovernorInput<'_>) -> AutonomyDecision {
    let utilization = projected_utilization(
        input.current_cost_usd,
        input.one_create_cost_usd,
        input.daily_max_usd,
    );
    let scan = format!(
        "{} {} {}",
        input.trend_summary, input.event_headline, input.candidate_text
    );
    let risk_hits = RE_RISK_TERMS.find_iter(&scan).count() as u32;
    let risk = (risk_hits * RISK_POINTS_PER_HIT).min(RISK_SCORE_MAX);
    let assertive = RE_ASSERTIVE_TONE.is_match(input.candidate_text);
    let hangul_ratio = hangul_ratio(input.candidate_text);

    let mut reasons: Vec<String> = Vec::new();
    let level = if input.daily_max_usd > 0.0 && utilization > input.budget_ceiling_ratio {
        reasons.push("budget_ceiling".to_string());
        GovernLevel::Block
    } else if input.mandate_onchain_evidence && !input.has_onchain_evidence {
        reasons.push("onchain_evidence_missing".to_string());
        GovernLevel::Block
    } else if input.mandate_cross_source && input.evidence_source_diversity < 2 {
        reasons.push("cross_source_missing".to_string());
        GovernLevel::Block
    } else if input.enforce_korean && hangul_ratio < KOREAN_HANGUL_RATIO {
        reasons.push("post_language_not_korean".to_string());
        GovernLevel::Block
    } else if risk >= input.risk_threshold && assertive {
        reasons.push("risk_with_assertive_tone".to_string());
        GovernLevel::Block
    } else {
        if risk >= input.risk_threshold {
            reasons.push("elevated_risk".to_string());
        }
        if input.evidence_source_diversity <= 1 {
            reasons.push("low_evidence_diversity".to_string());
        }
        if reasons.is_empty() {
            GovernLevel::Allow
        } else {
            GovernLevel::Warn
        }
    };

    AutonomyDecision {
        allow: level != GovernLevel::Block,
        level,
        reasons,
        diagnostics: json!({
            "utilization": utilization,
            "risk_score": risk,
            "risk_hits": risk_hits,
            "assertive_tone": assertive,
            "hangul_ratio": hangul_ratio,
            "evidence_source_diversity": input.evidence_source_diversity,
        }),
    }
}

fn projected_utilization(current: f64, one_create: f64, daily_max: f64) -> f64 {
    if daily_max <= 0.0 {
        return 0.0;
    }
    (current.max(0.0) + one_create.max(0.0)) / daily_max
}

/// Hangul syllables over all alphabetic characters. Digits and punctuation do
/// not count either way, so "BTC 10만 돌파" reads as mostly Korean.
fn hangul_ratio(text: &str) -> f64 {
    let mut hangul = 0usize;
    let mut alphabetic = 0usize;
    for ch in text.chars() {
        if ('\u{AC00}'..='\u{D7A3}').contains(&ch) {
            hangul += 1;
            alphabetic += 1;
        } else if ch.is_alphabetic() {
            alphabetic += 1;
        }
    }
    if alphabetic == 0 {
        return 0.0;
    }
    hangul as f64 / alphabetic as f64
}

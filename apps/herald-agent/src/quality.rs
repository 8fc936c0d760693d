//! Candidate text quality gates.
//!
//! Pure functions over a candidate string and reference context. Expected
//! rejections come back as verdict values with a named reason; nothing here
//! errors or panics for a failed check. Every gate operates on the
//! [`sanitize`]d form of the text so checks agree on canonical input.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::market::MarketSnapshot;

const PRIMARY_ASSET: &str = "BTC";
/// Price claims may diverge from the live price by at most this much.
const MAX_PRICE_RELATIVE_ERROR: f64 = 0.15;
const ROUND_CLAIM_USD: f64 = 100_000.0;
/// A "100k" claim goes stale once the live price sits below this fraction.
const ROUND_CLAIM_SLACK: f64 = 0.97;

static RE_PERCENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[+\-]?\d[\d,]*(?:\.\d+)?\s*(?:%|퍼센트)").expect("percent regex"));
static RE_MONEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\s?\d[\d,]*(?:\.\d+)?\s*[km]?").expect("money regex"));
static RE_TICKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$[a-z]{2,6}\b").expect("ticker regex"));
static RE_ASSET_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:btc|eth|sol|xrp|bitcoin|ethereum|solana)\b|비트코인|이더리움|솔라나")
        .expect("asset name regex")
});
static RE_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d[\d,]*(?:\.\d+)?(?:\s*[km만억])?").expect("number regex"));

static RE_CLAIM_ASSET_PRICE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:btc|bitcoin|비트코인)[^.!?\n]{0,40}?\$\s?(\d[\d,]*(?:\.\d+)?)([km])?")
        .expect("asset price claim regex")
});
static RE_CLAIM_NEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:btc|bitcoin|비트코인)[^.!?\n]{0,40}?\$?\s?(\d[\d,]*(?:\.\d+)?)([km])?\s*(?:달러)?\s*(?:선|부근|근처|수준)",
    )
    .expect("near price claim regex")
});
static RE_CLAIM_ROUND_100K: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)100\s?k\b|10만\s*(?:달러|불)").expect("round claim regex"));

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "about", "after", "again", "also", "and", "are", "because", "been", "before", "but",
        "for", "from", "had", "has", "have", "into", "just", "more", "most", "not", "now",
        "only", "over", "some", "such", "than", "that", "the", "then", "this", "very", "was",
        "were", "will", "with", "would",
        // Korean connectives and fillers.
        "그리고", "그러나", "하지만", "또한", "대한", "대해", "위한", "통해", "함께", "관련",
        "이번", "오늘", "지금", "최근", "있다", "있는", "한다", "하는",
    ]
    .into_iter()
    .collect()
});

/// Shared verdict shape for gates that pass or fail with a reason.
#[derive(Clone, Debug, PartialEq)]
pub struct GateVerdict {
    pub ok: bool,
    pub reason: Option<&'static str>,
    pub score: f64,
}

impl GateVerdict {
    pub fn pass(score: f64) -> Self {
        Self {
            ok: true,
            reason: None,
            score,
        }
    }

    pub fn fail(reason: &'static str, score: f64) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
            score,
        }
    }
}

/// Result of a similarity sweep against recent own texts.
#[derive(Clone, Debug, PartialEq)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    /// Best Jaccard similarity observed.
    pub score: f64,
    /// The closest recent text, when any comparison ran.
    pub matched: Option<String>,
}

/// Canonical text form: collapsed whitespace, straight quotes.
pub fn sanitize(text: &str) -> String {
    let normalized: String = text
        .chars()
        .map(|ch| match ch {
            '\u{2018}' | '\u{2019}' | '\u{02BC}' => '\'',
            '\u{201C}' | '\u{201D}' => '"',
            _ => ch,
        })
        .collect();
    normalized.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercased content tokens in input order, deduplicated: punctuation
/// stripped, stop-words and tokens of two or fewer characters dropped.
pub(crate) fn content_tokens(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    sanitize(text)
        .to_lowercase()
        .split_whitespace()
        .filter_map(|raw| {
            let cleaned: String = raw.chars().filter(|ch| ch.is_alphanumeric()).collect();
            if cleaned.chars().count() <= 2 {
                return None;
            }
            if STOP_WORDS.contains(cleaned.as_str()) {
                return None;
            }
            Some(cleaned)
        })
        .filter(|token| seen.insert(token.clone()))
        .collect()
}

pub(crate) fn tokenize(text: &str) -> HashSet<String> {
    content_tokens(text).into_iter().collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// Token-set similarity against each recent own post; duplicate when the
/// best similarity exceeds `threshold`.
pub fn check_duplicate(text: &str, recent: &[String], threshold: f64) -> DuplicateCheck {
    let candidate = tokenize(text);
    let mut best_score = 0.0_f64;
    let mut matched = None;
    for prior in recent {
        let score = jaccard(&candidate, &tokenize(prior));
        if score > best_score {
            best_score = score;
            matched = Some(prior.clone());
        }
    }
    DuplicateCheck {
        is_duplicate: best_score > threshold,
        score: best_score,
        matched,
    }
}

/// Rhetorical shape of a text with the volatile parts masked: percentages
/// become `<pct>`, dollar amounts and bare numbers `<num>`, tickers and
/// known asset names `<tik>`. Applying it twice is a no-op.
pub fn normalize_skeleton(text: &str) -> String {
    let lowered = sanitize(text).to_lowercase();
    let step = RE_PERCENT.replace_all(&lowered, "<pct>");
    let step = RE_MONEY.replace_all(&step, "<num>");
    let step = RE_TICKER.replace_all(&step, "<tik>");
    let step = RE_ASSET_NAME.replace_all(&step, "<tik>");
    let step = RE_NUMBER.replace_all(&step, "<num>");
    step.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Same sweep as [`check_duplicate`] but over normalized skeletons, so
/// "same sentence, different numbers" repetition is caught.
pub fn find_narrative_duplicate(
    candidate: &str,
    recent: &[String],
    threshold: f64,
) -> DuplicateCheck {
    let candidate_tokens = tokenize(&normalize_skeleton(candidate));
    let mut best_score = 0.0_f64;
    let mut matched = None;
    for prior in recent {
        let score = jaccard(&candidate_tokens, &tokenize(&normalize_skeleton(prior)));
        if score > best_score {
            best_score = score;
            matched = Some(prior.clone());
        }
    }
    DuplicateCheck {
        is_duplicate: best_score > threshold,
        score: best_score,
        matched,
    }
}

/// Cross-checks explicit primary-asset price claims against the live price.
/// Passes when the text makes no checkable claim or no live price is known.
pub fn validate_market_consistency(text: &str, snapshot: &MarketSnapshot) -> GateVerdict {
    let Some(live) = snapshot.price_of(PRIMARY_ASSET) else {
        return GateVerdict::pass(0.0);
    };
    if live <= 0.0 {
        return GateVerdict::pass(0.0);
    }
    let haystack = sanitize(text);

    let mut claims: Vec<f64> = Vec::new();
    for re in [&RE_CLAIM_ASSET_PRICE, &RE_CLAIM_NEAR] {
        for caps in re.captures_iter(&haystack) {
            if let Some(value) = parse_claim(&caps) {
                claims.push(value);
            }
        }
    }

    let mut worst = 0.0_f64;
    for claim in &claims {
        worst = worst.max((claim - live).abs() / live);
    }
    let round_claim_stale =
        RE_CLAIM_ROUND_100K.is_match(&haystack) && live < ROUND_CLAIM_USD * ROUND_CLAIM_SLACK;
    if round_claim_stale {
        worst = worst.max((ROUND_CLAIM_USD - live).abs() / live);
    }
    if worst > MAX_PRICE_RELATIVE_ERROR || round_claim_stale {
        GateVerdict::fail("market-price-mismatch", worst)
    } else {
        GateVerdict::pass(worst)
    }
}

fn parse_claim(caps: &regex::Captures<'_>) -> Option<f64> {
    let digits = caps.get(1)?.as_str().replace(',', "");
    let base: f64 = digits.parse().ok()?;
    let multiplier = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(suffix) if suffix == "k" => 1_000.0,
        Some(suffix) if suffix == "m" => 1_000_000.0,
        _ => 1.0,
    };
    Some(base * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot_with_btc(price: f64) -> MarketSnapshot {
        MarketSnapshot {
            prices: BTreeMap::from([("BTC".to_string(), price)]),
            ..MarketSnapshot::default()
        }
    }

    #[test]
    fn sanitize_collapses_and_straightens() {
        let raw = "  “스마트”   ‘인용’ \n  테스트  ";
        assert_eq!(sanitize(raw), "\"스마트\" '인용' 테스트");
    }

    #[test]
    fn near_identical_post_is_a_duplicate() {
        let recent = vec!["BTC ETF inflows hit $890M".to_string()];
        let check = check_duplicate("BTC ETF inflows hit $890M again", &recent, 0.6);
        assert!(check.is_duplicate);
        assert!(check.score > 0.6);
        assert_eq!(check.matched.as_deref(), Some("BTC ETF inflows hit $890M"));
    }

    #[test]
    fn unrelated_post_is_not_a_duplicate() {
        let recent = vec!["BTC ETF inflows hit $890M".to_string()];
        let check = check_duplicate(
            "이더리움 스테이킹 물량이 사상 최고치를 경신했다",
            &recent,
            0.6,
        );
        assert!(!check.is_duplicate);
        assert!(check.score < 0.2);
    }

    #[test]
    fn empty_history_never_flags() {
        let check = check_duplicate("아무 글", &[], 0.1);
        assert!(!check.is_duplicate);
        assert_eq!(check.score, 0.0);
        assert!(check.matched.is_none());
    }

    #[test]
    fn skeleton_is_idempotent() {
        let text = "BTC가 $96,400 돌파, 거래량 +12.5% 급증";
        let once = normalize_skeleton(text);
        let twice = normalize_skeleton(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn skeleton_ignores_numbers_and_tickers() {
        let a = normalize_skeleton("$BTC 거래량이 +12.5% 늘며 $96,400 돌파");
        let b = normalize_skeleton("$ETH 거래량이 +3.1% 늘며 $91,000 돌파");
        assert_eq!(a, b);
        assert!(a.contains("<tik>"));
        assert!(a.contains("<pct>"));
        assert!(a.contains("<num>"));
    }

    #[test]
    fn narrative_duplicate_catches_same_shape() {
        let recent = vec!["비트코인이 $96,000을 돌파하며 거래량 +12% 기록".to_string()];
        let check = find_narrative_duplicate(
            "비트코인이 $91,500을 돌파하며 거래량 +3% 기록",
            &recent,
            0.8,
        );
        assert!(check.is_duplicate);
    }

    #[test]
    fn consistent_price_claim_passes() {
        let verdict = validate_market_consistency(
            "BTC가 $95,000 부근에서 거래되고 있다",
            &snapshot_with_btc(96_400.0),
        );
        assert!(verdict.ok);
        assert!(verdict.score < 0.05);
    }

    #[test]
    fn divergent_price_claim_fails() {
        let verdict = validate_market_consistency(
            "BTC가 $120,000 부근까지 상승했다",
            &snapshot_with_btc(96_400.0),
        );
        assert!(!verdict.ok);
        assert_eq!(verdict.reason, Some("market-price-mismatch"));
        assert!(verdict.score > MAX_PRICE_RELATIVE_ERROR);
    }

    #[test]
    fn round_claim_fails_when_price_sits_below() {
        let verdict =
            validate_market_consistency("비트코인 100k 돌파 임박", &snapshot_with_btc(89_000.0));
        assert!(!verdict.ok);
        // Within the generic 15% band, still rejected as a stale round claim.
        let generic = (ROUND_CLAIM_USD - 89_000.0) / 89_000.0;
        assert!(generic < MAX_PRICE_RELATIVE_ERROR);
    }

    #[test]
    fn round_claim_passes_near_the_level() {
        let verdict =
            validate_market_consistency("비트코인 100k 돌파 임박", &snapshot_with_btc(99_500.0));
        assert!(verdict.ok);
    }

    #[test]
    fn other_asset_prices_are_not_compared() {
        let verdict = validate_market_consistency(
            "이더리움이 $3,300 부근에서 횡보 중",
            &snapshot_with_btc(96_400.0),
        );
        assert!(verdict.ok);
    }

    #[test]
    fn no_claim_no_price_both_pass() {
        let snap = snapshot_with_btc(96_400.0);
        assert!(validate_market_consistency("온체인 데이터가 개선되고 있다", &snap).ok);
        let empty = MarketSnapshot::default();
        assert!(validate_market_consistency("BTC가 $120,000 부근", &empty).ok);
    }
}

//! Narrative mode rotation and novelty checks.
//!
//! Five fixed rhetorical modes rotate least-used-first over the recent own
//! posts, with per-lane preference orders breaking ties. Openers are drawn
//! from fixed pools while skipping anything the agent led with recently.

use serde::{Deserialize, Serialize};

use crate::memory::PostRecord;
use crate::quality::{self, GateVerdict};
use crate::trend::Lane;

/// Mode usage is tallied over this many recent posts.
const USAGE_WINDOW: usize = 20;
/// Banned openers come from this many recent posts.
const OPENER_WINDOW: usize = 8;
const OPENER_PREFIX_CHARS: usize = 26;
/// Opening-pattern repetition compares this many normalized characters.
const OPENING_MATCH_CHARS: usize = 24;
/// Skeleton repetition is checked against this many recent posts.
const SKELETON_WINDOW: usize = 14;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum NarrativeMode {
    DataBrief,
    ContrarianCheck,
    FieldJournal,
    ForecastWatch,
    OpenQuestion,
}

impl NarrativeMode {
    pub const ALL: [NarrativeMode; 5] = [
        NarrativeMode::DataBrief,
        NarrativeMode::ContrarianCheck,
        NarrativeMode::FieldJournal,
        NarrativeMode::ForecastWatch,
        NarrativeMode::OpenQuestion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NarrativeMode::DataBrief => "data-brief",
            NarrativeMode::ContrarianCheck => "contrarian-check",
            NarrativeMode::FieldJournal => "field-journal",
            NarrativeMode::ForecastWatch => "forecast-watch",
            NarrativeMode::OpenQuestion => "open-question",
        }
    }

    fn opening_pool(&self) -> &'static [&'static str] {
        match self {
            NarrativeMode::DataBrief => &[
                "숫자부터 보자.",
                "오늘 데이터 한 줄 요약.",
                "지표가 먼저 말한다.",
            ],
            NarrativeMode::ContrarianCheck => &[
                "다들 같은 말을 할 때 한 번 뒤집어 본다.",
                "합의가 강할수록 의심해 볼 가치가 있다.",
                "반대편 근거부터 확인한다.",
            ],
            NarrativeMode::FieldJournal => &[
                "오늘 온체인에서 눈에 띈 장면.",
                "시장 한구석 관찰 기록.",
                "현장 메모 한 토막.",
            ],
            NarrativeMode::ForecastWatch => &[
                "다음 구간에서 확인할 것들.",
                "앞으로 며칠이 분수령이다.",
                "시나리오 점검 시간.",
            ],
            NarrativeMode::OpenQuestion => &[
                "여기서 질문 하나.",
                "아직 답이 없는 문제.",
                "어떻게 읽어야 할까.",
            ],
        }
    }

    fn body_directive(&self) -> &'static str {
        match self {
            NarrativeMode::DataBrief => "두 근거 수치를 본문 중심에 두고 해석은 한 문장으로 줄일 것",
            NarrativeMode::ContrarianCheck => "시장 합의를 먼저 요약한 뒤 근거 수치로 반박 지점을 짚을 것",
            NarrativeMode::FieldJournal => "관찰한 사실을 시간 순서로 적고 근거 수치를 자연스럽게 녹일 것",
            NarrativeMode::ForecastWatch => "근거 수치에서 출발해 확인 가능한 다음 변곡점을 제시할 것",
            NarrativeMode::OpenQuestion => "근거 수치를 제시한 뒤 해석이 갈리는 지점을 질문으로 남길 것",
        }
    }

    fn ending_directive(&self) -> &'static str {
        match self {
            NarrativeMode::DataBrief => "단정 없이 수치 재확인 시점을 한 줄로 남길 것",
            NarrativeMode::ContrarianCheck => "반대 시나리오가 틀리는 조건을 명시하고 끝낼 것",
            NarrativeMode::FieldJournal => "다음 관찰 포인트를 짧게 예고할 것",
            NarrativeMode::ForecastWatch => "전망이 무효화되는 조건을 덧붙일 것",
            NarrativeMode::OpenQuestion => "독자가 답할 여지를 남기고 닫을 것",
        }
    }

    // Markers for inferring the mode of a post that has no explicit
    // metadata; checked in a fixed order.
    fn markers(&self) -> &'static [&'static str] {
        match self {
            NarrativeMode::ContrarianCheck => &["뒤집어", "반대편", "의심", "과연", "합의"],
            NarrativeMode::ForecastWatch => &["전망", "예상", "분수령", "시나리오", "변곡점"],
            NarrativeMode::OpenQuestion => &["질문", "어떻게 읽", "일까", "궁금"],
            NarrativeMode::FieldJournal => &["관찰", "기록", "현장", "메모", "장면"],
            NarrativeMode::DataBrief => &["데이터", "수치", "지표", "집계", "요약"],
        }
    }
}

fn lane_preferences(lane: Lane) -> [NarrativeMode; 5] {
    use NarrativeMode::*;
    match lane {
        Lane::Onchain => [DataBrief, FieldJournal, ContrarianCheck, ForecastWatch, OpenQuestion],
        Lane::MarketStructure => {
            [DataBrief, ForecastWatch, ContrarianCheck, OpenQuestion, FieldJournal]
        }
        Lane::Regulation => [ContrarianCheck, OpenQuestion, DataBrief, ForecastWatch, FieldJournal],
        Lane::Macro => [ForecastWatch, ContrarianCheck, DataBrief, OpenQuestion, FieldJournal],
        Lane::Protocol => [FieldJournal, DataBrief, ForecastWatch, OpenQuestion, ContrarianCheck],
        Lane::Ecosystem => [FieldJournal, OpenQuestion, DataBrief, ContrarianCheck, ForecastWatch],
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct NarrativePlan {
    pub lane: Lane,
    pub mode: NarrativeMode,
    pub opening_directive: String,
    pub body_directive: String,
    pub ending_directive: String,
    pub banned_openers: Vec<String>,
}

/// Least-used mode over the recent window, ties resolved by the lane's
/// preference order. Posts without explicit mode metadata are classified by
/// marker keywords.
pub fn pick_narrative_mode(lane: Lane, recent: &[PostRecord]) -> NarrativeMode {
    let mut usage: [(NarrativeMode, usize); 5] = NarrativeMode::ALL.map(|mode| (mode, 0));
    for record in recent.iter().take(USAGE_WINDOW) {
        let mode = record.mode.unwrap_or_else(|| infer_mode(&record.text));
        if let Some(slot) = usage.iter_mut().find(|(held, _)| *held == mode) {
            slot.1 += 1;
        }
    }
    let mut best = lane_preferences(lane)[0];
    let mut best_count = usize::MAX;
    for mode in lane_preferences(lane) {
        let count = usage
            .iter()
            .find(|(held, _)| *held == mode)
            .map(|(_, count)| *count)
            .unwrap_or(0);
        if count < best_count {
            best = mode;
            best_count = count;
        }
    }
    best
}

fn infer_mode(text: &str) -> NarrativeMode {
    let haystack = quality::sanitize(text).to_lowercase();
    for mode in [
        NarrativeMode::ContrarianCheck,
        NarrativeMode::ForecastWatch,
        NarrativeMode::OpenQuestion,
        NarrativeMode::FieldJournal,
        NarrativeMode::DataBrief,
    ] {
        if mode.markers().iter().any(|marker| haystack.contains(marker)) {
            return mode;
        }
    }
    NarrativeMode::DataBrief
}

/// First ~26 characters of each of the last 8 own posts, deduplicated.
pub fn build_banned_openers(recent_texts: &[String]) -> Vec<String> {
    let mut openers = Vec::new();
    for text in recent_texts.iter().take(OPENER_WINDOW) {
        let prefix: String = quality::sanitize(text)
            .chars()
            .take(OPENER_PREFIX_CHARS)
            .collect();
        if prefix.is_empty() || openers.contains(&prefix) {
            continue;
        }
        openers.push(prefix);
    }
    openers
}

/// Assembles the directives handed to the text generator. The opening comes
/// from the mode's pool, skipping entries that collide with a banned opener;
/// when every entry collides the first one is kept rather than failing.
pub fn build_narrative_plan(
    lane: Lane,
    mode: NarrativeMode,
    banned_openers: Vec<String>,
) -> NarrativePlan {
    let pool = mode.opening_pool();
    let opening = pool
        .iter()
        .find(|candidate| {
            let normalized = normalize_prefix(candidate, OPENER_PREFIX_CHARS);
            !banned_openers.iter().any(|banned| {
                let banned = normalize_prefix(banned, OPENER_PREFIX_CHARS);
                banned.starts_with(&normalized) || normalized.starts_with(&banned)
            })
        })
        .copied()
        .unwrap_or(pool[0]);
    NarrativePlan {
        lane,
        mode,
        opening_directive: opening.to_string(),
        body_directive: mode.body_directive().to_string(),
        ending_directive: mode.ending_directive().to_string(),
        banned_openers,
    }
}

/// Structural novelty gate: rejects repeated openings, banned openers, and
/// exact skeleton repeats; otherwise passes with a novelty score.
pub fn validate_narrative_novelty(
    text: &str,
    recent_texts: &[String],
    plan: &NarrativePlan,
) -> GateVerdict {
    let opening = normalize_prefix(text, OPENING_MATCH_CHARS);
    if !opening.is_empty() {
        for prior in recent_texts {
            if normalize_prefix(prior, OPENING_MATCH_CHARS) == opening {
                return GateVerdict::fail("opening-pattern-repeat", 0.0);
            }
        }
    }
    let normalized_text = quality::sanitize(text).to_lowercase();
    for banned in &plan.banned_openers {
        let banned = normalize_prefix(banned, OPENER_PREFIX_CHARS);
        if !banned.is_empty() && normalized_text.starts_with(&banned) {
            return GateVerdict::fail("banned-opener", 0.0);
        }
    }
    let skeleton = quality::normalize_skeleton(text);
    let mut best_similarity = 0.0_f64;
    for prior in recent_texts.iter().take(SKELETON_WINDOW) {
        if quality::normalize_skeleton(prior) == skeleton {
            return GateVerdict::fail("narrative-skeleton-repeat", 0.0);
        }
        let check = quality::find_narrative_duplicate(text, std::slice::from_ref(prior), 1.1);
        best_similarity = best_similarity.max(check.score);
    }
    GateVerdict::pass(1.0 - best_similarity)
}

fn normalize_prefix(text: &str, chars: usize) -> String {
    quality::sanitize(text)
        .to_lowercase()
        .chars()
        .take(chars)
        .collect()
}

//! Market regime context and fingerprinting.
//!
//! A [`MarketSnapshot`] carries the quantitative context a cycle works
//! against; [`MarketSnapshot::fingerprint`] collapses it into a stable
//! qualitative key (fear/greed bucket, per-asset direction, fee and volume
//! bands). Cycles reuse cached trend context as long as the fingerprint is
//! unchanged, so the key must be insensitive to small numeric wiggle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 24h moves inside this band count as flat.
const DIRECTION_BAND_PCT: f64 = 3.0;

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MarketSnapshot {
    /// Spot prices keyed by upper-case asset symbol.
    pub prices: BTreeMap<String, f64>,
    /// 24h percent change keyed like `prices`.
    pub change_24h: BTreeMap<String, f64>,
    /// Fear & greed index on the usual 0..=100 scale.
    pub fear_greed: Option<f64>,
    /// Network fee level relative to a typical day (1.0 = typical).
    pub fees_level: Option<f64>,
    /// Spot volume relative to a typical day (1.0 = typical).
    pub volume_level: Option<f64>,
    pub captured_at: Option<DateTime<Utc>>,
}

impl MarketSnapshot {
    pub fn price_of(&self, asset: &str) -> Option<f64> {
        self.prices
            .iter()
            .find(|(symbol, _)| symbol.eq_ignore_ascii_case(asset))
            .map(|(_, price)| *price)
    }

    /// Stable key for the current qualitative regime. Identical regimes
    /// (same buckets) always produce the same string; any bucket flip
    /// produces a different one.
    pub fn fingerprint(&self) -> String {
        let mut parts = Vec::with_capacity(self.change_24h.len() + 3);
        parts.push(format!("fg:{}", fear_greed_bucket(self.fear_greed)));
        for (asset, change) in &self.change_24h {
            parts.push(format!(
                "{}:{}",
                asset.to_ascii_lowercase(),
                direction_bucket(*change)
            ));
        }
        parts.push(format!("fees:{}", level_bucket(self.fees_level)));
        parts.push(format!("vol:{}", level_bucket(self.volume_level)));
        parts.join("|")
    }
}

fn fear_greed_bucket(index: Option<f64>) -> &'static str {
    let Some(index) = index else {
        return "na";
    };
    if index < 25.0 {
        "extreme-fear"
    } else if index < 45.0 {
        "fear"
    } else if index <= 55.0 {
        "neutral"
    } else if index <= 75.0 {
        "greed"
    } else {
        "extreme-greed"
    }
}

fn direction_bucket(change_pct: f64) -> &'static str {
    if change_pct >= DIRECTION_BAND_PCT {
        "up"
    } else if change_pct <= -DIRECTION_BAND_PCT {
        "down"
    } else {
        "flat"
    }
}

fn level_bucket(level: Option<f64>) -> &'static str {
    let Some(level) = level else {
        return "na";
    };
    if level < 0.8 {
        "low"
    } else if level <= 1.25 {
        "mid"
    } else {
        "high"
    }
}

//! Persisted telemetry: recent posts, activity counts, generation metrics,
//! the nutrient ledger, and per-source trust.
//!
//! Mutators mark the store dirty in memory only; nothing touches disk until
//! the scheduler calls [`MemoryService::flush`] at the end of a cycle. Load
//! is lenient: a missing or corrupt file starts an empty store with a
//! warning, never a failed boot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use herald_events::Bus;
use herald_topics as topics;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::warn;

use crate::clock::Clock;
use crate::digest::NutrientLedgerEntry;
use crate::narrative::NarrativeMode;
use crate::responses;
use crate::trend::{Lane, LaneUsage};
use crate::util;

/// Recent own posts kept for novelty and rotation checks.
const POST_WINDOW: usize = 40;
/// Nutrient ledger entries kept for consistency scoring.
const LEDGER_WINDOW: usize = 120;
/// Days of per-day metrics and activity counts kept.
const METRICS_RETENTION_DAYS: i64 = 14;
/// Trust assumed for a source never seen before.
const DEFAULT_SOURCE_TRUST: f64 = 0.6;
const SOURCE_TRUST_MIN: f64 = 0.2;
const SOURCE_TRUST_MAX: f64 = 0.95;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PostRecord {
    pub text: String,
    pub lane: Lane,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<NarrativeMode>,
    pub posted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PostGenerationMetrics {
    pub post_runs: u64,
    pub post_successes: u64,
    pub post_failures: u64,
    pub total_retries: u64,
    pub fallback_used: u64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fail_reasons: BTreeMap<String, u64>,
}

impl PostGenerationMetrics {
    fn absorb(&mut self, other: &PostGenerationMetrics) {
        self.post_runs += other.post_runs;
        self.post_successes += other.post_successes;
        self.post_failures += other.post_failures;
        self.total_retries += other.total_retries;
        self.fallback_used += other.fallback_used;
        for (reason, count) in &other.fail_reasons {
            *self.fail_reasons.entry(reason.clone()).or_insert(0) += count;
        }
    }
}

/// One generation attempt sequence, as reported by the action layer.
#[derive(Clone, Debug, Default)]
pub struct PostGenerationOutcome {
    pub success: bool,
    pub retries: u64,
    pub fallback_used: bool,
    pub fail_reasons: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySnapshot {
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_posts: Vec<PostRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub activity_by_day: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics_by_day: BTreeMap<String, PostGenerationMetrics>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nutrient_ledger: Vec<NutrientLedgerEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_trust: BTreeMap<String, f64>,
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self {
            version: 0,
            generated: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            recent_posts: Vec::new(),
            activity_by_day: BTreeMap::new(),
            metrics_by_day: BTreeMap::new(),
            nutrient_ledger: Vec::new(),
            source_trust: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
struct MemoryState {
    version: u64,
    dirty: bool,
    snapshot: TelemetrySnapshot,
}

pub struct MemoryService {
    store: RwLock<MemoryState>,
    bus: Bus,
    clock: Arc<dyn Clock>,
    timezone: String,
    path: Option<PathBuf>,
}

impl MemoryService {
    #[allow(dead_code)]
    pub fn new(bus: Bus, clock: Arc<dyn Clock>, timezone: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            store: RwLock::new(MemoryState::default()),
            bus,
            clock,
            timezone: timezone.into(),
            path: None,
        })
    }

    pub async fn with_state_path(
        bus: Bus,
        clock: Arc<dyn Clock>,
        timezone: impl Into<String>,
        path: PathBuf,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            store: RwLock::new(MemoryState::default()),
            bus,
            clock,
            timezone: timezone.into(),
            path: Some(path),
        });
        service.load_from_disk().await;
        service
    }

    fn today_key(&self) -> String {
        util::local_date_key(&self.timezone, self.clock.now_utc())
    }

    pub async fn snapshot(&self) -> TelemetrySnapshot {
        let guard = self.store.read().await;
        guard.snapshot.clone()
    }

    pub async fn today_activity_count(&self) -> u64 {
        let key = self.today_key();
        let guard = self.store.read().await;
        guard
            .snapshot
            .activity_by_day
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    /// Newest first.
    pub async fn recent_own_texts(&self, limit: usize) -> Vec<String> {
        let guard = self.store.read().await;
        guard
            .snapshot
            .recent_posts
            .iter()
            .take(limit)
            .map(|record| record.text.clone())
            .collect()
    }

    /// Newest first.
    pub async fn recent_posts(&self, limit: usize) -> Vec<PostRecord> {
        let guard = self.store.read().await;
        guard.snapshot.recent_posts.iter().take(limit).cloned().collect()
    }

    pub async fn lane_usage(&self, window: usize) -> LaneUsage {
        let guard = self.store.read().await;
        LaneUsage::from_lanes(
            guard
                .snapshot
                .recent_posts
                .iter()
                .take(window)
                .map(|record| record.lane),
        )
    }

    pub async fn source_trust(&self, source: &str) -> f64 {
        let guard = self.store.read().await;
        guard
            .snapshot
            .source_trust
            .get(source)
            .copied()
            .unwrap_or(DEFAULT_SOURCE_TRUST)
    }

    pub async fn apply_source_trust_deltas(&self, deltas: &BTreeMap<String, f64>) {
        if deltas.is_empty() {
            return;
        }
        let mut guard = self.store.write().await;
        for (source, delta) in deltas {
            let current = guard
                .snapshot
                .source_trust
                .get(source)
                .copied()
                .unwrap_or(DEFAULT_SOURCE_TRUST);
            let next = (current + delta).clamp(SOURCE_TRUST_MIN, SOURCE_TRUST_MAX);
            guard.snapshot.source_trust.insert(source.clone(), next);
            self.bus.publish(
                topics::TOPIC_SOURCE_TRUST_UPDATED,
                &json!({"source": source, "trust": next}),
            );
        }
        guard.dirty = true;
    }

    /// Newest first.
    pub async fn recent_nutrient_ledger(&self, limit: usize) -> Vec<NutrientLedgerEntry> {
        let guard = self.store.read().await;
        guard
            .snapshot
            .nutrient_ledger
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn record_nutrient_batch_intake(&self, entries: Vec<NutrientLedgerEntry>) {
        if entries.is_empty() {
            return;
        }
        let mut guard = self.store.write().await;
        for entry in entries.into_iter().rev() {
            guard.snapshot.nutrient_ledger.insert(0, entry);
        }
        guard.snapshot.nutrient_ledger.truncate(LEDGER_WINDOW);
        guard.dirty = true;
    }

    pub async fn today_post_generation_metrics(&self) -> PostGenerationMetrics {
        let key = self.today_key();
        let guard = self.store.read().await;
        guard
            .snapshot
            .metrics_by_day
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    /// Aggregate over the trailing `days` of per-day metrics, today included.
    pub async fn trailing_post_metrics(&self, days: i64) -> PostGenerationMetrics {
        let now = self.clock.now_utc();
        let cutoff = util::local_date_key(&self.timezone, now - Duration::days(days.max(0)));
        let guard = self.store.read().await;
        let mut aggregate = PostGenerationMetrics::default();
        for (day, metrics) in &guard.snapshot.metrics_by_day {
            if day.as_str() > cutoff.as_str() {
                aggregate.absorb(metrics);
            }
        }
        aggregate
    }

    pub async fn record_post_generation(&self, outcome: &PostGenerationOutcome) {
        let key = self.today_key();
        let mut guard = self.store.write().await;
        {
            let metrics = guard.snapshot.metrics_by_day.entry(key).or_default();
            metrics.post_runs += 1;
            if outcome.success {
                metrics.post_successes += 1;
            } else {
                metrics.post_failures += 1;
            }
            metrics.total_retries += outcome.retries;
            if outcome.fallback_used {
                metrics.fallback_used += 1;
            }
            for reason in &outcome.fail_reasons {
                *metrics.fail_reasons.entry(reason.clone()).or_insert(0) += 1;
            }
        }
        self.prune_days(&mut guard);
        guard.dirty = true;
    }

    pub async fn record_own_post(&self, text: String, lane: Lane, mode: Option<NarrativeMode>) {
        let record = PostRecord {
            text,
            lane,
            mode,
            posted_at: self.clock.now_utc(),
        };
        let mut guard = self.store.write().await;
        guard.snapshot.recent_posts.insert(0, record);
        guard.snapshot.recent_posts.truncate(POST_WINDOW);
        guard.dirty = true;
    }

    /// Counts one executed action (post or reply) toward today's quota.
    pub async fn record_activity(&self) {
        let key = self.today_key();
        let mut guard = self.store.write().await;
        *guard.snapshot.activity_by_day.entry(key).or_insert(0) += 1;
        self.prune_days(&mut guard);
        guard.dirty = true;
    }

    fn prune_days(&self, guard: &mut MemoryState) {
        let cutoff = util::local_date_key(
            &self.timezone,
            self.clock.now_utc() - Duration::days(METRICS_RETENTION_DAYS),
        );
        guard
            .snapshot
            .metrics_by_day
            .retain(|day, _| day.as_str() >= cutoff.as_str());
        guard
            .snapshot
            .activity_by_day
            .retain(|day, _| day.as_str() >= cutoff.as_str());
    }

    /// Commit boundary: persists when dirty and announces the flush. A clean
    /// store is a no-op.
    pub async fn flush(&self) {
        let snapshot = {
            let mut guard = self.store.write().await;
            if !guard.dirty {
                return;
            }
            let next_version = guard.version.saturating_add(1);
            guard.version = next_version;
            guard.snapshot.version = next_version;
            guard.snapshot.generated = Some(
                self.clock
                    .now_utc()
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            );
            guard.dirty = false;
            guard.snapshot.clone()
        };
        self.persist(&snapshot).await;
        let mut payload = json!({
            "version": snapshot.version,
            "recent_posts": snapshot.recent_posts.len(),
            "ledger_entries": snapshot.nutrient_ledger.len(),
        });
        responses::attach_corr(&mut payload);
        self.bus.publish(topics::TOPIC_MEMORY_FLUSHED, &payload);
    }

    async fn persist(&self, snapshot: &TelemetrySnapshot) {
        let Some(path) = self.path.as_ref() else {
            return;
        };
        if let Some(parent) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                warn!(error = %err, "failed to create telemetry directory");
                return;
            }
        }
        match serde_json::to_vec_pretty(snapshot) {
            Ok(bytes) => {
                if let Err(err) = tokio::fs::write(path, bytes).await {
                    warn!(error = %err, path = %path.display(), "failed to persist telemetry");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize telemetry snapshot"),
        }
    }

    async fn load_from_disk(self: &Arc<Self>) {
        let Some(path) = self.path.as_ref() else {
            return;
        };
        match Self::read_snapshot_from_path(path).await {
            Ok(snapshot) => {
                let mut guard = self.store.write().await;
                guard.version = snapshot.version;
                guard.snapshot = snapshot;
            }
            Err(err) => warn!(
                error = %err,
                path = %path.display(),
                "failed to load telemetry snapshot; starting empty"
            ),
        }
    }

    async fn read_snapshot_from_path(path: &Path) -> Result<TelemetrySnapshot> {
        if !path.exists() {
            return Ok(TelemetrySnapshot::default());
        }
        let bytes = tokio::fs::read(path).await?;
        if bytes.is_empty() {
            return Ok(TelemetrySnapshot::default());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::NutrientSource;
    use crate::test_support::clock::ManualClock;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn manual_clock() -> Arc<ManualClock> {
        ManualClock::at(Utc.with_ymd_and_hms(2025, 11, 3, 4, 0, 0).single().expect("ts"))
    }

    fn ledger_entry(id: &str) -> NutrientLedgerEntry {
        NutrientLedgerEntry {
            id: id.to_string(),
            source: NutrientSource::Onchain,
            category: "exchange-flows".to_string(),
            label: "netflow".to_string(),
            value: "-4200 BTC".to_string(),
            digest_score: 0.8,
            xp_gain: 9,
            recorded_at: Utc.with_ymd_and_hms(2025, 11, 3, 3, 0, 0).single().expect("ts"),
        }
    }

    #[tokio::test]
    async fn posts_are_newest_first_and_bounded() {
        let memory = MemoryService::new(Bus::new(8), manual_clock(), "+09:00");
        for i in 0..(POST_WINDOW + 5) {
            memory
                .record_own_post(format!("글 {i}"), Lane::Onchain, None)
                .await;
        }
        let texts = memory.recent_own_texts(3).await;
        assert_eq!(texts[0], format!("글 {}", POST_WINDOW + 4));
        let all = memory.recent_posts(usize::MAX).await;
        assert_eq!(all.len(), POST_WINDOW);
    }

    #[tokio::test]
    async fn activity_counts_roll_with_the_local_day() {
        let clock = manual_clock();
        let memory = MemoryService::new(Bus::new(8), clock.clone(), "+09:00");
        memory.record_activity().await;
        memory.record_activity().await;
        assert_eq!(memory.today_activity_count().await, 2);
        clock.advance(Duration::days(1));
        assert_eq!(memory.today_activity_count().await, 0);
    }

    #[tokio::test]
    async fn source_trust_defaults_and_clamps() {
        let memory = MemoryService::new(Bus::new(8), manual_clock(), "+09:00");
        assert!((memory.source_trust("coindesk").await - DEFAULT_SOURCE_TRUST).abs() < 1e-9);
        let deltas = BTreeMap::from([
            ("coindesk".to_string(), 0.05),
            ("randomblog".to_string(), -0.9),
        ]);
        memory.apply_source_trust_deltas(&deltas).await;
        assert!((memory.source_trust("coindesk").await - 0.65).abs() < 1e-9);
        assert!((memory.source_trust("randomblog").await - SOURCE_TRUST_MIN).abs() < 1e-9);
    }

    #[tokio::test]
    async fn generation_metrics_accumulate_per_day() {
        let memory = MemoryService::new(Bus::new(8), manual_clock(), "+09:00");
        memory
            .record_post_generation(&PostGenerationOutcome {
                success: true,
                retries: 1,
                fallback_used: false,
                fail_reasons: vec!["duplicate-content".to_string()],
            })
            .await;
        memory
            .record_post_generation(&PostGenerationOutcome {
                success: false,
                retries: 2,
                fallback_used: true,
                fail_reasons: vec!["duplicate-content".to_string()],
            })
            .await;
        let metrics = memory.today_post_generation_metrics().await;
        assert_eq!(metrics.post_runs, 2);
        assert_eq!(metrics.post_successes, 1);
        assert_eq!(metrics.post_failures, 1);
        assert_eq!(metrics.total_retries, 3);
        assert_eq!(metrics.fallback_used, 1);
        assert_eq!(metrics.fail_reasons.get("duplicate-content"), Some(&2));
    }

    #[tokio::test]
    async fn trailing_metrics_cover_recent_days_only() {
        let clock = manual_clock();
        let memory = MemoryService::new(Bus::new(8), clock.clone(), "+09:00");
        memory
            .record_post_generation(&PostGenerationOutcome {
                success: true,
                ..PostGenerationOutcome::default()
            })
            .await;
        clock.advance(Duration::days(2));
        memory
            .record_post_generation(&PostGenerationOutcome {
                success: false,
                ..PostGenerationOutcome::default()
            })
            .await;
        let trailing = memory.trailing_post_metrics(3).await;
        assert_eq!(trailing.post_runs, 2);
        let tight = memory.trailing_post_metrics(1).await;
        assert_eq!(tight.post_runs, 1);
        assert_eq!(tight.post_failures, 1);
    }

    #[tokio::test]
    async fn old_metric_days_are_pruned() {
        let clock = manual_clock();
        let memory = MemoryService::new(Bus::new(8), clock.clone(), "+09:00");
        memory.record_activity().await;
        clock.advance(Duration::days(METRICS_RETENTION_DAYS + 2));
        memory.record_activity().await;
        let snapshot = memory.snapshot().await;
        assert_eq!(snapshot.activity_by_day.len(), 1);
    }

    #[tokio::test]
    async fn ledger_window_is_bounded() {
        let memory = MemoryService::new(Bus::new(8), manual_clock(), "+09:00");
        let batch: Vec<NutrientLedgerEntry> =
            (0..LEDGER_WINDOW + 10).map(|i| ledger_entry(&format!("n{i}"))).collect();
        memory.record_nutrient_batch_intake(batch).await;
        let ledger = memory.recent_nutrient_ledger(usize::MAX).await;
        assert_eq!(ledger.len(), LEDGER_WINDOW);
        assert_eq!(ledger[0].id, "n0");
    }

    #[tokio::test]
    async fn lane_usage_derives_from_recent_posts() {
        let memory = MemoryService::new(Bus::new(8), manual_clock(), "+09:00");
        for _ in 0..3 {
            memory
                .record_own_post("온체인 글".to_string(), Lane::Onchain, None)
                .await;
        }
        memory
            .record_own_post("거시 글".to_string(), Lane::Macro, None)
            .await;
        let usage = memory.lane_usage(10).await;
        assert_eq!(usage.total_posts, 4);
        assert_eq!(usage.by_lane.get(&Lane::Onchain), Some(&3));
    }

    #[tokio::test]
    async fn flush_persists_only_when_dirty() {
        let bus = Bus::new_with_replay(8, 8);
        let mut subscriber = bus.subscribe();
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("herald").join("telemetry.json");
        let memory =
            MemoryService::with_state_path(bus.clone(), manual_clock(), "+09:00", path.clone())
                .await;

        memory.flush().await;
        assert!(!path.exists(), "clean store should not write");

        memory
            .record_own_post("첫 글".to_string(), Lane::Onchain, Some(NarrativeMode::DataBrief))
            .await;
        memory.flush().await;
        let event = subscriber.recv().await.expect("flush event");
        assert_eq!(event.kind, topics::TOPIC_MEMORY_FLUSHED);
        assert!(path.exists());

        // Reload round-trips the snapshot.
        let reloaded =
            MemoryService::with_state_path(Bus::new(8), manual_clock(), "+09:00", path).await;
        let posts = reloaded.recent_posts(10).await;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].mode, Some(NarrativeMode::DataBrief));
    }
}

//! Daily spend and request-rate ledger.
//!
//! Tracks per-day request counts, per-kind pacing timestamps, and estimated
//! USD spend across a 21-day window. Admission checks are pure reads that
//! return a typed [`AdmissionDecision`]; only the record calls mutate,
//! persist, and publish. Bucket keys follow the configured fixed offset so
//! the quota day rolls over at local midnight.

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
use crate::responses;
use crate::util;

/// Days of per-day buckets kept before pruning.
const RETENTION_DAYS: i64 = 21;
/// Slack for floating-point USD comparisons.
const USD_EPSILON: f64 = 1e-6;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BudgetClass {
    Read,
    Create,
}

impl BudgetClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetClass::Read => "read",
            BudgetClass::Create => "create",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BlockReason {
    MinInterval,
    DailyRequestLimit,
    DailyUsdLimit,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::MinInterval => "min-interval",
            BlockReason::DailyRequestLimit => "daily-request-limit",
            BlockReason::DailyUsdLimit => "daily-usd-limit",
        }
    }
}

/// Outcome of an admission check. A block is a normal value, not an error.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<BlockReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_seconds: Option<u64>,
    pub projected_cost_usd: f64,
    pub remaining_requests: u64,
}

impl AdmissionDecision {
    fn allowed(projected_cost_usd: f64, remaining_requests: u64) -> Self {
        Self {
            allowed: true,
            block_reason: None,
            wait_seconds: None,
            projected_cost_usd,
            remaining_requests,
        }
    }

    fn blocked(
        reason: BlockReason,
        wait_seconds: Option<u64>,
        projected_cost_usd: f64,
        remaining_requests: u64,
    ) -> Self {
        Self {
            allowed: false,
            block_reason: Some(reason),
            wait_seconds,
            projected_cost_usd,
            remaining_requests,
        }
    }
}

/// Everything an admission check needs, pre-resolved from config per kind.
#[derive(Clone, Debug)]
pub struct BudgetCheckPolicy {
    pub enabled: bool,
    pub timezone: String,
    pub daily_max_usd: f64,
    pub estimated_cost_usd: f64,
    pub daily_request_limit: u64,
    pub kind: String,
    pub min_interval_minutes: u64,
}

/// Per-calendar-day usage counters. `est_total_cost_usd` always equals the
/// sum of the read and create accumulators.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct BudgetBucket {
    pub date_key: String,
    pub read_requests: u64,
    pub create_requests: u64,
    pub est_read_cost_usd: f64,
    pub est_create_cost_usd: f64,
    pub est_total_cost_usd: f64,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counts_by_kind: BTreeMap<String, u64>,
}

impl BudgetBucket {
    fn class_requests(&self, class: BudgetClass) -> u64 {
        match class {
            BudgetClass::Read => self.read_requests,
            BudgetClass::Create => self.create_requests,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BudgetSnapshot {
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub days: BTreeMap<String, BudgetBucket>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub last_request_at: BTreeMap<String, DateTime<Utc>>,
}

impl Default for BudgetSnapshot {
    fn default() -> Self {
        Self {
            version: 0,
            generated: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            days: BTreeMap::new(),
            last_request_at: BTreeMap::new(),
        }
    }
}

#[derive(Default)]
struct BudgetLedgerState {
    version: u64,
    snapshot: BudgetSnapshot,
}

pub struct BudgetLedger {
    store: RwLock<BudgetLedgerState>,
    bus: Bus,
    clock: Arc<dyn Clock>,
    path: Option<PathBuf>,
}

impl BudgetLedger {
    #[allow(dead_code)]
    pub fn new(bus: Bus, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            store: RwLock::new(BudgetLedgerState::default()),
            bus,
            clock,
            path: None,
        })
    }

    pub async fn with_state_path(bus: Bus, clock: Arc<dyn Clock>, path: PathBuf) -> Arc<Self> {
        let ledger = Arc::new(Self {
            store: RwLock::new(BudgetLedgerState::default()),
            bus,
            clock,
            path: Some(path),
        });
        ledger.load_from_disk().await;
        ledger
    }

    pub async fn snapshot(&self) -> BudgetSnapshot {
        let guard = self.store.read().await;
        guard.snapshot.clone()
    }

    pub async fn check_read_allowance(&self, policy: &BudgetCheckPolicy) -> AdmissionDecision {
        self.check(policy, BudgetClass::Read).await
    }

    pub async fn check_create_allowance(&self, policy: &BudgetCheckPolicy) -> AdmissionDecision {
        self.check(policy, BudgetClass::Create).await
    }

    pub async fn record_read(&self, policy: &BudgetCheckPolicy) {
        self.record(policy, BudgetClass::Read).await;
    }

    pub async fn record_create(&self, policy: &BudgetCheckPolicy) {
        self.record(policy, BudgetClass::Create).await;
    }

    /// Today's bucket in the given timezone, empty if nothing was recorded yet.
    pub async fn today_usage(&self, timezone: &str) -> BudgetBucket {
        let date_key = util::local_date_key(timezone, self.clock.now_utc());
        let guard = self.store.read().await;
        guard
            .snapshot
            .days
            .get(&date_key)
            .cloned()
            .unwrap_or_else(|| BudgetBucket {
                date_key,
                ..BudgetBucket::default()
            })
    }

    /// Pure admission check. Checks run in a fixed order so the same state
    /// always yields the same reason: pacing, then request count, then spend.
    /// A zero `min_interval_minutes` or `daily_request_limit` disables the
    /// respective rule.
    async fn check(&self, policy: &BudgetCheckPolicy, class: BudgetClass) -> AdmissionDecision {
        let now = self.clock.now_utc();
        let date_key = util::local_date_key(&policy.timezone, now);
        let guard = self.store.read().await;
        let bucket = guard.snapshot.days.get(&date_key).cloned().unwrap_or_default();
        let projected = bucket.est_total_cost_usd + policy.estimated_cost_usd;
        let remaining = policy
            .daily_request_limit
            .saturating_sub(bucket.class_requests(class));

        if !policy.enabled {
            return AdmissionDecision::allowed(projected, remaining);
        }

        if policy.min_interval_minutes > 0 {
            if let Some(last) = guard.snapshot.last_request_at.get(&policy.kind) {
                let elapsed = now.signed_duration_since(*last);
                let required = Duration::minutes(policy.min_interval_minutes as i64);
                if elapsed < required {
                    let millis = (required - elapsed).num_milliseconds().max(0) as u64;
                    let wait = millis.div_ceil(1_000).max(1);
                    return AdmissionDecision::blocked(
                        BlockReason::MinInterval,
                        Some(wait),
                        projected,
                        remaining,
                    );
                }
            }
        }

        if policy.daily_request_limit > 0
            && bucket.class_requests(class) >= policy.daily_request_limit
        {
            return AdmissionDecision::blocked(
                BlockReason::DailyRequestLimit,
                None,
                projected,
                0,
            );
        }
        if projected > policy.daily_max_usd + USD_EPSILON {
            return AdmissionDecision::blocked(
                BlockReason::DailyUsdLimit,
                None,
                projected,
                remaining,
            );
        }
        AdmissionDecision::allowed(projected, remaining)
    }

    /// Records an executed request: bumps the bucket counters, stamps the
    /// kind's pacing timestamp, prunes expired buckets, persists, publishes.
    async fn record(&self, policy: &BudgetCheckPolicy, class: BudgetClass) {
        let now = self.clock.now_utc();
        let date_key = util::local_date_key(&policy.timezone, now);

        let mut guard = self.store.write().await;
        let next_version = guard.version.saturating_add(1);
        guard.version = next_version;
        guard.snapshot.version = next_version;
        guard.snapshot.generated = Some(now.to_rfc3339_opts(SecondsFormat::Millis, true));
        let published_bucket = {
            let bucket = guard
                .snapshot
                .days
                .entry(date_key.clone())
                .or_insert_with(|| BudgetBucket {
                    date_key: date_key.clone(),
                    ..BudgetBucket::default()
                });
            match class {
                BudgetClass::Read => {
                    bucket.read_requests += 1;
                    bucket.est_read_cost_usd += policy.estimated_cost_usd;
                }
                BudgetClass::Create => {
                    bucket.create_requests += 1;
                    bucket.est_create_cost_usd += policy.estimated_cost_usd;
                }
            }
            bucket.est_total_cost_usd = bucket.est_read_cost_usd + bucket.est_create_cost_usd;
            *bucket.counts_by_kind.entry(policy.kind.clone()).or_insert(0) += 1;
            bucket.clone()
        };
        guard
            .snapshot
            .last_request_at
            .insert(policy.kind.clone(), now);
        let cutoff =
            util::local_date_key(&policy.timezone, now - Duration::days(RETENTION_DAYS));
        guard.snapshot.days.retain(|key, _| key.as_str() >= cutoff.as_str());
        let snapshot = guard.snapshot.clone();
        drop(guard);

        self.persist(&snapshot).await;
        let mut recorded = json!({
            "kind": policy.kind,
            "class": class.as_str(),
            "day": published_bucket.date_key,
            "usd_spent": published_bucket.est_total_cost_usd,
            "requests": published_bucket.class_requests(class),
        });
        responses::attach_corr(&mut recorded);
        self.bus.publish(topics::TOPIC_BUDGET_RECORDED, &recorded);
        self.publish(&snapshot);
    }

    fn publish(&self, snapshot: &BudgetSnapshot) {
        if let Ok(mut payload) = serde_json::to_value(snapshot) {
            responses::attach_corr(&mut payload);
            self.bus
                .publish(topics::TOPIC_BUDGET_LEDGER_UPDATED, &payload);
        } else {
            let mut payload = json!({"version": snapshot.version});
            responses::attach_corr(&mut payload);
            self.bus
                .publish(topics::TOPIC_BUDGET_LEDGER_UPDATED, &payload);
        }
    }

    async fn persist(&self, snapshot: &BudgetSnapshot) {
        let Some(path) = self.path.as_ref() else {
            return;
        };
        if let Some(parent) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                warn!(error = %err, "failed to create budget ledger directory");
                return;
            }
        }
        match serde_json::to_vec_pretty(snapshot) {
            Ok(bytes) => {
                if let Err(err) = tokio::fs::write(path, bytes).await {
                    warn!(error = %err, path = %path.display(), "failed to persist budget ledger");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize budget ledger snapshot"),
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
                "failed to load budget ledger snapshot; using defaults"
            ),
        }
    }

    async fn read_snapshot_from_path(path: &Path) -> Result<BudgetSnapshot> {
        if !path.exists() {
            return Ok(BudgetSnapshot::default());
        }
        let bytes = tokio::fs::read(path).await?;
        if bytes.is_empty() {
            return Ok(BudgetSnapshot::default());
        }
        let mut snapshot: BudgetSnapshot = serde_json::from_slice(&bytes)?;
        if snapshot.generated.is_none() {
            snapshot.generated = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        }
        Ok(snapshot)
    }
}

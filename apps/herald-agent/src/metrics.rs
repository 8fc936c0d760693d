//! In-process counters summarizing engine activity.
//!
//! The hub keeps its own summary (consumed by the cycle report and tests) and
//! mirrors the interesting points onto the `metrics` facade for whatever
//! exporter the deployment installs.

use metrics::counter;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[derive(Clone, Serialize)]
pub struct EventsSummary {
    pub start: String,
    pub total: u64,
    pub kinds: BTreeMap<String, u64>,
}

struct EventStats {
    start: String,
    total: u64,
    kinds: BTreeMap<String, u64>,
}

impl EventStats {
    fn new() -> Self {
        Self {
            start: now_rfc3339(),
            total: 0,
            kinds: BTreeMap::new(),
        }
    }

    fn record(&mut self, kind: &str) {
        self.total = self.total.saturating_add(1);
        if !kind.is_empty() {
            *self.kinds.entry(kind.to_string()).or_default() += 1;
        }
    }

    fn summary(&self) -> EventsSummary {
        EventsSummary {
            start: self.start.clone(),
            total: self.total,
            kinds: self.kinds.clone(),
        }
    }
}

#[derive(Clone, Serialize, Default)]
pub struct TaskStatus {
    pub started: u64,
    pub completed: u64,
    pub aborted: u64,
    pub restarts_window: u64,
}

#[derive(Clone, Serialize, Default)]
pub struct EngineSummary {
    pub cycles_completed: u64,
    pub posts_dispatched: u64,
    pub replies_dispatched: u64,
    pub dispatch_failures: u64,
    pub gate_rejections: BTreeMap<String, u64>,
    pub admission_blocks: BTreeMap<String, u64>,
    pub governor_blocks: BTreeMap<String, u64>,
}

#[derive(Clone, Serialize)]
pub struct MetricsSummary {
    pub events: EventsSummary,
    pub tasks: BTreeMap<String, TaskStatus>,
    pub engine: EngineSummary,
}

pub struct Metrics {
    events: Mutex<EventStats>,
    tasks: Mutex<BTreeMap<String, TaskStatus>>,
    engine: Mutex<EngineSummary>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(EventStats::new()),
            tasks: Mutex::new(BTreeMap::new()),
            engine: Mutex::new(EngineSummary::default()),
        }
    }

    pub fn record_event(&self, kind: &str) {
        if let Ok(mut stats) = self.events.lock() {
            stats.record(kind);
        }
    }

    pub fn task_started(&self, name: &str) {
        if let Ok(mut map) = self.tasks.lock() {
            map.entry(name.to_string()).or_default().started += 1;
        }
    }

    pub fn task_completed(&self, name: &str) {
        if let Ok(mut map) = self.tasks.lock() {
            map.entry(name.to_string()).or_default().completed += 1;
        }
    }

    pub fn task_aborted(&self, name: &str) {
        if let Ok(mut map) = self.tasks.lock() {
            map.entry(name.to_string()).or_default().aborted += 1;
        }
    }

    pub fn task_restarts_window_set(&self, name: &str, count: u64) {
        if let Ok(mut map) = self.tasks.lock() {
            map.entry(name.to_string()).or_default().restarts_window = count;
        }
    }

    pub fn cycle_completed(&self) {
        if let Ok(mut engine) = self.engine.lock() {
            engine.cycles_completed += 1;
        }
        counter!("herald_cycles_total").increment(1);
    }

    pub fn dispatch_completed(&self, kind: &str) {
        if let Ok(mut engine) = self.engine.lock() {
            match kind {
                "post" => engine.posts_dispatched += 1,
                _ => engine.replies_dispatched += 1,
            }
        }
        counter!("herald_dispatch_total", "kind" => kind.to_string()).increment(1);
    }

    pub fn dispatch_failed(&self) {
        if let Ok(mut engine) = self.engine.lock() {
            engine.dispatch_failures += 1;
        }
        counter!("herald_dispatch_failures_total").increment(1);
    }

    pub fn gate_rejected(&self, reason: &str) {
        if let Ok(mut engine) = self.engine.lock() {
            *engine.gate_rejections.entry(reason.to_string()).or_default() += 1;
        }
        counter!("herald_gate_rejections_total", "reason" => reason.to_string()).increment(1);
    }

    pub fn admission_blocked(&self, reason: &str) {
        if let Ok(mut engine) = self.engine.lock() {
            *engine.admission_blocks.entry(reason.to_string()).or_default() += 1;
        }
        counter!("herald_admission_blocks_total", "reason" => reason.to_string()).increment(1);
    }

    pub fn governor_blocked(&self, reason: &str) {
        if let Ok(mut engine) = self.engine.lock() {
            *engine.governor_blocks.entry(reason.to_string()).or_default() += 1;
        }
        counter!("herald_governor_blocks_total", "reason" => reason.to_string()).increment(1);
    }

    pub fn summary(&self) -> MetricsSummary {
        let events = self
            .events
            .lock()
            .map(|stats| stats.summary())
            .unwrap_or_else(|_| EventStats::new().summary());
        let tasks = self
            .tasks
            .lock()
            .map(|map| map.clone())
            .unwrap_or_default();
        let engine = self
            .engine
            .lock()
            .map(|engine| engine.clone())
            .unwrap_or_default();
        MetricsSummary {
            events,
            tasks,
            engine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_counts_accumulate_by_kind() {
        let metrics = Metrics::new();
        metrics.record_event("cycle.completed");
        metrics.record_event("cycle.completed");
        metrics.record_event("budget.recorded");
        let summary = metrics.summary();
        assert_eq!(summary.events.total, 3);
        assert_eq!(summary.events.kinds.get("cycle.completed"), Some(&2));
    }

    #[test]
    fn task_lifecycle_is_tracked_by_name() {
        let metrics = Metrics::new();
        metrics.task_started("scheduler");
        metrics.task_restarts_window_set("scheduler", 2);
        metrics.task_completed("scheduler");
        let summary = metrics.summary();
        let status = summary.tasks.get("scheduler").expect("scheduler status");
        assert_eq!(status.started, 1);
        assert_eq!(status.completed, 1);
        assert_eq!(status.restarts_window, 2);
    }

    #[test]
    fn engine_counters_split_dispatch_kinds_and_reasons() {
        let metrics = Metrics::new();
        metrics.dispatch_completed("post");
        metrics.dispatch_completed("reply");
        metrics.dispatch_completed("post");
        metrics.gate_rejected("duplicate-content");
        metrics.admission_blocked("daily-usd-limit");
        metrics.governor_blocked("post_language_not_korean");
        let summary = metrics.summary();
        assert_eq!(summary.engine.posts_dispatched, 2);
        assert_eq!(summary.engine.replies_dispatched, 1);
        assert_eq!(
            summary.engine.gate_rejections.get("duplicate-content"),
            Some(&1)
        );
        assert_eq!(
            summary.engine.admission_blocks.get("daily-usd-limit"),
            Some(&1)
        );
        assert_eq!(
            summary.engine.governor_blocks.get("post_language_not_korean"),
            Some(&1)
        );
    }
}

//! Background task supervision and graceful shutdown.

use futures_util::FutureExt;
use once_cell::sync::OnceCell;
use std::{
    borrow::Cow,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::metrics::Metrics;

#[derive(Debug)]
pub struct TaskHandle {
    name: Cow<'static, str>,
    handle: JoinHandle<()>,
    started_recorded: bool,
}

impl TaskHandle {
    pub fn new(name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
            started_recorded: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn mark_started(&mut self) {
        self.started_recorded = true;
    }

    fn into_inner(self) -> (Cow<'static, str>, bool, JoinHandle<()>) {
        (self.name, self.started_recorded, self.handle)
    }
}

#[derive(Default)]
pub struct TaskManager {
    tasks: Vec<TaskHandle>,
    metrics: Option<Arc<Metrics>>,
}

impl TaskManager {
    pub fn with_metrics(metrics: Arc<Metrics>) -> Self {
        register_global_metrics(metrics.clone());
        Self {
            tasks: Vec::new(),
            metrics: Some(metrics),
        }
    }

    pub fn push(&mut self, mut task: TaskHandle) {
        trace!(task = task.name(), "task registered");
        if let Some(metrics) = &self.metrics {
            metrics.task_started(task.name());
            task.mark_started();
        }
        self.tasks.push(task);
    }

    #[allow(dead_code)]
    pub fn push_handle(&mut self, name: impl Into<Cow<'static, str>>, handle: JoinHandle<()>) {
        self.push(TaskHandle::new(name, handle));
    }

    pub async fn shutdown_with_grace(self, grace: Duration) {
        let metrics = self.metrics.clone();
        for task in self.tasks {
            let (name_cow, started_recorded, mut handle) = task.into_inner();
            let name = name_cow.into_owned();
            let record_outcome = |outcome: TaskOutcome| {
                if started_recorded {
                    if let Some(metrics) = &metrics {
                        match outcome {
                            TaskOutcome::Completed => metrics.task_completed(&name),
                            TaskOutcome::Aborted => metrics.task_aborted(&name),
                        }
                    }
                }
            };

            if grace.is_zero() {
                handle.abort();
                let result = handle.await;
                let outcome = if result.is_ok() {
                    TaskOutcome::Completed
                } else {
                    debug!(task = %name, ?result, "task join after abort failed");
                    TaskOutcome::Aborted
                };
                record_outcome(outcome);
                continue;
            }

            let sleeper = tokio::time::sleep(grace);
            tokio::pin!(sleeper);
            let outcome = tokio::select! {
                res = &mut handle => {
                    if let Err(err) = res {
                        debug!(task = %name, ?err, "task exited with error");
                        TaskOutcome::Aborted
                    } else {
                        TaskOutcome::Completed
                    }
                }
                _ = &mut sleeper => {
                    handle.abort();
                    match handle.await {
                        Ok(_) => TaskOutcome::Completed,
                        Err(err) => {
                            debug!(task = %name, ?err, "task join after abort failed");
                            TaskOutcome::Aborted
                        }
                    }
                }
            };
            record_outcome(outcome);
        }
    }
}

enum TaskOutcome {
    Completed,
    Aborted,
}

/// Spawn a background task that restarts on panic with exponential backoff.
/// Use for long-running loops that should survive transient failures.
pub fn spawn_supervised<F, Fut>(name: impl Into<Cow<'static, str>>, mut factory: F) -> TaskHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let name_cow = name.into();
    let name_for_task = name_cow.clone();
    let handle = tokio::spawn(async move {
        let mut backoff_ms: u64 = 200;
        // Thrash detection window
        let window = Duration::from_secs(30);
        let mut window_start = Instant::now();
        let mut restarts_in_window: u32 = 0;
        loop {
            // Catch panics from the future body to keep the supervisor alive.
            let result = std::panic::AssertUnwindSafe(factory()).catch_unwind().await;
            match result {
                Ok(()) => {
                    debug!(task = %name_for_task, "supervised task completed normally");
                    break;
                }
                Err(payload) => {
                    let now = Instant::now();
                    if now.duration_since(window_start) > window {
                        window_start = now;
                        restarts_in_window = 0;
                    }
                    restarts_in_window = restarts_in_window.saturating_add(1);
                    if let Some(weak) = GLOBAL_METRICS.get() {
                        if let Some(metrics) = weak.upgrade() {
                            metrics.task_restarts_window_set(
                                &name_for_task,
                                restarts_in_window as u64,
                            );
                        }
                    }
                    error!(task = %name_for_task, backoff_ms, restarts_in_window, "supervised task panicked; restarting");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms.saturating_mul(2)).min(10_000);
                    let _ = payload;
                }
            }
        }
    });
    TaskHandle::new(name_cow, handle)
}

static GLOBAL_METRICS: OnceCell<Weak<Metrics>> = OnceCell::new();

fn register_global_metrics(metrics: Arc<Metrics>) {
    let _ = GLOBAL_METRICS.set(Arc::downgrade(&metrics));
}

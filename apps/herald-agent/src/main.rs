use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

mod actions;
mod app_state;
mod autonomy;
mod budget;
mod clock;
mod config;
mod connectors;
mod digest;
mod market;
mod memory;
mod metrics;
mod narrative;
mod planner;
mod policy;
mod quality;
mod responses;
mod scheduler;
mod tasks;
#[cfg(test)]
mod test_support;
mod trend;
mod util;

pub(crate) use app_state::AppState;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(filter))
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = config::Config::from_env();
    let bus = herald_events::Bus::new_with_replay(256, 64);
    let metrics = Arc::new(metrics::Metrics::new());
    let state = AppState::builder(bus.clone(), config)
        .with_metrics(metrics.clone())
        .build()
        .await;

    let mut background_tasks = tasks::TaskManager::with_metrics(metrics.clone());
    background_tasks.push(spawn_event_meter(bus, metrics));
    background_tasks.push(scheduler::start(state.clone()));

    info!(
        daily_target = state.config().daily_target,
        dry_run = state.config().dry_run,
        "herald agent running"
    );

    shutdown_signal().await;

    info!("shutting down background tasks");
    state.memory().flush().await;
    background_tasks
        .shutdown_with_grace(Duration::from_secs(5))
        .await;
}

/// Mirrors every bus envelope into the metrics hub.
fn spawn_event_meter(bus: herald_events::Bus, metrics: Arc<metrics::Metrics>) -> tasks::TaskHandle {
    tasks::spawn_supervised("bus.meter", move || {
        let bus = bus.clone();
        let metrics = metrics.clone();
        async move {
            let mut rx = bus.subscribe();
            loop {
                match rx.recv().await {
                    Ok(env) => metrics.record_event(&env.kind),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "event meter lagged behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    })
}

async fn shutdown_signal() {
    info!("shutdown signal listener active");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}

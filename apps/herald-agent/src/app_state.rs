use std::sync::Arc;

use herald_events::Bus;

use crate::budget::BudgetLedger;
use crate::clock::{self, Clock, Sleeper};
use crate::config::Config;
use crate::connectors::{
    DispatchClient, DryRunDispatch, NoopGenerator, OfflineSignals, SignalSource, TextGenerator,
};
use crate::memory::MemoryService;
use crate::metrics::Metrics;
use crate::policy::PolicyHub;
use crate::util;

/// Shared handles for one agent process. Cloning is cheap; every field is a
/// handle.
#[derive(Clone)]
pub(crate) struct AppState {
    bus: Bus,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    metrics: Arc<Metrics>,
    budget: Arc<BudgetLedger>,
    memory: Arc<MemoryService>,
    policy: Arc<PolicyHub>,
    signals: Arc<dyn SignalSource>,
    generator: Arc<dyn TextGenerator>,
    dispatcher: Arc<dyn DispatchClient>,
}

impl AppState {
    pub(crate) fn builder(bus: Bus, config: Config) -> AppStateBuilder {
        AppStateBuilder {
            bus,
            config,
            clock: None,
            sleeper: None,
            metrics: None,
            budget: None,
            memory: None,
            policy: None,
            signals: None,
            generator: None,
            dispatcher: None,
        }
    }

    pub(crate) fn bus(&self) -> &Bus {
        &self.bus
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub(crate) fn sleeper(&self) -> Arc<dyn Sleeper> {
        self.sleeper.clone()
    }

    pub(crate) fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub(crate) fn budget(&self) -> &BudgetLedger {
        &self.budget
    }

    pub(crate) fn memory(&self) -> &MemoryService {
        &self.memory
    }

    pub(crate) fn policy(&self) -> &PolicyHub {
        &self.policy
    }

    pub(crate) fn signals(&self) -> &dyn SignalSource {
        self.signals.as_ref()
    }

    pub(crate) fn generator(&self) -> &dyn TextGenerator {
        self.generator.as_ref()
    }

    pub(crate) fn dispatcher(&self) -> &dyn DispatchClient {
        self.dispatcher.as_ref()
    }
}

pub(crate) struct AppStateBuilder {
    bus: Bus,
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    metrics: Option<Arc<Metrics>>,
    budget: Option<Arc<BudgetLedger>>,
    memory: Option<Arc<MemoryService>>,
    policy: Option<Arc<PolicyHub>>,
    signals: Option<Arc<dyn SignalSource>>,
    generator: Option<Arc<dyn TextGenerator>>,
    dispatcher: Option<Arc<dyn DispatchClient>>,
}

#[allow(dead_code)]
impl AppStateBuilder {
    pub(crate) fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub(crate) fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    pub(crate) fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub(crate) fn with_budget(mut self, budget: Arc<BudgetLedger>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub(crate) fn with_memory(mut self, memory: Arc<MemoryService>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub(crate) fn with_policy(mut self, policy: Arc<PolicyHub>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub(crate) fn with_signals(mut self, signals: Arc<dyn SignalSource>) -> Self {
        self.signals = Some(signals);
        self
    }

    pub(crate) fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub(crate) fn with_dispatcher(mut self, dispatcher: Arc<dyn DispatchClient>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub(crate) async fn build(self) -> AppState {
        let clock = self.clock.unwrap_or_else(clock::system_clock);
        let sleeper = self.sleeper.unwrap_or_else(clock::tokio_sleeper);
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(Metrics::new()));
        let budget = match self.budget {
            Some(budget) => budget,
            None => {
                BudgetLedger::with_state_path(
                    self.bus.clone(),
                    clock.clone(),
                    util::state_dir().join("budget.json"),
                )
                .await
            }
        };
        let memory = match self.memory {
            Some(memory) => memory,
            None => {
                MemoryService::with_state_path(
                    self.bus.clone(),
                    clock.clone(),
                    self.config.timezone_offset.clone(),
                    util::state_dir().join("telemetry.json"),
                )
                .await
            }
        };
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(PolicyHub::new(self.bus.clone())));
        let signals: Arc<dyn SignalSource> =
            self.signals.unwrap_or_else(|| Arc::new(OfflineSignals));
        let generator: Arc<dyn TextGenerator> =
            self.generator.unwrap_or_else(|| Arc::new(NoopGenerator));
        let dispatcher: Arc<dyn DispatchClient> = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(DryRunDispatch::new(clock.clone())));

        AppState {
            bus: self.bus,
            config: Arc::new(self.config),
            clock,
            sleeper,
            metrics,
            budget,
            memory,
            policy,
            signals,
            generator,
            dispatcher,
        }
    }
}

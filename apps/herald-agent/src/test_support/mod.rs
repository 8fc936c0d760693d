use once_cell::sync::Lazy;
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub(crate) mod env {
    use super::*;

    pub(crate) struct EnvGuard {
        _lock: MutexGuard<'static, ()>,
        saved: HashMap<String, Option<String>>,
    }

    pub(crate) fn guard() -> EnvGuard {
        EnvGuard {
            _lock: ENV_LOCK.lock().expect("env lock poisoned"),
            saved: HashMap::new(),
        }
    }

    impl EnvGuard {
        fn remember(&mut self, key: &str) {
            self.saved
                .entry(key.to_string())
                .or_insert_with(|| std::env::var(key).ok());
        }

        pub(crate) fn set(&mut self, key: &str, value: impl AsRef<str>) {
            self.remember(key);
            std::env::set_var(key, value.as_ref());
        }

        pub(crate) fn set_opt(&mut self, key: &str, value: Option<&str>) {
            self.remember(key);
            match value {
                Some(val) => std::env::set_var(key, val),
                None => std::env::remove_var(key),
            }
        }

        pub(crate) fn remove(&mut self, key: &str) {
            self.set_opt(key, None);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain() {
                match value {
                    Some(val) => std::env::set_var(&key, val),
                    None => std::env::remove_var(&key),
                }
            }
        }
    }
}

pub(crate) mod clock {
    use chrono::{DateTime, Duration, Utc};
    use std::sync::{Arc, Mutex};

    use crate::clock::Clock;

    /// Deterministic clock for tests; advance it by hand.
    pub(crate) struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub(crate) fn at(start: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(start),
            })
        }

        pub(crate) fn advance(&self, delta: Duration) {
            let mut guard = self.now.lock().expect("manual clock lock");
            *guard = *guard + delta;
        }

        #[allow(dead_code)]
        pub(crate) fn set(&self, instant: DateTime<Utc>) {
            let mut guard = self.now.lock().expect("manual clock lock");
            *guard = instant;
        }
    }

    impl Clock for ManualClock {
        fn now_utc(&self) -> DateTime<Utc> {
            *self.now.lock().expect("manual clock lock")
        }
    }
}

pub(crate) mod fakes {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::connectors::{
        ConnectorError, DispatchClient, DispatchKind, DispatchReceipt, PendingMention,
        PromptContext, SignalSource, TextGenerator,
    };
    use crate::digest::OnchainNutrient;
    use crate::market::MarketSnapshot;
    use crate::trend::NewsRow;

    /// Signal source fed from scripted batches; each fetch pops one batch,
    /// an exhausted queue reads as empty.
    #[derive(Default)]
    pub(crate) struct ScriptedSignals {
        nutrients: Mutex<VecDeque<Vec<OnchainNutrient>>>,
        news: Mutex<VecDeque<Vec<NewsRow>>>,
        snapshot: Mutex<MarketSnapshot>,
        mentions: Mutex<VecDeque<Vec<PendingMention>>>,
        fail_fetches: AtomicBool,
    }

    impl ScriptedSignals {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn push_nutrients(&self, batch: Vec<OnchainNutrient>) {
            self.nutrients.lock().expect("nutrients lock").push_back(batch);
        }

        pub(crate) fn push_news(&self, batch: Vec<NewsRow>) {
            self.news.lock().expect("news lock").push_back(batch);
        }

        pub(crate) fn set_snapshot(&self, snapshot: MarketSnapshot) {
            *self.snapshot.lock().expect("snapshot lock") = snapshot;
        }

        pub(crate) fn push_mentions(&self, batch: Vec<PendingMention>) {
            self.mentions.lock().expect("mentions lock").push_back(batch);
        }

        #[allow(dead_code)]
        pub(crate) fn fail_fetches(&self, fail: bool) {
            self.fail_fetches.store(fail, Ordering::SeqCst);
        }

        fn check_failure(&self) -> Result<(), ConnectorError> {
            if self.fail_fetches.load(Ordering::SeqCst) {
                Err(ConnectorError::Network("scripted outage".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SignalSource for ScriptedSignals {
        async fn fetch_nutrients(&self) -> Result<Vec<OnchainNutrient>, ConnectorError> {
            self.check_failure()?;
            Ok(self
                .nutrients
                .lock()
                .expect("nutrients lock")
                .pop_front()
                .unwrap_or_default())
        }

        async fn fetch_news(&self) -> Result<Vec<NewsRow>, ConnectorError> {
            self.check_failure()?;
            Ok(self
                .news
                .lock()
                .expect("news lock")
                .pop_front()
                .unwrap_or_default())
        }

        async fn market_snapshot(&self) -> Result<MarketSnapshot, ConnectorError> {
            self.check_failure()?;
            Ok(self.snapshot.lock().expect("snapshot lock").clone())
        }

        async fn pending_mentions(&self) -> Result<Vec<PendingMention>, ConnectorError> {
            self.check_failure()?;
            Ok(self
                .mentions
                .lock()
                .expect("mentions lock")
                .pop_front()
                .unwrap_or_default())
        }
    }

    /// Generator replaying a scripted sequence of outputs; exhausted means
    /// `Ok(None)` so callers hit their fallback path.
    #[derive(Default)]
    pub(crate) struct ScriptedGenerator {
        outputs: Mutex<VecDeque<Option<String>>>,
        error_budget: AtomicU32,
        calls: AtomicU32,
    }

    impl ScriptedGenerator {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn push(&self, output: Option<&str>) {
            self.outputs
                .lock()
                .expect("outputs lock")
                .push_back(output.map(|text| text.to_string()));
        }

        /// The next `count` calls fail with a network error before any
        /// scripted output is consumed.
        #[allow(dead_code)]
        pub(crate) fn fail_times(&self, count: u32) {
            self.error_budget.store(count, Ordering::SeqCst);
        }

        pub(crate) fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(
            &self,
            _context: &PromptContext,
        ) -> Result<Option<String>, ConnectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let budget = self.error_budget.load(Ordering::SeqCst);
            if budget > 0 {
                self.error_budget.store(budget - 1, Ordering::SeqCst);
                return Err(ConnectorError::Unavailable("scripted failure".to_string()));
            }
            Ok(self
                .outputs
                .lock()
                .expect("outputs lock")
                .pop_front()
                .flatten())
        }
    }

    /// Dispatch client that records what it was asked to send.
    #[derive(Default)]
    pub(crate) struct RecordingDispatch {
        sent: Mutex<Vec<(DispatchKind, String)>>,
        fail_next: AtomicBool,
    }

    impl RecordingDispatch {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn sent(&self) -> Vec<(DispatchKind, String)> {
            self.sent.lock().expect("sent lock").clone()
        }

        #[allow(dead_code)]
        pub(crate) fn fail_next(&self) {
            self.fail_next.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DispatchClient for RecordingDispatch {
        async fn dispatch(
            &self,
            kind: DispatchKind,
            text: &str,
        ) -> Result<DispatchReceipt, ConnectorError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(ConnectorError::Network("scripted dispatch failure".to_string()));
            }
            self.sent
                .lock()
                .expect("sent lock")
                .push((kind, text.to_string()));
            Ok(DispatchReceipt {
                id: Some(Uuid::new_v4().to_string()),
                kind,
                dispatched_at: Utc::now(),
                dry_run: false,
            })
        }
    }
}

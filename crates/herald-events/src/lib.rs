use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

/// Minimal event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

/// Counters describing bus traffic since construction.
#[derive(Debug, Default, Clone, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub no_receivers: u64,
    pub receivers: usize,
}

struct BusInner {
    replay: Mutex<VecDeque<Envelope>>,
    replay_cap: usize,
    published: AtomicU64,
    no_receivers: AtomicU64,
}

/// A simple broadcast bus for JSON-serializable events with an optional
/// bounded replay buffer for late subscribers.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        Self::new_with_replay(capacity, 0)
    }

    /// Like [`Bus::new`], but retains the most recent `replay` envelopes so
    /// late subscribers can catch up via [`Bus::replay`] or a filtered
    /// subscription.
    pub fn new_with_replay(capacity: usize, replay: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            inner: Arc::new(BusInner {
                replay: Mutex::new(VecDeque::with_capacity(replay)),
                replay_cap: replay,
                published: AtomicU64::new(0),
                no_receivers: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Subscribe to a fixed set of kinds, optionally replaying up to `replay`
    /// buffered envelopes (oldest first) before live delivery begins.
    pub fn subscribe_filtered(
        &self,
        kinds: Vec<String>,
        replay: Option<usize>,
    ) -> mpsc::Receiver<Envelope> {
        let (out_tx, out_rx) = mpsc::channel(64);
        let mut live = self.tx.subscribe();
        let backlog: Vec<Envelope> = match replay {
            Some(n) if n > 0 => {
                let buf = self.inner.replay.lock().expect("bus replay lock");
                let matching: Vec<Envelope> = buf
                    .iter()
                    .filter(|env| kinds.iter().any(|k| k == &env.kind))
                    .cloned()
                    .collect();
                let skip = matching.len().saturating_sub(n);
                matching.into_iter().skip(skip).collect()
            }
            _ => Vec::new(),
        };
        tokio::spawn(async move {
            for env in backlog {
                if out_tx.send(env).await.is_err() {
                    return;
                }
            }
            loop {
                match live.recv().await {
                    Ok(env) => {
                        if kinds.iter().any(|k| k == &env.kind)
                            && out_tx.send(env).await.is_err()
                        {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        out_rx
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        let env = Envelope {
            time: now,
            kind: kind.to_string(),
            payload: val,
        };
        if self.inner.replay_cap > 0 {
            let mut buf = self.inner.replay.lock().expect("bus replay lock");
            if buf.len() == self.inner.replay_cap {
                buf.pop_front();
            }
            buf.push_back(env.clone());
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(env).is_err() {
            self.inner.no_receivers.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Most recent buffered envelopes, oldest first.
    pub fn replay(&self, max: usize) -> Vec<Envelope> {
        let buf = self.inner.replay.lock().expect("bus replay lock");
        let skip = buf.len().saturating_sub(max);
        buf.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            no_receivers: self.inner.no_receivers.load(Ordering::Relaxed),
            receivers: self.tx.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let bus = Bus::new(8);
        let mut rx = bus.subscribe();
        bus.publish("unit.test", &json!({"n": 1}));
        let env = rx.recv().await.expect("event");
        assert_eq!(env.kind, "unit.test");
        assert_eq!(env.payload["n"], 1);
        assert!(!env.time.is_empty());
    }

    #[tokio::test]
    async fn replay_keeps_most_recent() {
        let bus = Bus::new_with_replay(8, 2);
        bus.publish("a", &json!({}));
        bus.publish("b", &json!({}));
        bus.publish("c", &json!({}));
        let seen: Vec<String> = bus.replay(8).into_iter().map(|e| e.kind).collect();
        assert_eq!(seen, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn filtered_subscription_replays_then_streams() {
        let bus = Bus::new_with_replay(8, 8);
        bus.publish("keep.this", &json!({"seq": 0}));
        bus.publish("drop.this", &json!({"seq": 1}));
        let mut rx = bus.subscribe_filtered(vec!["keep.this".to_string()], Some(4));
        let replayed = rx.recv().await.expect("replayed event");
        assert_eq!(replayed.kind, "keep.this");
        assert_eq!(replayed.payload["seq"], 0);
        bus.publish("drop.this", &json!({"seq": 2}));
        bus.publish("keep.this", &json!({"seq": 3}));
        let live = rx.recv().await.expect("live event");
        assert_eq!(live.payload["seq"], 3);
    }

    #[tokio::test]
    async fn stats_track_published_and_dropped() {
        let bus = Bus::new(4);
        bus.publish("nobody.listening", &json!({}));
        let stats = bus.stats();
        assert_eq!(stats.published, 1);
        assert_eq!(stats.no_receivers, 1);
        let _rx = bus.subscribe();
        bus.publish("somebody.listening", &json!({}));
        let stats = bus.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.no_receivers, 1);
    }
}

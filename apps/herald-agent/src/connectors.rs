//! Collaborator seams: signal acquisition, text generation, and dispatch.
//!
//! The engine only sees these traits; real network clients live behind them.
//! Faults surface as [`ConnectorError`] and are degraded by the caller to
//! "no signal" or "not completed" for that attempt, never a crashed cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::digest::OnchainNutrient;
use crate::market::MarketSnapshot;
use crate::narrative::NarrativePlan;
use crate::trend::{NewsRow, OnchainEvidence, TrendEvent};
use std::sync::Arc;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DispatchKind {
    Post,
    Reply,
}

impl DispatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchKind::Post => "post",
            DispatchKind::Reply => "reply",
        }
    }
}

/// Inbound mention awaiting a reply.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingMention {
    pub id: String,
    pub author: String,
    pub text: String,
    pub captured_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DispatchReceipt {
    pub id: Option<String>,
    pub kind: DispatchKind,
    pub dispatched_at: DateTime<Utc>,
    pub dry_run: bool,
}

/// Everything the external generator gets to work with for one attempt.
#[derive(Clone, Debug)]
pub struct PromptContext {
    pub kind: DispatchKind,
    pub event: Option<TrendEvent>,
    pub evidence: Vec<OnchainEvidence>,
    pub narrative: Option<NarrativePlan>,
    pub market_fingerprint: Option<String>,
    pub mention: Option<PendingMention>,
    pub attempt: u32,
}

impl PromptContext {
    pub fn for_post(
        event: TrendEvent,
        evidence: Vec<OnchainEvidence>,
        narrative: NarrativePlan,
        market_fingerprint: String,
    ) -> Self {
        Self {
            kind: DispatchKind::Post,
            event: Some(event),
            evidence,
            narrative: Some(narrative),
            market_fingerprint: Some(market_fingerprint),
            mention: None,
            attempt: 0,
        }
    }

    pub fn for_reply(mention: PendingMention) -> Self {
        Self {
            kind: DispatchKind::Reply,
            event: None,
            evidence: Vec::new(),
            narrative: None,
            market_fingerprint: None,
            mention: Some(mention),
            attempt: 0,
        }
    }
}

#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn fetch_nutrients(&self) -> Result<Vec<OnchainNutrient>, ConnectorError>;
    async fn fetch_news(&self) -> Result<Vec<NewsRow>, ConnectorError>;
    async fn market_snapshot(&self) -> Result<MarketSnapshot, ConnectorError>;
    async fn pending_mentions(&self) -> Result<Vec<PendingMention>, ConnectorError>;
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// `Ok(None)` means the generator produced nothing usable this attempt;
    /// the caller retries and eventually falls back to its template.
    async fn generate(&self, context: &PromptContext) -> Result<Option<String>, ConnectorError>;
}

#[async_trait]
pub trait DispatchClient: Send + Sync {
    async fn dispatch(
        &self,
        kind: DispatchKind,
        text: &str,
    ) -> Result<DispatchReceipt, ConnectorError>;
}

/// Standing in for real acquisition when no upstream is configured. Every
/// fetch reports empty, so cycles run their bookkeeping without acting.
pub struct OfflineSignals;

#[async_trait]
impl SignalSource for OfflineSignals {
    async fn fetch_nutrients(&self) -> Result<Vec<OnchainNutrient>, ConnectorError> {
        debug!(target: "herald::connectors", "offline signal source: no nutrients");
        Ok(Vec::new())
    }

    async fn fetch_news(&self) -> Result<Vec<NewsRow>, ConnectorError> {
        Ok(Vec::new())
    }

    async fn market_snapshot(&self) -> Result<MarketSnapshot, ConnectorError> {
        Ok(MarketSnapshot::default())
    }

    async fn pending_mentions(&self) -> Result<Vec<PendingMention>, ConnectorError> {
        Ok(Vec::new())
    }
}

/// Produces nothing, which pushes every post attempt onto the deterministic
/// fallback template. Useful until a real generator is wired in.
pub struct NoopGenerator;

#[async_trait]
impl TextGenerator for NoopGenerator {
    async fn generate(&self, context: &PromptContext) -> Result<Option<String>, ConnectorError> {
        debug!(
            target: "herald::connectors",
            kind = context.kind.as_str(),
            attempt = context.attempt,
            "noop generator declined"
        );
        Ok(None)
    }
}

/// Logs instead of publishing. The receipt is marked `dry_run` so downstream
/// accounting can tell the difference.
pub struct DryRunDispatch {
    clock: Arc<dyn Clock>,
}

impl DryRunDispatch {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl DispatchClient for DryRunDispatch {
    async fn dispatch(
        &self,
        kind: DispatchKind,
        text: &str,
    ) -> Result<DispatchReceipt, ConnectorError> {
        info!(
            target: "herald::dispatch",
            kind = kind.as_str(),
            chars = text.chars().count(),
            "dry-run dispatch: {}",
            text
        );
        Ok(DispatchReceipt {
            id: Some(format!("dry-{}", Uuid::new_v4())),
            kind,
            dispatched_at: self.clock.now_utc(),
            dry_run: true,
        })
    }
}

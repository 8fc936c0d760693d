//! Canonical event topic constants shared across the engine.
//!
//! This crate centralizes the string constants used when publishing events so
//! that the scheduler, the governance hubs, and any future consumers stay in
//! sync. Keep this list alphabetized within sections and favor dot.case names.

// Budget ledger
pub const TOPIC_BUDGET_LEDGER_UPDATED: &str = "budget.ledger.updated";
pub const TOPIC_BUDGET_RECORDED: &str = "budget.recorded";

// Cycle lifecycle
pub const TOPIC_CYCLE_COMPLETED: &str = "cycle.completed";
pub const TOPIC_CYCLE_STARTED: &str = "cycle.started";

// Digest / nutrients
pub const TOPIC_DIGEST_INGESTED: &str = "digest.ingested";
pub const TOPIC_SOURCE_TRUST_UPDATED: &str = "source.trust.updated";

// Dispatch
pub const TOPIC_DISPATCH_COMPLETED: &str = "dispatch.completed";
pub const TOPIC_DISPATCH_REJECTED: &str = "dispatch.rejected";

// Governance
pub const TOPIC_AUTONOMY_DECIDED: &str = "autonomy.decided";
pub const TOPIC_POLICY_TUNED: &str = "policy.tuned";

// Telemetry store
pub const TOPIC_MEMORY_FLUSHED: &str = "memory.flushed";

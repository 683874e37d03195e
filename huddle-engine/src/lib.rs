//! Huddle Engine
//!
//! Peer-coordination layer for shared session state held in a passive
//! document store:
//! - `election`: deterministic writer election and the write gate
//! - `reconciler`: debounced, diffing recompute scheduler
//! - `dedup`: collapse duplicate sub-objects to one canonical instance
//! - `derived`: change feed → dedup → recompute → write pipeline
//! - `rpc`: delegated execution on the authority peer
//! - `counter`: shared counter with full-value broadcast
//! - `rotation`: per-cohort cooldown rotation
//! - `presence`: heartbeat-based presence provider
//! - `session`: per-peer wiring and lifecycle

pub mod cache;
pub mod config;
pub mod counter;
pub mod dedup;
pub mod derived;
pub mod election;
pub mod error;
pub mod handlers;
pub mod presence;
pub mod reconciler;
pub mod rotation;
pub mod rpc;
pub mod session;

pub use cache::{diff_fields, CommittedCache};
pub use config::EngineConfig;
pub use counter::{CounterMessage, CounterState, SharedCounterSync};
pub use dedup::{DedupReconciliationPass, ReconcilePlan};
pub use derived::{Derivation, DerivedPipeline};
pub use election::{elect_authority, elect_writer, is_elected_writer, AccessPolicies, WriteDecision, WriteGate};
pub use error::EngineError;
pub use presence::{PresenceMessage, PresenceTracker};
pub use reconciler::{DebouncedReconciler, ReconcileOutcome, ReconcileReport};
pub use rotation::{CooldownTable, RotationOutcome, RotationScheduler};
pub use rpc::{CallOptions, ErrorCode, RpcGateway, RpcResult};
pub use session::{Session, SessionBuilder};

//! Error types for the coordination engine

use crate::rpc::ErrorCode;
use huddle_model::{PubSubError, ResourceId, StoreError};
use std::time::Duration;
use thiserror::Error;

/// Engine-level errors.
///
/// `Clone` so a single RPC result can be handed to every waiter that joined
/// the same in-flight call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Local mutation attempted without rights. Never retried.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No authority peer is reachable for an RPC.
    #[error("no authority online")]
    NoAuthorityAvailable,

    /// RPC exceeded its deadline; the dedupe slot has been freed.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Store-level permission or validation failure.
    #[error("write rejected: {0}")]
    WriteRejected(String),

    /// A recompute function failed; the resource stays stale until the next trigger.
    #[error("reconcile failed for {resource_id}: {reason}")]
    Reconcile { resource_id: ResourceId, reason: String },

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Structured failure reported by a remote handler.
    #[error("remote {code}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("store: {0}")]
    Store(StoreError),

    #[error("pubsub: {0}")]
    PubSub(#[from] PubSubError),

    #[error("serialization: {0}")]
    Serialization(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error("session shut down")]
    Shutdown,
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::WriteRejected { resource_id, reason } => {
                EngineError::WriteRejected(format!("{}: {}", resource_id, reason))
            }
            other => EngineError::Store(other),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}

impl EngineError {
    /// Only timeouts invite a retry; everything else is surfaced as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Timeout(_))
    }

    /// Short, actionable text for showing to a user.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::PermissionDenied(_) => "you lack permission".into(),
            EngineError::NoAuthorityAvailable => "no authority online".into(),
            EngineError::Timeout(_) => "the request timed out, please retry".into(),
            EngineError::WriteRejected(_) => "the change was rejected".into(),
            EngineError::Shutdown => "the session has ended".into(),
            other => other.to_string(),
        }
    }
}

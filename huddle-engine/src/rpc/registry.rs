//! Handler registry for authority-side RPC operations
//!
//! Operation names are opaque strings namespaced by feature
//! (`counter.change`, `cooldown.recordAction`). Each handler validates its
//! own authorization; the gateway only routes.

use crate::error::EngineError;
use futures_util::future::BoxFuture;
use huddle_model::{Peer, PeerId, ResourceId, WritePolicy};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, RwLock};

/// What a handler knows about the request it is serving.
#[derive(Clone, Debug)]
pub struct RpcContext {
    /// Original caller, as stamped by the transport.
    pub caller: PeerId,
    /// Presence snapshot on the authority at dispatch time.
    pub peers: Vec<Peer>,
}

impl RpcContext {
    /// Re-validate the caller against a resource's policy.
    pub fn require_permission(&self, policy: &dyn WritePolicy, resource_id: &ResourceId) -> Result<(), EngineError> {
        if policy.is_permitted(&self.caller, resource_id, &self.peers) {
            Ok(())
        } else {
            Err(EngineError::PermissionDenied(format!(
                "{} may not write {}",
                self.caller, resource_id
            )))
        }
    }
}

/// Decode a request payload into a typed struct.
pub fn decode_payload<T: DeserializeOwned>(payload: Value) -> Result<T, EngineError> {
    serde_json::from_value(payload).map_err(|e| EngineError::InvalidPayload(e.to_string()))
}

/// Trait for operation handlers.
///
/// Any `Fn(RpcContext, Value) -> impl Future<Output = Result<Value, EngineError>>`
/// is a handler via the blanket impl.
pub trait RpcHandler: Send + Sync + 'static {
    fn handle(&self, ctx: RpcContext, payload: Value) -> BoxFuture<'static, Result<Value, EngineError>>;
}

impl<F, Fut> RpcHandler for F
where
    F: Fn(RpcContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, EngineError>> + Send + 'static,
{
    fn handle(&self, ctx: RpcContext, payload: Value) -> BoxFuture<'static, Result<Value, EngineError>> {
        Box::pin(self(ctx, payload))
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `operation`.
    pub fn register(&self, operation: impl Into<String>, handler: impl RpcHandler) {
        let operation = operation.into();
        if let Ok(mut handlers) = self.handlers.write() {
            if handlers.insert(operation.clone(), Arc::new(handler)).is_some() {
                tracing::warn!(operation = %operation, "Replaced existing RPC handler");
            }
        }
    }

    pub fn get(&self, operation: &str) -> Option<Arc<dyn RpcHandler>> {
        self.handlers.read().ok()?.get(operation).cloned()
    }

    pub fn operations(&self) -> Vec<String> {
        let Ok(handlers) = self.handlers.read() else { return Vec::new() };
        let mut ops: Vec<_> = handlers.keys().cloned().collect();
        ops.sort();
        ops
    }
}

/// Bounded FIFO of results for requests that carried an idempotency key.
///
/// Keyed by `(caller, operation, key)` so one caller cannot replay another's.
pub struct IdempotencyLedger {
    capacity: usize,
    order: VecDeque<(PeerId, String, String)>,
    results: HashMap<(PeerId, String, String), Value>,
}

impl IdempotencyLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            results: HashMap::new(),
        }
    }

    pub fn get(&self, caller: &PeerId, operation: &str, key: &str) -> Option<&Value> {
        self.results.get(&(caller.clone(), operation.to_string(), key.to_string()))
    }

    pub fn record(&mut self, caller: PeerId, operation: String, key: String, result: Value) {
        if self.capacity == 0 {
            return;
        }
        let entry = (caller, operation, key);
        if self.results.insert(entry.clone(), result).is_none() {
            self.order.push_back(entry);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.results.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

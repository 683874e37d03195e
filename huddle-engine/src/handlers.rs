//! Built-in RPC operations served by authority-capable sessions

use crate::counter::SharedCounterSync;
use crate::error::EngineError;
use crate::rotation::RotationScheduler;
use crate::rpc::{decode_payload, HandlerRegistry, RpcContext};
use huddle_model::ResourceId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub const COUNTER_CHANGE: &str = "counter.change";
pub const COUNTER_SET: &str = "counter.set";
pub const COOLDOWN_RECORD_ACTION: &str = "cooldown.recordAction";
pub const COOLDOWN_RESET: &str = "cooldown.reset";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CounterChange {
    pub counter: ResourceId,
    pub delta: i64,
    /// Makes a retried request safe to repeat. Requests without one are
    /// applied every time they arrive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CounterSet {
    pub counter: ResourceId,
    pub value: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CohortEntity {
    pub cohort: ResourceId,
    pub entity: ResourceId,
}

/// Counters and cohorts a session has opened, by resource id.
#[derive(Default)]
pub struct ResourceDirectory {
    counters: RwLock<HashMap<ResourceId, Arc<SharedCounterSync>>>,
    cohorts: RwLock<HashMap<ResourceId, Arc<RotationScheduler>>>,
}

impl ResourceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_counter(&self, counter: Arc<SharedCounterSync>) {
        if let Ok(mut counters) = self.counters.write() {
            counters.insert(counter.resource_id().clone(), counter);
        }
    }

    pub fn counter(&self, id: &ResourceId) -> Option<Arc<SharedCounterSync>> {
        self.counters.read().ok()?.get(id).cloned()
    }

    pub fn counters(&self) -> Vec<Arc<SharedCounterSync>> {
        self.counters.read().map(|c| c.values().cloned().collect()).unwrap_or_default()
    }

    pub fn insert_cohort(&self, cohort: Arc<RotationScheduler>) {
        if let Ok(mut cohorts) = self.cohorts.write() {
            cohorts.insert(cohort.cohort_id().clone(), cohort);
        }
    }

    pub fn cohort(&self, id: &ResourceId) -> Option<Arc<RotationScheduler>> {
        self.cohorts.read().ok()?.get(id).cloned()
    }

    fn require_counter(&self, id: &ResourceId) -> Result<Arc<SharedCounterSync>, EngineError> {
        self.counter(id)
            .ok_or_else(|| EngineError::InvalidPayload(format!("unknown counter {}", id)))
    }

    fn require_cohort(&self, id: &ResourceId) -> Result<Arc<RotationScheduler>, EngineError> {
        self.cohort(id)
            .ok_or_else(|| EngineError::InvalidPayload(format!("unknown cohort {}", id)))
    }
}

/// Register the counter and cooldown operations.
///
/// Every handler re-checks the caller against the resource's policies
/// before mutating.
pub fn register_builtin(registry: &HandlerRegistry, directory: Arc<ResourceDirectory>) {
    let dir = directory.clone();
    registry.register(COUNTER_CHANGE, move |ctx: RpcContext, payload: Value| {
        let dir = dir.clone();
        async move {
            let request: CounterChange = decode_payload(payload)?;
            let counter = dir.require_counter(&request.counter)?;
            ctx.require_permission(counter.policies().delegated.as_ref(), &request.counter)?;
            tracing::debug!(caller = %ctx.caller, counter = %request.counter, delta = request.delta, "Applying delegated counter change");
            Ok::<_, EngineError>(serde_json::to_value(counter.change(request.delta).await?)?)
        }
    });

    let dir = directory.clone();
    registry.register(COUNTER_SET, move |ctx: RpcContext, payload: Value| {
        let dir = dir.clone();
        async move {
            let request: CounterSet = decode_payload(payload)?;
            let counter = dir.require_counter(&request.counter)?;
            ctx.require_permission(counter.policies().delegated.as_ref(), &request.counter)?;
            Ok::<_, EngineError>(serde_json::to_value(counter.set(request.value).await?)?)
        }
    });

    let dir = directory.clone();
    registry.register(COOLDOWN_RECORD_ACTION, move |ctx: RpcContext, payload: Value| {
        let dir = dir.clone();
        async move {
            let request: CohortEntity = decode_payload(payload)?;
            let cohort = dir.require_cohort(&request.cohort)?;
            ctx.require_permission(cohort.policies().delegated.as_ref(), &request.cohort)?;
            Ok::<_, EngineError>(serde_json::to_value(cohort.record_action(&request.entity).await?)?)
        }
    });

    let dir = directory;
    registry.register(COOLDOWN_RESET, move |ctx: RpcContext, payload: Value| {
        let dir = dir.clone();
        async move {
            let request: CohortEntity = decode_payload(payload)?;
            let cohort = dir.require_cohort(&request.cohort)?;
            // Resetting a cooldown is administrative: direct writers only
            ctx.require_permission(cohort.policies().direct.as_ref(), &request.cohort)?;
            Ok::<_, EngineError>(serde_json::to_value(cohort.reset(&request.entity).await?)?)
        }
    });
}

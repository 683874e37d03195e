//! Session - one peer's wiring of every engine component
//!
//! The session owns the presence view, write gate, committed cache,
//! reconciler, derived pipeline, RPC gateway and every counter and cohort
//! the peer has opened. Its lifetime is the peer's connection: `shutdown`
//! says goodbye, stops every listener and drops all session-scoped state.

use crate::cache::CommittedCache;
use crate::config::EngineConfig;
use crate::counter::{CounterState, SharedCounterSync};
use crate::derived::{Derivation, DerivedPipeline};
use crate::election::{AccessPolicies, WriteGate};
use crate::error::EngineError;
use crate::handlers::{
    register_builtin, CohortEntity, CounterChange, ResourceDirectory, COOLDOWN_RECORD_ACTION, COUNTER_CHANGE,
};
use crate::presence::PresenceTracker;
use crate::reconciler::{DebouncedReconciler, ReconcileOutcome};
use crate::rotation::{RotationOutcome, RotationScheduler};
use crate::rpc::{decode_payload, CallOptions, HandlerRegistry, RpcGateway};
use huddle_model::{DocumentStore, Peer, PresenceProvider, PubSub, ResourceId};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Builder for `Session`.
pub struct SessionBuilder {
    local: Peer,
    config: EngineConfig,
    store: Option<Arc<dyn DocumentStore>>,
    pubsub: Option<Arc<dyn PubSub>>,
    presence: Option<Arc<dyn PresenceProvider>>,
}

impl SessionBuilder {
    pub fn new(local: Peer) -> Self {
        Self {
            local,
            config: EngineConfig::default(),
            store: None,
            pubsub: None,
            presence: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    /// Use an external presence source instead of heartbeats on the pub/sub.
    pub fn with_presence(mut self, presence: Arc<dyn PresenceProvider>) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Start the session's listeners.
    #[tracing::instrument(skip_all, fields(peer = %self.local.id))]
    pub async fn build(self) -> Result<Arc<Session>, EngineError> {
        let store = self
            .store
            .ok_or_else(|| EngineError::Internal("session needs a document store".into()))?;
        let pubsub = self
            .pubsub
            .ok_or_else(|| EngineError::Internal("session needs a pub/sub channel".into()))?;

        let (presence, tracker) = match self.presence {
            Some(presence) => (presence, None),
            None => {
                let tracker = PresenceTracker::start(self.local.clone(), pubsub.clone(), &self.config).await?;
                (tracker.clone() as Arc<dyn PresenceProvider>, Some(tracker))
            }
        };

        let gate = Arc::new(WriteGate::new(self.local.clone(), presence.clone()));
        let cache = Arc::new(CommittedCache::new());
        let reconciler = Arc::new(DebouncedReconciler::new(store.clone(), gate.clone(), cache.clone()));
        let pipeline = Arc::new(DerivedPipeline::new(
            store.clone(),
            reconciler.clone(),
            cache.clone(),
            self.config.debounce,
        ));

        let directory = Arc::new(ResourceDirectory::new());
        let registry = Arc::new(HandlerRegistry::new());
        if self.local.is_authority_candidate {
            register_builtin(&registry, directory.clone());
        }
        let gateway = RpcGateway::start(
            self.local.clone(),
            pubsub.clone(),
            presence.clone(),
            registry,
            &self.config,
        )
        .await?;

        let presence_source = if tracker.is_some() { "heartbeat" } else { "external" };
        tracing::info!(
            authority_candidate = self.local.is_authority_candidate,
            presence = presence_source,
            "Session started"
        );

        Ok(Arc::new(Session {
            local: self.local,
            config: self.config,
            store,
            pubsub,
            presence,
            tracker,
            gate,
            cache,
            reconciler,
            pipeline,
            gateway,
            directory,
            shutdown: CancellationToken::new(),
        }))
    }
}

pub struct Session {
    local: Peer,
    config: EngineConfig,
    store: Arc<dyn DocumentStore>,
    pubsub: Arc<dyn PubSub>,
    presence: Arc<dyn PresenceProvider>,
    tracker: Option<Arc<PresenceTracker>>,
    gate: Arc<WriteGate>,
    cache: Arc<CommittedCache>,
    reconciler: Arc<DebouncedReconciler>,
    pipeline: Arc<DerivedPipeline>,
    gateway: RpcGateway,
    directory: Arc<ResourceDirectory>,
    shutdown: CancellationToken,
}

impl Session {
    pub fn builder(local: Peer) -> SessionBuilder {
        SessionBuilder::new(local)
    }

    pub fn local(&self) -> &Peer {
        &self.local
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn presence(&self) -> &Arc<dyn PresenceProvider> {
        &self.presence
    }

    pub fn gate(&self) -> &Arc<WriteGate> {
        &self.gate
    }

    pub fn cache(&self) -> &Arc<CommittedCache> {
        &self.cache
    }

    pub fn reconciler(&self) -> &Arc<DebouncedReconciler> {
        &self.reconciler
    }

    pub fn gateway(&self) -> &RpcGateway {
        &self.gateway
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.is_shut_down() {
            return Err(EngineError::Shutdown);
        }
        Ok(())
    }

    /// Open (or return the already open) shared counter backed by `resource_id`.
    pub async fn open_counter(
        &self,
        resource_id: impl Into<ResourceId>,
        policies: AccessPolicies,
    ) -> Result<Arc<SharedCounterSync>, EngineError> {
        self.ensure_running()?;
        let resource_id = resource_id.into();
        if let Some(counter) = self.directory.counter(&resource_id) {
            return Ok(counter);
        }
        let counter = SharedCounterSync::open(
            resource_id,
            self.store.clone(),
            self.pubsub.clone(),
            self.gate.clone(),
            policies,
            self.config.topic("counter"),
        )
        .await?;
        self.directory.insert_counter(counter.clone());
        Ok(counter)
    }

    pub fn counter(&self, resource_id: &ResourceId) -> Option<Arc<SharedCounterSync>> {
        self.directory.counter(resource_id)
    }

    /// Open (or return the already open) rotation cohort backed by `cohort_id`.
    pub fn open_cohort(&self, cohort_id: impl Into<ResourceId>, policies: AccessPolicies) -> Result<Arc<RotationScheduler>, EngineError> {
        self.ensure_running()?;
        let cohort_id = cohort_id.into();
        if let Some(cohort) = self.directory.cohort(&cohort_id) {
            return Ok(cohort);
        }
        let cohort = Arc::new(RotationScheduler::new(cohort_id, self.store.clone(), self.gate.clone(), policies));
        self.directory.insert_cohort(cohort.clone());
        Ok(cohort)
    }

    pub fn cohort(&self, cohort_id: &ResourceId) -> Option<Arc<RotationScheduler>> {
        self.directory.cohort(cohort_id)
    }

    /// Keep `resource_id`'s derived fields current from its change feed.
    pub fn watch_derived(&self, resource_id: impl Into<ResourceId>, derivation: Arc<dyn Derivation>) -> Result<(), EngineError> {
        self.ensure_running()?;
        self.pipeline.watch(resource_id.into(), derivation);
        Ok(())
    }

    /// Recompute `resource_id` now, without waiting for a change.
    pub async fn refresh_derived(
        &self,
        resource_id: &ResourceId,
        derivation: Arc<dyn Derivation>,
    ) -> Result<ReconcileOutcome, EngineError> {
        self.ensure_running()?;
        self.pipeline.run_once(resource_id, derivation).await
    }

    /// Call an operation on the authority with the default timeout.
    pub async fn call(&self, operation: &str, payload: Value) -> Result<Value, EngineError> {
        self.gateway.call(operation, payload, CallOptions::default()).await
    }

    /// Change a counter directly when permitted, otherwise through the authority.
    ///
    /// A delta is not idempotent. After `EngineError::Timeout` the change may
    /// or may not have been applied; retry only with the same
    /// `idempotency_key`, which the authority answers from its ledger
    /// instead of applying again. Without a key a retry can apply twice.
    pub async fn submit_counter_change(
        &self,
        counter_id: &ResourceId,
        delta: i64,
        idempotency_key: Option<String>,
    ) -> Result<CounterState, EngineError> {
        self.ensure_running()?;
        let counter = self
            .directory
            .counter(counter_id)
            .ok_or_else(|| EngineError::InvalidPayload(format!("counter {} is not open", counter_id)))?;
        if counter.can_write() {
            return counter.change(delta).await;
        }

        let request = CounterChange { counter: counter_id.clone(), delta, idempotency_key };
        let data = self.call(COUNTER_CHANGE, serde_json::to_value(&request)?).await?;
        decode_payload(data)
    }

    /// Record an action directly when this peer is the cohort writer,
    /// otherwise through the authority.
    pub async fn submit_record_action(&self, cohort_id: &ResourceId, entity: &ResourceId) -> Result<RotationOutcome, EngineError> {
        self.ensure_running()?;
        if let Some(cohort) = self.directory.cohort(cohort_id) {
            if cohort.is_writer() {
                return cohort.record_action(entity).await;
            }
        }

        let request = CohortEntity { cohort: cohort_id.clone(), entity: entity.clone() };
        let data = self.call(COOLDOWN_RECORD_ACTION, serde_json::to_value(&request)?).await?;
        decode_payload(data)
    }

    /// Say goodbye, stop every listener, fail in-flight calls and drop
    /// session-scoped state. Safe to call more than once.
    #[tracing::instrument(skip(self), fields(peer = %self.local.id))]
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        if let Some(tracker) = &self.tracker {
            tracker.shutdown().await;
        }
        self.gateway.shutdown();
        for counter in self.directory.counters() {
            counter.shutdown();
        }
        self.pipeline.shutdown();
        self.reconciler.shutdown();
        self.cache.clear();
        tracing::info!("Session shut down");
    }
}

//! SharedCounterSync - one shared value, full-value broadcast after every commit
//!
//! The authoritative record lives in the document store as
//! `{value, last_writer, version}`. Every peer keeps a cached copy that is
//! replaced by any broadcast carrying a higher `(version, last_writer)`
//! pair, so caches converge no matter in which order broadcasts arrive.
//! Deleting the backing record resets every cache to the zero state.
//!
//! Two permitted direct writers committing the same version concurrently
//! are ordered by writer id in every cache, while the store keeps whichever
//! write landed last. Caches then agree with each other but not with the
//! store until the next commit, which reads the store and moves past both.

use crate::election::{AccessPolicies, WriteGate};
use crate::error::EngineError;
use huddle_model::{publish_json, ChangeEvent, ChangeKind, Delivery, DocumentStore, Fields, PeerId, PubSub, ResourceId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;

/// Committed counter record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    #[serde(default)]
    pub value: i64,
    #[serde(default)]
    pub last_writer: Option<PeerId>,
    #[serde(default)]
    pub version: u64,
}

impl CounterState {
    /// Whether `self` should replace `cached`.
    pub fn supersedes(&self, cached: &CounterState) -> bool {
        (self.version, &self.last_writer) > (cached.version, &cached.last_writer)
    }

    fn from_fields(fields: Fields) -> Result<Self, EngineError> {
        Ok(serde_json::from_value(serde_json::Value::Object(fields))?)
    }

    fn to_fields(&self) -> Result<Fields, EngineError> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(fields) => Ok(fields),
            other => Err(EngineError::Serialization(format!("counter record is not an object: {}", other))),
        }
    }
}

/// Messages on `{prefix}.counter`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CounterMessage {
    /// Full current value. `to` is set when answering a resync.
    Value {
        counter: ResourceId,
        state: CounterState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
    },
    Resync { counter: ResourceId },
}

pub struct SharedCounterSync {
    resource_id: ResourceId,
    store: Arc<dyn DocumentStore>,
    pubsub: Arc<dyn PubSub>,
    gate: Arc<WriteGate>,
    policies: AccessPolicies,
    topic: String,
    cached: watch::Sender<CounterState>,
    // Serializes read-modify-write on this peer
    write_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl SharedCounterSync {
    /// Subscribe to counter broadcasts and load the committed record.
    #[tracing::instrument(skip_all, fields(counter = %resource_id))]
    pub async fn open(
        resource_id: ResourceId,
        store: Arc<dyn DocumentStore>,
        pubsub: Arc<dyn PubSub>,
        gate: Arc<WriteGate>,
        policies: AccessPolicies,
        topic: String,
    ) -> Result<Arc<Self>, EngineError> {
        let (cached, _) = watch::channel(CounterState::default());
        let counter = Arc::new(Self {
            resource_id,
            store,
            pubsub,
            gate,
            policies,
            topic,
            cached,
            write_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        });

        let messages = counter.pubsub.subscribe(&counter.topic).await?;
        let changes = counter.store.on_change(&counter.resource_id);
        tokio::spawn(counter.clone().listen(messages, changes));

        match counter.read_committed().await {
            Ok(Some(state)) => {
                counter.accept(state);
            }
            Ok(None) => {}
            // Not fatal: a broadcast or resync fills the cache later
            Err(e) => tracing::warn!(counter = %counter.resource_id, error = %e, "Initial counter read failed"),
        }
        Ok(counter)
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    /// Cached value, 0 if never synced.
    pub fn get(&self) -> i64 {
        self.cached.borrow().value
    }

    pub fn state(&self) -> CounterState {
        self.cached.borrow().clone()
    }

    /// Watch the cached record.
    pub fn subscribe(&self) -> watch::Receiver<CounterState> {
        self.cached.subscribe()
    }

    pub fn policies(&self) -> &AccessPolicies {
        &self.policies
    }

    /// Whether the local peer may write the counter directly.
    pub fn can_write(&self) -> bool {
        let peers = self.gate.peers();
        self.policies.direct.is_permitted(&self.gate.local().id, &self.resource_id, &peers)
    }

    /// Overwrite the value. Negative values are floored at 0.
    pub async fn set(&self, value: i64) -> Result<CounterState, EngineError> {
        self.commit(|_| value).await
    }

    /// Apply a signed delta to the committed value, flooring at 0.
    pub async fn change(&self, delta: i64) -> Result<CounterState, EngineError> {
        self.commit(|current| current.saturating_add(delta)).await
    }

    async fn commit(&self, next_value: impl FnOnce(i64) -> i64) -> Result<CounterState, EngineError> {
        if !self.can_write() {
            return Err(EngineError::PermissionDenied(format!(
                "{} may not write {}",
                self.gate.local().id,
                self.resource_id
            )));
        }

        let _guard = self.write_lock.lock().await;
        // A missing record starts over, whatever the cache still holds
        let current = self.read_committed().await?.unwrap_or_default();
        let next = CounterState {
            value: next_value(current.value).max(0),
            last_writer: Some(self.gate.local().id.clone()),
            version: current.version + 1,
        };

        self.store.write(&self.resource_id, next.to_fields()?).await?;
        self.accept(next.clone());

        let message = CounterMessage::Value { counter: self.resource_id.clone(), state: next.clone(), to: None };
        publish_json(self.pubsub.as_ref(), &self.topic, &message).await?;
        tracing::debug!(counter = %self.resource_id, value = next.value, version = next.version, "Counter committed");
        Ok(next)
    }

    /// Ask an authority-eligible peer to send us the current value.
    pub async fn request_resync(&self) -> Result<(), EngineError> {
        let message = CounterMessage::Resync { counter: self.resource_id.clone() };
        publish_json(self.pubsub.as_ref(), &self.topic, &message).await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.reset();
    }

    async fn read_committed(&self) -> Result<Option<CounterState>, EngineError> {
        match self.store.read(&self.resource_id).await? {
            Some(fields) => Ok(Some(CounterState::from_fields(fields)?)),
            None => Ok(None),
        }
    }

    fn reset(&self) {
        self.cached.send_if_modified(|cached| {
            let stale = *cached != CounterState::default();
            *cached = CounterState::default();
            stale
        });
    }

    fn accept(&self, incoming: CounterState) -> bool {
        self.cached.send_if_modified(|cached| {
            if incoming.supersedes(cached) {
                *cached = incoming;
                true
            } else {
                false
            }
        })
    }

    async fn handle(&self, delivery: Delivery) {
        let message: CounterMessage = match serde_json::from_value(delivery.message) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(from = %delivery.from, error = %e, "Malformed counter message");
                return;
            }
        };
        let local = &self.gate.local().id;

        match message {
            CounterMessage::Value { counter, state, to } => {
                if counter != self.resource_id || to.as_ref().is_some_and(|to| to != local) {
                    return;
                }
                if self.accept(state) {
                    tracing::trace!(counter = %self.resource_id, from = %delivery.from, value = self.get(), "Counter cache updated");
                }
            }
            CounterMessage::Resync { counter } => {
                if counter != self.resource_id || &delivery.from == local || !self.gate.local().is_authority_candidate {
                    return;
                }
                let state = match self.read_committed().await {
                    Ok(Some(state)) => state,
                    Ok(None) => CounterState::default(),
                    Err(e) => {
                        tracing::warn!(counter = %self.resource_id, error = %e, "Resync read failed, answering from cache");
                        self.state()
                    }
                };
                let reply = CounterMessage::Value { counter, state, to: Some(delivery.from.clone()) };
                if let Err(e) = publish_json(self.pubsub.as_ref(), &self.topic, &reply).await {
                    tracing::error!(counter = %self.resource_id, error = %e, "Failed to answer resync");
                } else {
                    tracing::debug!(counter = %self.resource_id, requester = %delivery.from, "Answered resync");
                }
            }
        }
    }

    fn on_store_change(&self, event: ChangeEvent) {
        if event.kind == ChangeKind::Deleted {
            self.reset();
            tracing::debug!(counter = %self.resource_id, author = %event.author, "Counter record deleted, cache reset");
        }
    }

    async fn listen(self: Arc<Self>, mut messages: broadcast::Receiver<Delivery>, mut changes: broadcast::Receiver<ChangeEvent>) {
        let mut changes_open = true;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = messages.recv() => match next {
                    Ok(delivery) => self.handle(delivery).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(counter = %self.resource_id, lagged = n, "Counter listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                next = changes.recv(), if changes_open => match next {
                    Ok(event) => self.on_store_change(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(counter = %self.resource_id, lagged = n, "Counter change feed lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => changes_open = false,
                },
            }
        }
        tracing::debug!(counter = %self.resource_id, "Counter listener stopped");
    }
}

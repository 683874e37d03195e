//! DebouncedReconciler - coalescing recompute scheduler keyed by resource
//!
//! Bursts of changes to one resource collapse into a single recompute that
//! runs once the debounce window passes quietly. Only the elected writer
//! recomputes, and only fields that actually changed are written.

use crate::cache::{diff_fields, CommittedCache};
use crate::election::{WriteDecision, WriteGate};
use crate::error::EngineError;
use huddle_model::{DocumentStore, Fields, PeerId, ResourceId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Result of one reconcile run.
#[derive(Clone, Debug, PartialEq)]
pub enum ReconcileOutcome {
    /// The changed fields were written.
    Written(Fields),
    /// Recompute matched the committed value; nothing was written.
    Unchanged,
    /// Another peer is responsible (or nobody may write).
    Skipped { writer: Option<PeerId> },
}

/// Report emitted after every timer-driven run.
#[derive(Clone, Debug)]
pub struct ReconcileReport {
    pub resource_id: ResourceId,
    pub result: Result<ReconcileOutcome, EngineError>,
}

struct PendingTimer {
    generation: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct TimerTable {
    next_generation: u64,
    timers: HashMap<ResourceId, PendingTimer>,
}

pub struct DebouncedReconciler {
    store: Arc<dyn DocumentStore>,
    gate: Arc<WriteGate>,
    cache: Arc<CommittedCache>,
    table: Mutex<TimerTable>,
    reports: broadcast::Sender<ReconcileReport>,
    shutdown: CancellationToken,
}

impl DebouncedReconciler {
    pub fn new(store: Arc<dyn DocumentStore>, gate: Arc<WriteGate>, cache: Arc<CommittedCache>) -> Self {
        let (reports, _) = broadcast::channel(128);
        Self {
            store,
            gate,
            cache,
            table: Mutex::new(TimerTable::default()),
            reports,
            shutdown: CancellationToken::new(),
        }
    }

    fn table(&self) -> MutexGuard<'_, TimerTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reports from timer-driven runs, including swallowed errors.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<ReconcileReport> {
        self.reports.subscribe()
    }

    /// Schedule a recompute of `resource_id` after `delay`.
    ///
    /// Replaces any timer still pending for the same resource. A recompute
    /// that already started is not interrupted.
    pub fn schedule<F, Fut>(self: &Arc<Self>, resource_id: ResourceId, recompute: F, delay: Duration)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Fields, String>> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return;
        }
        let token = self.shutdown.child_token();
        let generation = {
            let mut table = self.table();
            table.next_generation += 1;
            let generation = table.next_generation;
            let timer = PendingTimer { generation, token: token.clone() };
            if let Some(old) = table.timers.insert(resource_id.clone(), timer) {
                old.token.cancel();
                tracing::debug!(resource_id = %resource_id, "Coalesced pending recompute");
            }
            generation
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            // A newer schedule may have replaced us between the timer firing
            // and this point; only the current generation proceeds.
            {
                let mut table = this.table();
                match table.timers.get(&resource_id) {
                    Some(timer) if timer.generation == generation => {
                        table.timers.remove(&resource_id);
                    }
                    _ => return,
                }
            }

            let result = this.run_now(&resource_id, recompute).await;
            match &result {
                Ok(outcome) => tracing::debug!(resource_id = %resource_id, ?outcome, "Reconcile finished"),
                Err(e) => tracing::warn!(resource_id = %resource_id, error = %e, "Reconcile failed, resource left stale"),
            }
            let _ = this.reports.send(ReconcileReport { resource_id, result });
        });
    }

    /// Gate, recompute, diff and write immediately.
    pub async fn run_now<F, Fut>(&self, resource_id: &ResourceId, recompute: F) -> Result<ReconcileOutcome, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Fields, String>>,
    {
        let decision = self.gate.decide(resource_id);
        if !decision.may_write() {
            tracing::debug!(resource_id = %resource_id, ?decision, "Not the elected writer, skipping recompute");
            let writer = match decision {
                WriteDecision::NotElected { writer } => Some(writer),
                _ => None,
            };
            return Ok(ReconcileOutcome::Skipped { writer });
        }

        let next = recompute().await.map_err(|reason| EngineError::Reconcile {
            resource_id: resource_id.clone(),
            reason,
        })?;

        let committed = self.committed(resource_id).await?;
        let changed = diff_fields(&committed, &next);
        if changed.is_empty() {
            return Ok(ReconcileOutcome::Unchanged);
        }

        self.store.write(resource_id, changed.clone()).await?;
        self.cache.merge(resource_id, &changed);
        tracing::debug!(resource_id = %resource_id, fields = changed.len(), "Wrote recomputed fields");
        Ok(ReconcileOutcome::Written(changed))
    }

    /// Last known committed payload, reading through on a cache miss.
    async fn committed(&self, resource_id: &ResourceId) -> Result<Fields, EngineError> {
        if let Some(fields) = self.cache.get(resource_id) {
            return Ok(fields);
        }
        let fields = self.store.read(resource_id).await?.unwrap_or_default();
        self.cache.replace(resource_id, fields.clone());
        Ok(fields)
    }

    pub fn is_pending(&self, resource_id: &ResourceId) -> bool {
        self.table().timers.contains_key(resource_id)
    }

    pub fn pending_count(&self) -> usize {
        self.table().timers.len()
    }

    /// Drop the pending timer for one resource, if any.
    pub fn cancel(&self, resource_id: &ResourceId) {
        if let Some(timer) = self.table().timers.remove(resource_id) {
            timer.token.cancel();
        }
    }

    /// Cancel every pending timer and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.table().timers.clear();
    }
}

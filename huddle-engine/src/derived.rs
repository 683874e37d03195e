//! DerivedPipeline - change feed → dedup → recompute → diff → write
//!
//! Wires a `Derivation` to a resource: every relevant change notification
//! schedules a debounced job that first collapses duplicate markers and then
//! recomputes the derived fields against the cleaned set.

use crate::cache::CommittedCache;
use crate::dedup::DedupReconciliationPass;
use crate::error::EngineError;
use crate::reconciler::{DebouncedReconciler, ReconcileOutcome};
use huddle_model::{ChangeKind, DocumentStore, Fields, ResourceId, SubObject};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Game-rule half of a derived resource. The engine owns everything else.
pub trait Derivation: Send + Sync + 'static {
    /// Conditions that should currently have a canonical marker, keyed by
    /// logical key, with the payload each marker should carry.
    fn desired_markers(&self, payload: &Fields) -> BTreeMap<String, Fields>;

    /// Derived fields from the payload and the de-duplicated markers.
    fn recompute(&self, payload: &Fields, markers: &[SubObject]) -> Result<Fields, String>;

    /// Whether a change should trigger a recompute.
    fn is_relevant(&self, _change: &ChangeKind) -> bool {
        true
    }
}

pub struct DerivedPipeline {
    store: Arc<dyn DocumentStore>,
    reconciler: Arc<DebouncedReconciler>,
    cache: Arc<CommittedCache>,
    dedup: DedupReconciliationPass,
    debounce: Duration,
    shutdown: CancellationToken,
}

impl DerivedPipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        reconciler: Arc<DebouncedReconciler>,
        cache: Arc<CommittedCache>,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            reconciler,
            cache,
            dedup: DedupReconciliationPass::new(),
            debounce,
            shutdown: CancellationToken::new(),
        }
    }

    /// Follow `resource_id`'s change feed until shutdown.
    pub fn watch(self: &Arc<Self>, resource_id: ResourceId, derivation: Arc<dyn Derivation>) {
        let mut feed = self.store.on_change(&resource_id);
        let token = self.shutdown.child_token();
        let this = Arc::clone(self);

        tokio::spawn(async move {
            tracing::debug!(resource_id = %resource_id, "Derived watcher started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = feed.recv() => {
                        match next {
                            Ok(event) => {
                                this.cache.apply(&event);
                                if event.kind == ChangeKind::Deleted {
                                    this.reconciler.cancel(&resource_id);
                                    continue;
                                }
                                if derivation.is_relevant(&event.kind) {
                                    this.schedule(resource_id.clone(), derivation.clone());
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                // Missed changes: the cache may be stale, start over
                                tracing::warn!(resource_id = %resource_id, lagged = n, "Change feed lagged");
                                this.cache.invalidate(&resource_id);
                                this.schedule(resource_id.clone(), derivation.clone());
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            tracing::debug!(resource_id = %resource_id, "Derived watcher stopped");
        });
    }

    fn schedule(&self, resource_id: ResourceId, derivation: Arc<dyn Derivation>) {
        let store = self.store.clone();
        let dedup = self.dedup;
        let job_id = resource_id.clone();
        self.reconciler.schedule(
            resource_id,
            move || async move { derive(store.as_ref(), dedup, &job_id, derivation.as_ref()).await },
            self.debounce,
        );
    }

    /// Run the whole pipeline for `resource_id` now, bypassing the debounce.
    ///
    /// The diff is taken against a fresh read of the store: writes made by
    /// other peers while this one was not the writer only reach the cache
    /// through a live watcher.
    pub async fn run_once(
        &self,
        resource_id: &ResourceId,
        derivation: Arc<dyn Derivation>,
    ) -> Result<ReconcileOutcome, EngineError> {
        self.cache.invalidate(resource_id);
        let store = self.store.clone();
        let dedup = self.dedup;
        let job_id = resource_id.clone();
        self.reconciler
            .run_now(resource_id, move || async move {
                derive(store.as_ref(), dedup, &job_id, derivation.as_ref()).await
            })
            .await
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// The recompute job. Only ever invoked by the elected writer.
async fn derive(
    store: &dyn DocumentStore,
    dedup: DedupReconciliationPass,
    resource_id: &ResourceId,
    derivation: &dyn Derivation,
) -> Result<Fields, String> {
    let payload = store
        .read(resource_id)
        .await
        .map_err(|e| e.to_string())?
        .unwrap_or_default();
    let mut markers = store.list_sub_objects(resource_id).await.map_err(|e| e.to_string())?;

    let plan = dedup.reconcile(resource_id, &markers, &derivation.desired_markers(&payload));
    if !plan.is_empty() {
        match dedup.apply(store, resource_id, plan).await {
            Ok(()) => {
                markers = store.list_sub_objects(resource_id).await.map_err(|e| e.to_string())?;
            }
            // Recompute still runs on what is there; the next change retries
            Err(e) => tracing::warn!(resource_id = %resource_id, error = %e, "Dedup pass failed"),
        }
    }

    derivation.recompute(&payload, &markers)
}

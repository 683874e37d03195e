//! SimStore - in-memory DocumentStore implementation
//!
//! A shared `StoreNetwork` holds every resource; each simulated peer gets a
//! `SimStore` view stamped with its own identity so the network can enforce
//! per-resource write permissions and attribute change notifications.

use huddle_model::{
    ChangeEvent, ChangeKind, DocumentStore, Fields, NewSubObject, PeerId, ResourceId, StoreError,
    SubObject, SubObjectId,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

const CHANGE_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Record {
    fields: Fields,
    subs: Vec<SubObject>,
}

#[derive(Debug, Default)]
struct StoreState {
    records: HashMap<ResourceId, Record>,
    acl: HashMap<ResourceId, BTreeSet<PeerId>>,
    feeds: HashMap<ResourceId, broadcast::Sender<ChangeEvent>>,
    writes: HashMap<ResourceId, u64>,
    next_sub_id: u64,
}

impl StoreState {
    fn feed(&mut self, resource_id: &ResourceId) -> broadcast::Sender<ChangeEvent> {
        self.feeds
            .entry(resource_id.clone())
            .or_insert_with(|| broadcast::channel(CHANGE_CAPACITY).0)
            .clone()
    }

    fn check_write(&self, author: &PeerId, resource_id: &ResourceId) -> Result<(), StoreError> {
        match self.acl.get(resource_id) {
            Some(writers) if !writers.contains(author) => Err(StoreError::WriteRejected {
                resource_id: resource_id.clone(),
                reason: format!("{} lacks write permission", author),
            }),
            _ => Ok(()),
        }
    }

    fn count_write(&mut self, resource_id: &ResourceId) {
        *self.writes.entry(resource_id.clone()).or_default() += 1;
    }

    fn notify(&mut self, resource_id: &ResourceId, author: &PeerId, kind: ChangeKind) {
        let event = ChangeEvent {
            resource_id: resource_id.clone(),
            author: author.clone(),
            kind,
        };
        // No watchers is fine
        let _ = self.feed(resource_id).send(event);
    }
}

/// Shared store broker - the single copy of every simulated resource.
#[derive(Clone, Debug, Default)]
pub struct StoreNetwork {
    state: Arc<Mutex<StoreState>>,
}

impl StoreNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("lock poisoned".into()))
    }

    /// A view of the store acting as `peer`.
    pub fn view(&self, peer: impl Into<PeerId>) -> SimStore {
        SimStore {
            peer: peer.into(),
            network: self.clone(),
        }
    }

    /// Restrict writes on `resource_id` to `writers`. Unrestricted resources
    /// accept writes from anyone.
    pub fn restrict<I, P>(&self, resource_id: impl Into<ResourceId>, writers: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PeerId>,
    {
        if let Ok(mut state) = self.lock() {
            state
                .acl
                .insert(resource_id.into(), writers.into_iter().map(Into::into).collect());
        }
    }

    /// Number of committed top-level writes that changed `resource_id`.
    pub fn write_count(&self, resource_id: &ResourceId) -> u64 {
        self.lock()
            .map(|s| s.writes.get(resource_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Seed a resource without permission checks or notifications.
    pub fn seed(&self, resource_id: impl Into<ResourceId>, fields: Fields) {
        if let Ok(mut state) = self.lock() {
            state.records.entry(resource_id.into()).or_default().fields = fields;
        }
    }

    /// Seed sub-objects without permission checks or notifications.
    pub fn seed_sub_objects(&self, resource_id: impl Into<ResourceId>, payloads: Vec<NewSubObject>) {
        if let Ok(mut state) = self.lock() {
            let resource_id = resource_id.into();
            for payload in payloads {
                state.next_sub_id += 1;
                let id = SubObjectId::new(format!("sub-{:06}", state.next_sub_id));
                state.records.entry(resource_id.clone()).or_default().subs.push(SubObject {
                    id,
                    logical_key: payload.logical_key,
                    marker_fields: payload.marker_fields,
                });
            }
        }
    }
}

/// One peer's view of the shared store.
#[derive(Clone, Debug)]
pub struct SimStore {
    peer: PeerId,
    network: StoreNetwork,
}

impl SimStore {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn network(&self) -> &StoreNetwork {
        &self.network
    }
}

#[async_trait::async_trait]
impl DocumentStore for SimStore {
    async fn read(&self, resource_id: &ResourceId) -> Result<Option<Fields>, StoreError> {
        let state = self.network.lock()?;
        Ok(state.records.get(resource_id).map(|r| r.fields.clone()))
    }

    async fn write(&self, resource_id: &ResourceId, fields: Fields) -> Result<(), StoreError> {
        let mut state = self.network.lock()?;
        state.check_write(&self.peer, resource_id)?;

        let record = state.records.entry(resource_id.clone()).or_default();
        let mut changed = Fields::new();
        for (key, value) in fields {
            if record.fields.get(&key) != Some(&value) {
                record.fields.insert(key.clone(), value.clone());
                changed.insert(key, value);
            }
        }
        // A write that changes nothing does not commit
        if changed.is_empty() {
            return Ok(());
        }
        state.count_write(resource_id);
        state.notify(resource_id, &self.peer, ChangeKind::Updated(changed));
        Ok(())
    }

    async fn delete(&self, resource_id: &ResourceId) -> Result<(), StoreError> {
        let mut state = self.network.lock()?;
        state.check_write(&self.peer, resource_id)?;
        if state.records.remove(resource_id).is_none() {
            return Err(StoreError::NotFound(resource_id.clone()));
        }
        state.notify(resource_id, &self.peer, ChangeKind::Deleted);
        Ok(())
    }

    fn on_change(&self, resource_id: &ResourceId) -> broadcast::Receiver<ChangeEvent> {
        match self.network.lock() {
            Ok(mut state) => state.feed(resource_id).subscribe(),
            Err(_) => {
                // Poisoned store: hand out a feed that is already closed
                let (_, rx) = broadcast::channel(1);
                rx
            }
        }
    }

    async fn list_sub_objects(&self, resource_id: &ResourceId) -> Result<Vec<SubObject>, StoreError> {
        let state = self.network.lock()?;
        Ok(state
            .records
            .get(resource_id)
            .map(|r| r.subs.clone())
            .unwrap_or_default())
    }

    async fn create_sub_objects(
        &self,
        resource_id: &ResourceId,
        payloads: Vec<NewSubObject>,
    ) -> Result<Vec<SubObjectId>, StoreError> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        let mut state = self.network.lock()?;
        state.check_write(&self.peer, resource_id)?;

        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            state.next_sub_id += 1;
            let id = SubObjectId::new(format!("sub-{:06}", state.next_sub_id));
            state.records.entry(resource_id.clone()).or_default().subs.push(SubObject {
                id: id.clone(),
                logical_key: payload.logical_key,
                marker_fields: payload.marker_fields,
            });
            ids.push(id);
        }
        state.notify(resource_id, &self.peer, ChangeKind::SubObjectsChanged);
        Ok(ids)
    }

    async fn delete_sub_objects(
        &self,
        resource_id: &ResourceId,
        ids: &[SubObjectId],
    ) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut state = self.network.lock()?;
        state.check_write(&self.peer, resource_id)?;

        let Some(record) = state.records.get_mut(resource_id) else {
            return Err(StoreError::NotFound(resource_id.clone()));
        };
        let before = record.subs.len();
        record.subs.retain(|s| !ids.contains(&s.id));
        if record.subs.len() != before {
            state.notify(resource_id, &self.peer, ChangeKind::SubObjectsChanged);
        }
        Ok(())
    }
}

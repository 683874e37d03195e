//! Session-scoped cache of last committed resource payloads
//!
//! Lives as long as the peer's session. Entries are only ever created from a
//! full read, then kept current from change notifications, and dropped when
//! the resource is deleted or the session disconnects.

use huddle_model::{ChangeEvent, ChangeKind, Fields, ResourceId};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
pub struct CommittedCache {
    inner: RwLock<HashMap<ResourceId, Fields>>,
}

impl CommittedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, resource_id: &ResourceId) -> Option<Fields> {
        self.inner.read().ok()?.get(resource_id).cloned()
    }

    /// Replace the entry with a full payload.
    pub fn replace(&self, resource_id: &ResourceId, fields: Fields) {
        if let Ok(mut inner) = self.inner.write() {
            inner.insert(resource_id.clone(), fields);
        }
    }

    /// Merge committed fields into an existing entry. No-op without an entry,
    /// so a partial payload never masquerades as a full one.
    pub fn merge(&self, resource_id: &ResourceId, fields: &Fields) {
        let Ok(mut inner) = self.inner.write() else { return };
        if let Some(entry) = inner.get_mut(resource_id) {
            for (key, value) in fields {
                entry.insert(key.clone(), value.clone());
            }
        }
    }

    pub fn invalidate(&self, resource_id: &ResourceId) {
        if let Ok(mut inner) = self.inner.write() {
            inner.remove(resource_id);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.write() {
            inner.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fold a store change notification into the cache.
    pub fn apply(&self, event: &ChangeEvent) {
        match &event.kind {
            ChangeKind::Updated(changed) => self.merge(&event.resource_id, changed),
            ChangeKind::Deleted => self.invalidate(&event.resource_id),
            ChangeKind::SubObjectsChanged => {}
        }
    }
}

/// Fields of `next` whose value differs from `committed`.
pub fn diff_fields(committed: &Fields, next: &Fields) -> Fields {
    next.iter()
        .filter(|(key, value)| committed.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_model::PeerId;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_diff_only_reports_changes() {
        let committed = fields(json!({"hp": 10, "max": 12, "name": "x"}));
        let next = fields(json!({"hp": 8, "max": 12}));
        assert_eq!(diff_fields(&committed, &next), fields(json!({"hp": 8})));
        assert!(diff_fields(&next, &next).is_empty());
    }

    #[test]
    fn test_merge_requires_full_entry() {
        let cache = CommittedCache::new();
        let res = ResourceId::new("a");
        cache.merge(&res, &fields(json!({"hp": 1})));
        assert!(cache.get(&res).is_none());

        cache.replace(&res, fields(json!({"hp": 1, "max": 2})));
        cache.merge(&res, &fields(json!({"hp": 2})));
        assert_eq!(cache.get(&res), Some(fields(json!({"hp": 2, "max": 2}))));
    }

    #[test]
    fn test_deleted_event_invalidates() {
        let cache = CommittedCache::new();
        let res = ResourceId::new("a");
        cache.replace(&res, fields(json!({"hp": 1})));
        cache.apply(&ChangeEvent {
            resource_id: res.clone(),
            author: PeerId::from("gm"),
            kind: ChangeKind::Deleted,
        });
        assert!(cache.is_empty());
    }
}

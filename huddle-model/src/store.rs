//! DocumentStore - the passive persistence collaborator
//!
//! The store persists records and relays change notifications. It holds no
//! business logic of its own; the only rule it enforces is its own
//! permission check, surfaced as `StoreError::WriteRejected`.

use crate::types::{Fields, PeerId, ResourceId, SubObjectId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Marker field proving a sub-object was created by this engine.
pub const MANAGED_MARKER: &str = "huddle.managed";

/// Error type for document store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("write rejected for {resource_id}: {reason}")]
    WriteRejected { resource_id: ResourceId, reason: String },
    #[error("resource not found: {0}")]
    NotFound(ResourceId),
    #[error("store backend: {0}")]
    Backend(String),
}

/// Provenance of a sub-object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Created by this engine (carries `MANAGED_MARKER`)
    Ours,
    /// Created by anything else
    Foreign,
}

/// A sub-entity stored inside a resource (e.g. one status marker).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubObject {
    pub id: SubObjectId,
    /// Semantic identity, e.g. a condition name.
    pub logical_key: String,
    /// Engine-specific flags proving provenance, plus the marker's payload.
    #[serde(default)]
    pub marker_fields: Fields,
}

impl SubObject {
    pub fn origin(&self) -> Origin {
        match self.marker_fields.get(MANAGED_MARKER) {
            Some(serde_json::Value::Bool(true)) => Origin::Ours,
            _ => Origin::Foreign,
        }
    }
}

/// Payload for a sub-object the store has not assigned an id to yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewSubObject {
    pub logical_key: String,
    #[serde(default)]
    pub marker_fields: Fields,
}

impl NewSubObject {
    /// A canonical instance owned by this engine.
    pub fn canonical(logical_key: impl Into<String>, mut fields: Fields) -> Self {
        fields.insert(MANAGED_MARKER.to_string(), serde_json::Value::Bool(true));
        Self {
            logical_key: logical_key.into(),
            marker_fields: fields,
        }
    }

    /// An instance without the engine marker.
    pub fn foreign(logical_key: impl Into<String>, fields: Fields) -> Self {
        Self {
            logical_key: logical_key.into(),
            marker_fields: fields,
        }
    }
}

/// What changed in a committed write.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeKind {
    /// Top-level fields were written; carries only the changed fields
    Updated(Fields),
    /// Sub-objects were created or deleted
    SubObjectsChanged,
    /// The resource itself was deleted
    Deleted,
}

/// Notification fired on every peer after a write commits.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    pub resource_id: ResourceId,
    pub author: PeerId,
    pub kind: ChangeKind,
}

/// Document store abstraction.
///
/// Production uses whatever the host session provides; the sim crate ships
/// an in-memory implementation with per-peer permission enforcement.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Current payload, or `None` if the resource does not exist.
    async fn read(&self, resource_id: &ResourceId) -> Result<Option<Fields>, StoreError>;

    /// Merge `fields` into the resource, creating it if needed.
    async fn write(&self, resource_id: &ResourceId, fields: Fields) -> Result<(), StoreError>;

    /// Delete the resource and its sub-objects.
    async fn delete(&self, resource_id: &ResourceId) -> Result<(), StoreError>;

    /// Register for change notifications on one resource.
    ///
    /// Fires on every commit, including this peer's own writes.
    fn on_change(&self, resource_id: &ResourceId) -> broadcast::Receiver<ChangeEvent>;

    /// Sub-objects in creation order.
    async fn list_sub_objects(&self, resource_id: &ResourceId) -> Result<Vec<SubObject>, StoreError>;

    async fn create_sub_objects(
        &self,
        resource_id: &ResourceId,
        payloads: Vec<NewSubObject>,
    ) -> Result<Vec<SubObjectId>, StoreError>;

    async fn delete_sub_objects(
        &self,
        resource_id: &ResourceId,
        ids: &[SubObjectId],
    ) -> Result<(), StoreError>;
}

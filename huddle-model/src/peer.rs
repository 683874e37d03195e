//! Peer - a connected session participant, and the presence input
//!
//! Membership is only known approximately: peers learn of each other via
//! presence broadcasts, so every `PresenceProvider` snapshot is best-effort.

use crate::types::{PeerId, ResourceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A connected session participant as seen in a presence snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: PeerId,
    /// Holds an elevated role and may act as the authority.
    pub is_authority_candidate: bool,
    /// Currently connected.
    pub is_active: bool,
    /// Resources this peer is explicitly permitted to write.
    #[serde(default)]
    pub owned_resource_ids: BTreeSet<ResourceId>,
}

impl Peer {
    /// An active peer without elevated role or owned resources.
    pub fn new(id: impl Into<PeerId>) -> Self {
        Self {
            id: id.into(),
            is_authority_candidate: false,
            is_active: true,
            owned_resource_ids: BTreeSet::new(),
        }
    }

    /// An active authority candidate.
    pub fn authority(id: impl Into<PeerId>) -> Self {
        Self {
            is_authority_candidate: true,
            ..Self::new(id)
        }
    }

    pub fn with_owned(mut self, resource_id: impl Into<ResourceId>) -> Self {
        self.owned_resource_ids.insert(resource_id.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    pub fn owns(&self, resource_id: &ResourceId) -> bool {
        self.owned_resource_ids.contains(resource_id)
    }

    /// Authority candidate or explicit owner of the resource.
    pub fn is_privileged_for(&self, resource_id: &ResourceId) -> bool {
        self.is_authority_candidate || self.owns(resource_id)
    }
}

/// Event emitted when the presence view changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    /// Peer seen for the first time (or again after expiring)
    Joined(Peer),
    /// Known peer announced different flags or ownership
    Updated(Peer),
    /// Peer said goodbye or its presence expired
    Left(PeerId),
}

/// Best-effort snapshot of currently connected peers.
///
/// The engine never assumes this is instantaneously consistent across
/// peers; election tolerates the staleness.
pub trait PresenceProvider: Send + Sync {
    /// Currently active peers, with their candidate and permission flags.
    fn active_peers(&self) -> Vec<Peer>;

    /// Subscribe to presence changes.
    fn subscribe_peer_events(&self) -> tokio::sync::broadcast::Receiver<PeerEvent>;
}

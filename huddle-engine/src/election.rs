//! Writer election without consensus messaging
//!
//! Every peer computes the same winner from the same presence snapshot, so
//! no coordination messages are needed. A stale snapshot only causes a
//! short window where two peers both skip or both write; the next recompute
//! heals it.

use huddle_model::{OwnershipPolicy, Peer, PeerId, PresenceProvider, ResourceId, SessionMemberPolicy, WritePolicy};
use std::sync::Arc;

/// Pick the one peer allowed to perform a guarded mutation on `resource_id`.
///
/// Lowest authority-candidate id wins; without any candidate, the lowest id
/// among explicit owners of the resource. `None` when nobody is eligible.
pub fn elect_writer(resource_id: &ResourceId, active_peers: &[Peer]) -> Option<PeerId> {
    elect_authority(active_peers).or_else(|| {
        active_peers
            .iter()
            .filter(|p| p.is_active && p.owns(resource_id))
            .map(|p| &p.id)
            .min()
            .cloned()
    })
}

/// Lowest-id active authority candidate. This is the RPC routing target.
pub fn elect_authority(active_peers: &[Peer]) -> Option<PeerId> {
    active_peers
        .iter()
        .filter(|p| p.is_active && p.is_authority_candidate)
        .map(|p| &p.id)
        .min()
        .cloned()
}

pub fn is_elected_writer(self_id: &PeerId, resource_id: &ResourceId, active_peers: &[Peer]) -> bool {
    elect_writer(resource_id, active_peers).as_ref() == Some(self_id)
}

/// Outcome of asking whether the local peer may perform a guarded write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteDecision {
    /// Local peer is the elected writer.
    Elected,
    /// Another peer is responsible.
    NotElected { writer: PeerId },
    /// Nobody is elected but the local peer is privileged, so it writes anyway.
    Fallback,
    /// Nobody is elected and the local peer has no rights.
    Denied,
}

impl WriteDecision {
    pub fn may_write(&self) -> bool {
        matches!(self, WriteDecision::Elected | WriteDecision::Fallback)
    }

    pub fn writer(&self) -> Option<&PeerId> {
        match self {
            WriteDecision::NotElected { writer } => Some(writer),
            _ => None,
        }
    }
}

/// Combines the local identity with live presence to gate guarded writes.
pub struct WriteGate {
    local: Peer,
    presence: Arc<dyn PresenceProvider>,
}

impl WriteGate {
    pub fn new(local: Peer, presence: Arc<dyn PresenceProvider>) -> Self {
        Self { local, presence }
    }

    pub fn local(&self) -> &Peer {
        &self.local
    }

    /// Current presence snapshot, always including the local peer.
    pub fn peers(&self) -> Vec<Peer> {
        with_local(self.presence.active_peers(), &self.local)
    }

    pub fn decide(&self, resource_id: &ResourceId) -> WriteDecision {
        let peers = self.peers();
        match elect_writer(resource_id, &peers) {
            Some(writer) if writer == self.local.id => WriteDecision::Elected,
            Some(writer) => WriteDecision::NotElected { writer },
            None if self.local.is_privileged_for(resource_id) => {
                // Availability over exclusivity: admits a short duplicate-write
                // window during authority handoff.
                tracing::debug!(resource_id = %resource_id, peer = %self.local.id, "No elected writer, writing as privileged fallback");
                WriteDecision::Fallback
            }
            None => WriteDecision::Denied,
        }
    }
}

/// Who may write a resource directly, and on whose behalf the authority
/// may write it through RPC.
#[derive(Clone)]
pub struct AccessPolicies {
    pub direct: Arc<dyn WritePolicy>,
    pub delegated: Arc<dyn WritePolicy>,
}

impl Default for AccessPolicies {
    fn default() -> Self {
        Self {
            direct: Arc::new(OwnershipPolicy),
            delegated: Arc::new(SessionMemberPolicy),
        }
    }
}

impl AccessPolicies {
    pub fn new(direct: impl WritePolicy + 'static, delegated: impl WritePolicy + 'static) -> Self {
        Self { direct: Arc::new(direct), delegated: Arc::new(delegated) }
    }
}

/// Ensure the local peer is present in a snapshot that may not list it yet.
pub fn with_local(mut peers: Vec<Peer>, local: &Peer) -> Vec<Peer> {
    if !peers.iter().any(|p| p.id == local.id) {
        peers.push(local.clone());
    }
    peers
}

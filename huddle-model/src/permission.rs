//! WritePolicy - who may write a resource
//!
//! This is the `permittedWriterIds` half of a resource. The store enforces
//! its own check independently; the engine uses the policy to refuse
//! unpermitted local mutations early and to re-validate RPC callers.

use crate::peer::Peer;
use crate::types::{PeerId, ResourceId};
use std::collections::BTreeSet;

/// Authorization policy for resource writes.
pub trait WritePolicy: Send + Sync {
    /// Ids of the peers in `peers` allowed to write `resource_id`.
    fn permitted_writer_ids(&self, resource_id: &ResourceId, peers: &[Peer]) -> BTreeSet<PeerId>;

    fn is_permitted(&self, peer_id: &PeerId, resource_id: &ResourceId, peers: &[Peer]) -> bool {
        self.permitted_writer_ids(resource_id, peers).contains(peer_id)
    }
}

/// Authority candidates plus explicit owners may write.
#[derive(Clone, Copy, Debug, Default)]
pub struct OwnershipPolicy;

impl WritePolicy for OwnershipPolicy {
    fn permitted_writer_ids(&self, resource_id: &ResourceId, peers: &[Peer]) -> BTreeSet<PeerId> {
        peers
            .iter()
            .filter(|p| p.is_privileged_for(resource_id))
            .map(|p| p.id.clone())
            .collect()
    }
}

/// Any active session member may write. Used for request paths where the
/// authority applies the mutation on the member's behalf.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionMemberPolicy;

impl WritePolicy for SessionMemberPolicy {
    fn permitted_writer_ids(&self, _resource_id: &ResourceId, peers: &[Peer]) -> BTreeSet<PeerId> {
        peers.iter().filter(|p| p.is_active).map(|p| p.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ownership_policy() {
        let res = ResourceId::new("actor:1");
        let peers = vec![
            Peer::authority("gm"),
            Peer::new("alice").with_owned("actor:1"),
            Peer::new("bob"),
        ];
        let ids = OwnershipPolicy.permitted_writer_ids(&res, &peers);
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![PeerId::from("alice"), PeerId::from("gm")]);
        assert!(!OwnershipPolicy.is_permitted(&PeerId::from("bob"), &res, &peers));
        assert!(SessionMemberPolicy.is_permitted(&PeerId::from("bob"), &res, &peers));
    }
}

//! SimRoster - a static, hand-driven PresenceProvider
//!
//! Tests that are not about presence use a roster shared by every simulated
//! peer, so all of them see exactly the same snapshot. Individual views can
//! be made stale with `detach` to simulate lagging presence.

use huddle_model::{Peer, PeerEvent, PeerId, PresenceProvider};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

#[derive(Clone, Debug)]
pub struct SimRoster {
    peers: Arc<RwLock<BTreeMap<PeerId, Peer>>>,
    events: broadcast::Sender<PeerEvent>,
}

impl SimRoster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            peers: Arc::new(RwLock::new(BTreeMap::new())),
            events,
        }
    }

    pub fn with_peers(peers: impl IntoIterator<Item = Peer>) -> Self {
        let roster = Self::new();
        for peer in peers {
            roster.join(peer);
        }
        roster
    }

    /// Add or update a peer.
    pub fn join(&self, peer: Peer) {
        let Ok(mut peers) = self.peers.write() else { return };
        let event = match peers.insert(peer.id.clone(), peer.clone()) {
            None => PeerEvent::Joined(peer),
            Some(old) if old != peer => PeerEvent::Updated(peer),
            Some(_) => return,
        };
        let _ = self.events.send(event);
    }

    /// Remove a peer.
    pub fn leave(&self, peer_id: &PeerId) {
        let Ok(mut peers) = self.peers.write() else { return };
        if peers.remove(peer_id).is_some() {
            let _ = self.events.send(PeerEvent::Left(peer_id.clone()));
        }
    }

    /// A frozen copy of the current roster that no longer follows updates.
    pub fn detach(&self) -> SimRoster {
        let snapshot = self.peers.read().map(|p| p.clone()).unwrap_or_default();
        let (events, _) = broadcast::channel(64);
        Self {
            peers: Arc::new(RwLock::new(snapshot)),
            events,
        }
    }
}

impl Default for SimRoster {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceProvider for SimRoster {
    fn active_peers(&self) -> Vec<Peer> {
        let Ok(peers) = self.peers.read() else { return Vec::new() };
        peers.values().filter(|p| p.is_active).cloned().collect()
    }

    fn subscribe_peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_peers_are_filtered() {
        let roster = SimRoster::with_peers([Peer::authority("gm").inactive(), Peer::new("alice")]);
        let ids: Vec<_> = roster.active_peers().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![PeerId::from("alice")]);
    }

    #[test]
    fn test_detached_view_is_stale() {
        let roster = SimRoster::with_peers([Peer::new("alice")]);
        let stale = roster.detach();
        roster.join(Peer::authority("gm"));
        assert_eq!(roster.active_peers().len(), 2);
        assert_eq!(stale.active_peers().len(), 1);
    }

    #[test]
    fn test_events_on_join_update_leave() {
        let roster = SimRoster::new();
        let mut rx = roster.subscribe_peer_events();
        roster.join(Peer::new("alice"));
        roster.join(Peer::new("alice"));
        roster.join(Peer::new("alice").with_owned("actor:1"));
        roster.leave(&PeerId::from("alice"));

        assert!(matches!(rx.try_recv().unwrap(), PeerEvent::Joined(_)));
        assert!(matches!(rx.try_recv().unwrap(), PeerEvent::Updated(_)));
        assert!(matches!(rx.try_recv().unwrap(), PeerEvent::Left(_)));
        assert!(rx.try_recv().is_err());
    }
}

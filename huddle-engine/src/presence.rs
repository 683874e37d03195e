//! PresenceTracker - who is online, learned from presence broadcasts
//!
//! Volatile session state: every peer announces itself with `Hello`, repeats
//! a `Heartbeat` every interval and says `Goodbye` on shutdown. Peers not
//! heard from within the TTL drop out of the snapshot.

use crate::config::EngineConfig;
use crate::error::EngineError;
use huddle_model::{publish_json, Delivery, Peer, PeerEvent, PeerId, PresenceProvider, PubSub};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Messages on `{prefix}.presence`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PresenceMessage {
    Hello { peer: Peer },
    Heartbeat { peer: Peer },
    Goodbye { peer_id: PeerId },
}

struct Seen {
    peer: Peer,
    last_seen: Instant,
}

pub struct PresenceTracker {
    local: Peer,
    pubsub: Arc<dyn PubSub>,
    topic: String,
    heartbeat_interval: Duration,
    ttl: Duration,
    peers: RwLock<HashMap<PeerId, Seen>>,
    events: broadcast::Sender<PeerEvent>,
    shutdown: CancellationToken,
}

impl PresenceTracker {
    /// Subscribe, announce ourselves and start the heartbeat.
    #[tracing::instrument(skip_all, fields(peer = %local.id))]
    pub async fn start(local: Peer, pubsub: Arc<dyn PubSub>, config: &EngineConfig) -> Result<Arc<Self>, EngineError> {
        let (events, _) = broadcast::channel(64);
        let tracker = Arc::new(Self {
            local,
            pubsub,
            topic: config.topic("presence"),
            heartbeat_interval: config.heartbeat_interval,
            ttl: config.presence_ttl,
            peers: RwLock::new(HashMap::new()),
            events,
            shutdown: CancellationToken::new(),
        });

        let messages = tracker.pubsub.subscribe(&tracker.topic).await?;
        tokio::spawn(tracker.clone().listen(messages));
        tokio::spawn(tracker.clone().heartbeat());

        tracker.announce(PresenceMessage::Hello { peer: tracker.local.clone() }).await?;
        Ok(tracker)
    }

    pub fn local(&self) -> &Peer {
        &self.local
    }

    /// Publish `Goodbye` and stop the background tasks.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let goodbye = PresenceMessage::Goodbye { peer_id: self.local.id.clone() };
        if let Err(e) = self.announce(goodbye).await {
            tracing::debug!(peer = %self.local.id, error = %e, "Goodbye not delivered");
        }
        self.shutdown.cancel();
    }

    /// Drop peers whose last heartbeat is older than the TTL.
    pub fn sweep(&self) {
        let now = Instant::now();
        let Ok(mut peers) = self.peers.write() else { return };
        let expired: Vec<PeerId> = peers
            .iter()
            .filter(|(_, seen)| now.duration_since(seen.last_seen) > self.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            peers.remove(&id);
            tracing::debug!(peer = %self.local.id, expired = %id, "Presence expired");
            let _ = self.events.send(PeerEvent::Left(id));
        }
    }

    async fn announce(&self, message: PresenceMessage) -> Result<(), EngineError> {
        publish_json(self.pubsub.as_ref(), &self.topic, &message).await?;
        Ok(())
    }

    /// Record a sighting. Returns `true` if the peer was not known (or had expired).
    fn observe(&self, mut peer: Peer) -> bool {
        peer.is_active = true;
        let now = Instant::now();
        let Ok(mut peers) = self.peers.write() else { return false };

        let previous = peers.insert(peer.id.clone(), Seen { peer: peer.clone(), last_seen: now });
        let event = match previous {
            Some(seen) if now.duration_since(seen.last_seen) <= self.ttl => {
                if seen.peer == peer {
                    return false;
                }
                PeerEvent::Updated(peer)
            }
            _ => PeerEvent::Joined(peer),
        };
        let joined = matches!(event, PeerEvent::Joined(_));
        let _ = self.events.send(event);
        joined
    }

    fn forget(&self, peer_id: &PeerId) {
        let Ok(mut peers) = self.peers.write() else { return };
        if peers.remove(peer_id).is_some() {
            let _ = self.events.send(PeerEvent::Left(peer_id.clone()));
        }
    }

    async fn handle(&self, delivery: Delivery) {
        if delivery.from == self.local.id {
            return;
        }
        let message: PresenceMessage = match serde_json::from_value(delivery.message) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(from = %delivery.from, error = %e, "Malformed presence message");
                return;
            }
        };

        match message {
            PresenceMessage::Hello { peer } | PresenceMessage::Heartbeat { peer } if peer.id != delivery.from => {
                tracing::warn!(from = %delivery.from, claimed = %peer.id, "Presence announcement for another peer ignored");
            }
            PresenceMessage::Hello { peer } => {
                let id = peer.id.clone();
                if self.observe(peer) {
                    tracing::info!(peer = %self.local.id, joined = %id, "Peer joined");
                    // Late joiner: tell it about us without waiting a full interval
                    let reply = PresenceMessage::Heartbeat { peer: self.local.clone() };
                    if let Err(e) = self.announce(reply).await {
                        tracing::warn!(peer = %self.local.id, error = %e, "Heartbeat reply failed");
                    }
                }
            }
            PresenceMessage::Heartbeat { peer } => {
                let id = peer.id.clone();
                if self.observe(peer) {
                    tracing::info!(peer = %self.local.id, joined = %id, "Peer joined");
                }
            }
            PresenceMessage::Goodbye { peer_id } => {
                if peer_id == delivery.from {
                    tracing::info!(peer = %self.local.id, left = %peer_id, "Peer left");
                    self.forget(&peer_id);
                }
            }
        }
    }

    async fn listen(self: Arc<Self>, mut messages: broadcast::Receiver<Delivery>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = messages.recv() => match next {
                    Ok(delivery) => self.handle(delivery).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(peer = %self.local.id, lagged = n, "Presence listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    async fn heartbeat(self: Arc<Self>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep();
                    let beat = PresenceMessage::Heartbeat { peer: self.local.clone() };
                    if let Err(e) = self.announce(beat).await {
                        tracing::warn!(peer = %self.local.id, error = %e, "Heartbeat failed");
                    }
                }
            }
        }
    }
}

impl PresenceProvider for PresenceTracker {
    /// Peers heard from within the TTL plus ourselves, sorted by id.
    fn active_peers(&self) -> Vec<Peer> {
        let now = Instant::now();
        let mut active: Vec<Peer> = match self.peers.read() {
            Ok(peers) => peers
                .values()
                .filter(|seen| now.duration_since(seen.last_seen) <= self.ttl)
                .map(|seen| seen.peer.clone())
                .collect(),
            Err(_) => Vec::new(),
        };
        let mut local = self.local.clone();
        local.is_active = true;
        active.push(local);
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    fn subscribe_peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}

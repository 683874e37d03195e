//! BroadcastPubSub - in-memory PubSub implementation
//!
//! Uses `tokio::sync::broadcast` per topic. A shared `BusNetwork` broker
//! connects multiple `BroadcastPubSub` instances, one per simulated peer.

use huddle_model::{Delivery, PeerId, PubSub, PubSubError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

const TOPIC_CAPACITY: usize = 256;

/// Shared broadcast network - routes messages between BroadcastPubSub instances.
///
/// Each topic gets a broadcast channel. Every subscribed peer for that topic
/// shares the same channel.
#[derive(Clone, Debug, Default)]
pub struct BusNetwork {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<Delivery>>>>,
    published: Arc<std::sync::Mutex<HashMap<String, u64>>>,
}

impl BusNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the broadcast channel for a topic.
    async fn get_or_create(&self, topic: &str) -> broadcast::Sender<Delivery> {
        let mut channels = self.channels.write().await;
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }

    fn record_publish(&self, topic: &str) {
        if let Ok(mut published) = self.published.lock() {
            *published.entry(topic.to_string()).or_default() += 1;
        }
    }

    /// Number of messages ever published on `topic` by any peer.
    pub fn published_count(&self, topic: &str) -> u64 {
        self.published
            .lock()
            .map(|p| p.get(topic).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

/// In-memory PubSub implementation for one peer.
///
/// Each `subscribe` spawns a forwarder task from the shared topic channel
/// into a per-subscription channel, so the peer can be taken offline or
/// made to lose a message without affecting other peers.
pub struct BroadcastPubSub {
    local: PeerId,
    network: BusNetwork,
    shutdown: CancellationToken,
    offline: Arc<AtomicBool>,
    drop_next_message: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl BroadcastPubSub {
    pub fn new(local: impl Into<PeerId>, network: &BusNetwork) -> Self {
        Self {
            local: local.into(),
            network: network.clone(),
            shutdown: CancellationToken::new(),
            offline: Arc::new(AtomicBool::new(false)),
            drop_next_message: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Tell this peer to drop the next incoming message it receives.
    pub fn drop_next_incoming_message(&self) {
        self.drop_next_message.store(true, Ordering::SeqCst);
    }

    /// While offline, outbound messages are discarded and inbound ones dropped.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Number of inbound messages this peer has dropped.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Cancel every forwarder task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[async_trait::async_trait]
impl PubSub for BroadcastPubSub {
    fn local_peer(&self) -> PeerId {
        self.local.clone()
    }

    async fn publish(&self, topic: &str, message: serde_json::Value) -> Result<(), PubSubError> {
        if self.shutdown.is_cancelled() {
            return Err(PubSubError::Publish("pubsub shut down".into()));
        }
        if self.is_offline() {
            tracing::trace!(peer = %self.local, topic, "Offline, discarding outbound message");
            return Ok(());
        }
        let sender = self.network.get_or_create(topic).await;
        self.network.record_publish(topic);
        // No receivers is not an error for fire-and-forget delivery
        let _ = sender.send(Delivery {
            from: self.local.clone(),
            message,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Delivery>, PubSubError> {
        if self.shutdown.is_cancelled() {
            return Err(PubSubError::Subscribe("pubsub shut down".into()));
        }
        let mut receiver = self.network.get_or_create(topic).await.subscribe();
        let (inbound_tx, inbound_rx) = broadcast::channel(TOPIC_CAPACITY);

        let token = self.shutdown.child_token();

        let offline = self.offline.clone();
        let drop_flag = self.drop_next_message.clone();
        let dropped = self.dropped.clone();
        let local = self.local.clone();
        let topic_name = topic.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    result = receiver.recv() => {
                        match result {
                            Ok(delivery) => {
                                if offline.load(Ordering::SeqCst) {
                                    dropped.fetch_add(1, Ordering::SeqCst);
                                    continue;
                                }
                                // Test injection: drop exactly one message if flag is set
                                if drop_flag.compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
                                    tracing::info!(peer = %local, topic = %topic_name, from = %delivery.from, "TEST: Intentionally dropping incoming message");
                                    dropped.fetch_add(1, Ordering::SeqCst);
                                    continue;
                                }
                                if inbound_tx.send(delivery).is_err() {
                                    // Subscriber went away
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                tracing::warn!(lagged = n, topic = %topic_name, "Broadcast bus forwarder lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        });

        tracing::debug!(peer = %self.local, topic, "BroadcastPubSub subscribed");
        Ok(inbound_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber_including_self() {
        let net = BusNetwork::new();
        let a = BroadcastPubSub::new("a", &net);
        let b = BroadcastPubSub::new("b", &net);

        let mut rx_a = a.subscribe("t").await.unwrap();
        let mut rx_b = b.subscribe("t").await.unwrap();

        a.publish("t", json!({"n": 1})).await.unwrap();

        let got_a = rx_a.recv().await.unwrap();
        let got_b = rx_b.recv().await.unwrap();
        assert_eq!(got_a.from, PeerId::from("a"));
        assert_eq!(got_b.message, json!({"n": 1}));
        assert_eq!(net.published_count("t"), 1);
    }

    #[tokio::test]
    async fn test_drop_next_incoming_message() {
        let net = BusNetwork::new();
        let a = BroadcastPubSub::new("a", &net);
        let b = BroadcastPubSub::new("b", &net);
        let mut rx_b = b.subscribe("t").await.unwrap();

        b.drop_next_incoming_message();
        a.publish("t", json!(1)).await.unwrap();
        a.publish("t", json!(2)).await.unwrap();

        let got = rx_b.recv().await.unwrap();
        assert_eq!(got.message, json!(2));
        assert_eq!(b.dropped_count(), 1);
    }

    #[tokio::test]
    async fn test_offline_peer_neither_sends_nor_receives() {
        let net = BusNetwork::new();
        let a = BroadcastPubSub::new("a", &net);
        let b = BroadcastPubSub::new("b", &net);
        let mut rx_b = b.subscribe("t").await.unwrap();

        a.set_offline(true);
        a.publish("t", json!("lost")).await.unwrap();
        assert_eq!(net.published_count("t"), 0);

        a.set_offline(false);
        a.publish("t", json!("kept")).await.unwrap();
        assert_eq!(rx_b.recv().await.unwrap().message, json!("kept"));
    }
}

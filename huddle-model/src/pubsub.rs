//! PubSub - fire-and-forget topic broadcast
//!
//! At-most-once, unordered across broadcasters. Every subscriber receives
//! `(sender, message)`; the sender id is stamped by the transport, not by
//! the message body, so receivers can trust it.

use crate::types::PeerId;
use tokio::sync::broadcast;

/// A message delivered to a subscriber.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub from: PeerId,
    pub message: serde_json::Value,
}

/// Error type for pub/sub operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PubSubError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Pub/sub abstraction.
///
/// Delivery includes the publishing peer's own subscribers.
#[async_trait::async_trait]
pub trait PubSub: Send + Sync + 'static {
    /// This peer's transport identity.
    fn local_peer(&self) -> PeerId;

    /// Fire-and-forget broadcast to every subscriber of `topic`.
    async fn publish(&self, topic: &str, message: serde_json::Value) -> Result<(), PubSubError>;

    /// Subscribe to a topic.
    async fn subscribe(&self, topic: &str) -> Result<broadcast::Receiver<Delivery>, PubSubError>;
}

/// Serialize a typed message and publish it.
pub async fn publish_json<T: serde::Serialize + Sync>(
    pubsub: &(impl PubSub + ?Sized),
    topic: &str,
    message: &T,
) -> Result<(), PubSubError> {
    let value = serde_json::to_value(message).map_err(|e| PubSubError::Encode(e.to_string()))?;
    pubsub.publish(topic, value).await
}

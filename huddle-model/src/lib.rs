//! Huddle Model
//!
//! Pure data types and collaborator traits for the huddle peer-coordination
//! engine, decoupled from any concrete store, transport or presence source.
//!
//! - `types`: id newtypes and `Fields`
//! - `peer`: `Peer`, `PeerEvent`, `PresenceProvider`
//! - `store`: `DocumentStore`, sub-objects, change notifications
//! - `pubsub`: `PubSub` topic broadcast
//! - `permission`: `WritePolicy`

pub mod types;
pub mod peer;
pub mod store;
pub mod pubsub;
pub mod permission;

// Re-exports
pub use types::{Fields, PeerId, ResourceId, SubObjectId};
pub use peer::{Peer, PeerEvent, PresenceProvider};
pub use store::{
    ChangeEvent, ChangeKind, DocumentStore, NewSubObject, Origin, StoreError, SubObject,
    MANAGED_MARKER,
};
pub use pubsub::{publish_json, Delivery, PubSub, PubSubError};
pub use permission::{OwnershipPolicy, SessionMemberPolicy, WritePolicy};

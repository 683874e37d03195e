//! In-memory session simulation for Huddle
//!
//! Provides:
//! - `BroadcastPubSub` - `PubSub` impl using broadcast channels
//! - `SimStore` - `DocumentStore` impl with per-peer permission checks
//! - `SimRoster` - hand-driven `PresenceProvider`
//!
//! Enables multi-peer coordination testing without a real host session.

mod broadcast_bus;
mod memory_store;
mod roster;

pub use broadcast_bus::{BroadcastPubSub, BusNetwork};
pub use memory_store::{SimStore, StoreNetwork};
pub use roster::SimRoster;

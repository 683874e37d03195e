// Each integration test compiles as a separate binary that includes this module via `mod common;`.
// Not every test binary uses every helper, so Rust emits spurious dead_code warnings.
#![allow(dead_code)]
//! Shared test utilities for huddle-engine integration tests.

use huddle_engine::{EngineConfig, Session};
use huddle_model::{Fields, Peer, PeerId, PresenceProvider, ResourceId};
use huddle_net_sim::{BroadcastPubSub, BusNetwork, SimRoster, SimStore, StoreNetwork};
use std::sync::Arc;
use tokio::time::Duration;

pub const REQUEST_TOPIC: &str = "huddle.rpc.request";
pub const RESPONSE_TOPIC: &str = "huddle.rpc.response";
pub const COUNTER_TOPIC: &str = "huddle.counter";

/// Turn a `json!({...})` literal into `Fields`.
pub fn fields(value: serde_json::Value) -> Fields {
    value.as_object().cloned().unwrap_or_default()
}

/// Let every spawned task run. Under a paused clock this only advances
/// virtual time once the runtime is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// One simulated peer.
pub struct TestPeer {
    pub session: Arc<Session>,
    pub pubsub: Arc<BroadcastPubSub>,
    pub store: SimStore,
}

impl TestPeer {
    pub fn id(&self) -> &PeerId {
        &self.session.local().id
    }
}

/// Several sessions sharing one bus and one store.
pub struct TestMesh {
    pub bus: BusNetwork,
    pub store: StoreNetwork,
    pub roster: SimRoster,
    pub config: EngineConfig,
    pub peers: Vec<TestPeer>,
}

impl TestMesh {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            bus: BusNetwork::new(),
            store: StoreNetwork::new(),
            roster: SimRoster::new(),
            config,
            peers: Vec::new(),
        }
    }

    /// Sessions that share a hand-driven roster for presence.
    pub async fn with_roster(peers: Vec<Peer>) -> Self {
        let mut mesh = Self::new(EngineConfig::default());
        for peer in peers {
            mesh.add_rostered(peer).await;
        }
        mesh
    }

    /// Add a session whose presence comes from the shared roster.
    pub async fn add_rostered(&mut self, peer: Peer) -> &TestPeer {
        self.roster.join(peer.clone());
        let presence: Arc<dyn PresenceProvider> = Arc::new(self.roster.clone());
        self.add(peer, Some(presence)).await
    }

    /// Add a session that learns presence from heartbeats on the bus.
    pub async fn add_heartbeat(&mut self, peer: Peer) -> &TestPeer {
        self.add(peer, None).await
    }

    async fn add(&mut self, peer: Peer, presence: Option<Arc<dyn PresenceProvider>>) -> &TestPeer {
        let pubsub = Arc::new(BroadcastPubSub::new(peer.id.clone(), &self.bus));
        let store = self.store.view(peer.id.clone());

        let mut builder = Session::builder(peer)
            .with_config(self.config.clone())
            .with_store(Arc::new(store.clone()))
            .with_pubsub(pubsub.clone());
        if let Some(presence) = presence {
            builder = builder.with_presence(presence);
        }
        let session = builder.build().await.expect("build session");

        self.peers.push(TestPeer { session, pubsub, store });
        self.peers.last().expect("just pushed")
    }

    pub fn peer(&self, id: &str) -> &TestPeer {
        self.peers
            .iter()
            .find(|p| p.id().as_str() == id)
            .unwrap_or_else(|| panic!("no peer {}", id))
    }

    pub async fn shutdown(&self) {
        for peer in &self.peers {
            peer.session.shutdown().await;
            peer.pubsub.shutdown();
        }
    }
}

pub fn rid(id: &str) -> ResourceId {
    ResourceId::new(id)
}

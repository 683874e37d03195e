//! Heartbeat presence: joining, expiry, goodbye and authority failover

mod common;

use common::{settle, TestMesh};
use huddle_engine::rpc::RpcContext;
use huddle_engine::{EngineConfig, EngineError};
use huddle_model::{Peer, PeerEvent, PeerId, PresenceProvider};
use serde_json::{json, Value};
use tokio::time::Duration;

fn ids(peers: Vec<Peer>) -> Vec<String> {
    peers.into_iter().map(|p| p.id.into_inner()).collect()
}

async fn heartbeat_mesh(peers: Vec<Peer>) -> TestMesh {
    let mut mesh = TestMesh::new(EngineConfig::default());
    for peer in peers {
        mesh.add_heartbeat(peer).await;
        settle().await;
    }
    mesh
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_learns_the_roster_immediately() {
    let mut mesh = heartbeat_mesh(vec![Peer::authority("gm"), Peer::new("alice")]).await;
    mesh.add_heartbeat(Peer::new("carol")).await;
    settle().await;

    // Well inside the first heartbeat interval
    for peer in ["gm", "alice", "carol"] {
        assert_eq!(ids(mesh.peer(peer).session.presence().active_peers()), vec!["alice", "carol", "gm"]);
    }
    assert_eq!(mesh.peer("carol").session.gateway().authority(), Some(PeerId::from("gm")));
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_expires_after_the_ttl() {
    let mesh = heartbeat_mesh(vec![Peer::authority("gm"), Peer::new("alice")]).await;
    let gm = &mesh.peer("gm").session;
    let mut events = gm.presence().subscribe_peer_events();

    mesh.peer("alice").pubsub.set_offline(true);
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(ids(gm.presence().active_peers()), vec!["alice", "gm"]);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(ids(gm.presence().active_peers()), vec!["gm"]);
    assert_eq!(events.try_recv().unwrap(), PeerEvent::Left(PeerId::from("alice")));
}

#[tokio::test(start_paused = true)]
async fn test_goodbye_removes_the_peer_at_once() {
    let mesh = heartbeat_mesh(vec![Peer::authority("gm"), Peer::new("alice")]).await;
    let gm = &mesh.peer("gm").session;
    let mut events = gm.presence().subscribe_peer_events();

    mesh.peer("alice").session.shutdown().await;
    settle().await;

    assert_eq!(ids(gm.presence().active_peers()), vec!["gm"]);
    assert_eq!(events.try_recv().unwrap(), PeerEvent::Left(PeerId::from("alice")));
}

#[tokio::test(start_paused = true)]
async fn test_authority_fails_over_to_the_next_candidate() {
    let mesh = heartbeat_mesh(vec![Peer::authority("gm-a"), Peer::authority("gm-b"), Peer::new("alice")]).await;
    let alice = &mesh.peer("alice").session;
    assert_eq!(alice.gateway().authority(), Some(PeerId::from("gm-a")));

    mesh.peer("gm-b").session.gateway().registry().register(
        "test.whoami",
        |ctx: RpcContext, _payload: Value| async move { Ok::<_, EngineError>(json!({"caller": ctx.caller})) },
    );

    // gm-a crashes without a goodbye
    mesh.peer("gm-a").pubsub.set_offline(true);
    tokio::time::sleep(Duration::from_secs(9)).await;

    assert_eq!(alice.gateway().authority(), Some(PeerId::from("gm-b")));
    assert_eq!(alice.call("test.whoami", json!({})).await, Ok(json!({"caller": "alice"})));
}

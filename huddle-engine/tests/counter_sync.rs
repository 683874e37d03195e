//! Shared counter: direct and delegated writes, broadcast convergence and resync

mod common;

use common::{fields, rid, settle, TestMesh, COUNTER_TOPIC, REQUEST_TOPIC};
use huddle_engine::{AccessPolicies, CounterMessage, CounterState, EngineError};
use huddle_model::{DocumentStore, Peer, PeerId, PubSub};
use serde_json::json;
use std::collections::BTreeSet;

/// gm and alice with `pool` at 5, writable in the store by gm only.
async fn pool_mesh(extra: &[&str]) -> TestMesh {
    let mut peers = vec![Peer::authority("gm"), Peer::new("alice")];
    peers.extend(extra.iter().map(|id| Peer::new(*id)));
    let mesh = TestMesh::with_roster(peers).await;
    mesh.store.seed("pool", fields(json!({"value": 5, "last_writer": "gm", "version": 1})));
    mesh.store.restrict("pool", ["gm"]);
    for peer in &mesh.peers {
        peer.session.open_counter("pool", AccessPolicies::default()).await.unwrap();
    }
    mesh
}

#[tokio::test(start_paused = true)]
async fn test_opening_loads_the_committed_value() {
    let mesh = pool_mesh(&[]).await;
    let alice = mesh.peer("alice").session.counter(&rid("pool")).unwrap();
    assert_eq!(alice.get(), 5);
    assert_eq!(alice.state().last_writer, Some(PeerId::from("gm")));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_changes_converge_to_seven() {
    let mesh = pool_mesh(&[]).await;
    let mut broadcasts = mesh.peer("alice").pubsub.subscribe(COUNTER_TOPIC).await.unwrap();

    // alice may not write the pool herself
    let alice_counter = mesh.peer("alice").session.counter(&rid("pool")).unwrap();
    assert!(!alice_counter.can_write());
    assert!(matches!(alice_counter.change(1).await, Err(EngineError::PermissionDenied(_))));

    let gm = &mesh.peer("gm").session;
    let alice = &mesh.peer("alice").session;
    let pool = rid("pool");
    let (from_gm, from_alice) = tokio::join!(
        gm.submit_counter_change(&pool, 1, None),
        alice.submit_counter_change(&pool, 1, None),
    );
    let from_gm = from_gm.unwrap();
    let from_alice = from_alice.unwrap();
    assert_eq!(
        [from_gm.value, from_alice.value].into_iter().collect::<BTreeSet<_>>(),
        BTreeSet::from([6, 7])
    );
    settle().await;

    for peer in ["gm", "alice"] {
        assert_eq!(mesh.peer(peer).session.counter(&rid("pool")).unwrap().get(), 7);
    }
    let committed = mesh.store.view("gm").read(&rid("pool")).await.unwrap().unwrap();
    assert_eq!(committed["value"], json!(7));
    assert_eq!(committed["version"], json!(3));
    assert_eq!(mesh.bus.published_count(REQUEST_TOPIC), 1);
    assert_eq!(mesh.bus.published_count(COUNTER_TOPIC), 2);

    let mut values = BTreeSet::new();
    for _ in 0..2 {
        let delivery = broadcasts.recv().await.unwrap();
        assert_eq!(delivery.from, PeerId::from("gm"));
        match serde_json::from_value(delivery.message).unwrap() {
            CounterMessage::Value { state, to: None, .. } => {
                values.insert(state.value);
            }
            other => panic!("unexpected counter message {:?}", other),
        }
    }
    assert_eq!(values, BTreeSet::from([6, 7]));
}

#[tokio::test(start_paused = true)]
async fn test_value_is_floored_at_zero() {
    let mesh = pool_mesh(&[]).await;
    let gm = mesh.peer("gm").session.counter(&rid("pool")).unwrap();

    assert_eq!(gm.change(-100).await.unwrap().value, 0);
    assert_eq!(gm.set(-3).await.unwrap().value, 0);
    assert_eq!(gm.set(12).await.unwrap().value, 12);
    settle().await;
    assert_eq!(mesh.peer("alice").session.counter(&rid("pool")).unwrap().get(), 12);
}

#[tokio::test(start_paused = true)]
async fn test_missed_broadcast_is_recovered_by_resync() {
    let mesh = pool_mesh(&["carol"]).await;
    let carol = mesh.peer("carol");
    let carol_counter = carol.session.counter(&rid("pool")).unwrap();
    assert_eq!(carol_counter.get(), 5);

    carol.pubsub.drop_next_incoming_message();
    mesh.peer("gm").session.counter(&rid("pool")).unwrap().change(7).await.unwrap();
    settle().await;
    assert_eq!(carol.pubsub.dropped_count(), 1);
    assert_eq!(carol_counter.get(), 5);
    assert_eq!(mesh.peer("alice").session.counter(&rid("pool")).unwrap().get(), 12);

    carol_counter.request_resync().await.unwrap();
    settle().await;
    assert_eq!(carol_counter.get(), 12);
    assert_eq!(carol_counter.state().version, 2);
}

#[tokio::test(start_paused = true)]
async fn test_resync_reply_is_addressed_to_the_requester() {
    let mesh = pool_mesh(&["carol"]).await;
    let alice = mesh.peer("alice").session.counter(&rid("pool")).unwrap();
    let alice_view = alice.subscribe();

    mesh.peer("carol").session.counter(&rid("pool")).unwrap().request_resync().await.unwrap();
    settle().await;

    // One resync, one addressed reply from gm; nobody else answers
    assert_eq!(mesh.bus.published_count(COUNTER_TOPIC), 2);
    assert!(!alice_view.has_changed().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_unpermitted_set_is_rejected_locally() {
    let mesh = pool_mesh(&[]).await;
    let alice = mesh.peer("alice").session.counter(&rid("pool")).unwrap();

    let err = alice.set(3).await.unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied(_)));
    assert_eq!(mesh.bus.published_count(REQUEST_TOPIC), 0);
    assert_eq!(mesh.bus.published_count(COUNTER_TOPIC), 0);
    assert_eq!(mesh.store.write_count(&rid("pool")), 0);
}

#[tokio::test(start_paused = true)]
async fn test_submit_on_unopened_counter_is_invalid() {
    let mesh = TestMesh::with_roster(vec![Peer::authority("gm"), Peer::new("alice")]).await;
    let err = mesh
        .peer("alice")
        .session
        .submit_counter_change(&rid("pool"), 1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidPayload(_)));
}

#[tokio::test(start_paused = true)]
async fn test_shut_down_session_refuses_work() {
    let mesh = pool_mesh(&[]).await;
    let alice = &mesh.peer("alice").session;
    let counter = alice.counter(&rid("pool")).unwrap();
    assert_eq!(counter.get(), 5);
    alice.shutdown().await;
    alice.shutdown().await;
    assert_eq!(counter.state(), CounterState::default());

    assert!(alice.is_shut_down());
    assert_eq!(
        alice.submit_counter_change(&rid("pool"), 1, None).await,
        Err(EngineError::Shutdown)
    );
    assert!(matches!(alice.open_counter("other", AccessPolicies::default()).await, Err(EngineError::Shutdown)));
}

#[tokio::test(start_paused = true)]
async fn test_deleted_record_starts_over_from_zero() {
    let mesh = pool_mesh(&[]).await;
    let gm = mesh.peer("gm").session.counter(&rid("pool")).unwrap();
    let alice = mesh.peer("alice").session.counter(&rid("pool")).unwrap();
    gm.set(50).await.unwrap();
    settle().await;
    assert_eq!(alice.get(), 50);

    mesh.store.view("gm").delete(&rid("pool")).await.unwrap();
    settle().await;
    assert_eq!(gm.state(), CounterState::default());
    assert_eq!(alice.state(), CounterState::default());

    let state = gm.change(1).await.unwrap();
    assert_eq!((state.value, state.version), (1, 1));
    settle().await;
    assert_eq!(alice.get(), 1);
    let committed = mesh.store.view("gm").read(&rid("pool")).await.unwrap().unwrap();
    assert_eq!(committed["value"], json!(1));
}

#[tokio::test(start_paused = true)]
async fn test_keyed_retry_through_the_authority_applies_once() {
    let mesh = pool_mesh(&[]).await;
    let alice = &mesh.peer("alice").session;

    let first = alice.submit_counter_change(&rid("pool"), 2, Some("alice-1".into())).await.unwrap();
    let retry = alice.submit_counter_change(&rid("pool"), 2, Some("alice-1".into())).await.unwrap();
    assert_eq!(first, retry);
    assert_eq!(first.value, 7);
    assert_eq!(mesh.store.write_count(&rid("pool")), 1);

    // A new key is a new change
    let next = alice.submit_counter_change(&rid("pool"), 2, Some("alice-2".into())).await.unwrap();
    assert_eq!(next.value, 9);
}

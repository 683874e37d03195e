//! Cohort rotation through the authority and on the elected writer

mod common;

use common::{rid, TestMesh, REQUEST_TOPIC};
use huddle_engine::{AccessPolicies, EngineError, RotationOutcome};
use huddle_model::{Peer, PeerId};
use serde_json::json;
use std::collections::BTreeSet;

const MEMBERS: [&str; 4] = ["a", "b", "c", "d"];

async fn party_mesh(players: &[&str]) -> TestMesh {
    let mut peers = vec![Peer::authority("gm")];
    peers.extend(players.iter().map(|id| Peer::new(*id)));
    let mesh = TestMesh::with_roster(peers).await;
    let gm = mesh.peer("gm").session.open_cohort("party", AccessPolicies::default()).unwrap();
    let outcome = gm.set_members(MEMBERS.iter().map(|m| rid(m)).collect()).await.unwrap();
    assert_eq!(outcome, RotationOutcome::Applied);
    mesh
}

async fn remaining(mesh: &TestMesh) -> Vec<u32> {
    let table = mesh.peer("gm").session.cohort(&rid("party")).unwrap().table().await.unwrap();
    MEMBERS.iter().map(|m| table.remaining(&rid(m)).unwrap()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_four_member_rotation_through_the_authority() {
    let mesh = party_mesh(&["alice"]).await;
    let alice = &mesh.peer("alice").session;

    for (entity, expected) in MEMBERS.iter().zip([[3, 0, 0, 0], [2, 3, 0, 0], [1, 2, 3, 0], [0, 1, 2, 3]]) {
        let outcome = alice.submit_record_action(&rid("party"), &rid(entity)).await.unwrap();
        assert_eq!(outcome, RotationOutcome::Recorded { remaining: 3 });
        assert_eq!(remaining(&mesh).await, expected);
    }
    assert_eq!(mesh.bus.published_count(REQUEST_TOPIC), 4);

    // a is eligible again, b is not
    let gm = mesh.peer("gm").session.cohort(&rid("party")).unwrap();
    assert!(gm.is_eligible(&rid("a")).await.unwrap());
    assert_eq!(
        alice.submit_record_action(&rid("party"), &rid("b")).await.unwrap(),
        RotationOutcome::Ineligible { remaining: 1, downed: false }
    );
    assert_eq!(remaining(&mesh).await, vec![0, 1, 2, 3]);

    assert_eq!(gm.reset(&rid("b")).await.unwrap(), RotationOutcome::Applied);
    assert_eq!(
        alice.submit_record_action(&rid("party"), &rid("b")).await.unwrap(),
        RotationOutcome::Recorded { remaining: 3 }
    );
    assert_eq!(remaining(&mesh).await, vec![0, 3, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_and_downed_entities() {
    let mesh = party_mesh(&["alice"]).await;
    let alice = &mesh.peer("alice").session;
    let gm = mesh.peer("gm").session.cohort(&rid("party")).unwrap();

    assert_eq!(
        alice.submit_record_action(&rid("party"), &rid("zed")).await.unwrap(),
        RotationOutcome::UnknownEntity
    );
    assert_eq!(gm.set_downed(&rid("zed"), true).await.unwrap(), RotationOutcome::UnknownEntity);

    assert_eq!(gm.set_downed(&rid("c"), true).await.unwrap(), RotationOutcome::Applied);
    assert_eq!(
        alice.submit_record_action(&rid("party"), &rid("c")).await.unwrap(),
        RotationOutcome::Ineligible { remaining: 0, downed: true }
    );
    assert_eq!(remaining(&mesh).await, vec![0, 0, 0, 0]);

    gm.set_downed(&rid("c"), false).await.unwrap();
    assert_eq!(
        alice.submit_record_action(&rid("party"), &rid("c")).await.unwrap(),
        RotationOutcome::Recorded { remaining: 3 }
    );
}

#[tokio::test(start_paused = true)]
async fn test_shrinking_the_cohort_reclamps_cooldowns() {
    let mesh = party_mesh(&[]).await;
    let gm = mesh.peer("gm").session.cohort(&rid("party")).unwrap();
    for entity in MEMBERS {
        gm.record_action(&rid(entity)).await.unwrap();
    }
    assert_eq!(remaining(&mesh).await, vec![0, 1, 2, 3]);

    gm.set_members(vec![rid("b"), rid("d")]).await.unwrap();
    let table = gm.table().await.unwrap();
    assert_eq!(table.cohort_size(), 2);
    assert_eq!(table.remaining(&rid("b")), Some(1));
    assert_eq!(table.remaining(&rid("d")), Some(1));
    assert_eq!(table.remaining(&rid("a")), None);
}

#[tokio::test(start_paused = true)]
async fn test_non_writer_is_told_who_writes() {
    let mesh = party_mesh(&["alice"]).await;
    let write_count = mesh.store.write_count(&rid("party"));

    let alice = mesh.peer("alice").session.open_cohort("party", AccessPolicies::default()).unwrap();
    assert!(!alice.is_writer());
    assert_eq!(
        alice.record_action(&rid("a")).await.unwrap(),
        RotationOutcome::NotElected { writer: Some(PeerId::from("gm")) }
    );
    assert_eq!(mesh.store.write_count(&rid("party")), write_count);

    // Submitting still works: it goes through the authority
    assert_eq!(
        mesh.peer("alice").session.submit_record_action(&rid("party"), &rid("a")).await.unwrap(),
        RotationOutcome::Recorded { remaining: 3 }
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_actions_are_serialized_on_the_authority() {
    let mesh = party_mesh(&["alice", "bob"]).await;
    let alice = &mesh.peer("alice").session;
    let bob = &mesh.peer("bob").session;

    let (party, a, b) = (rid("party"), rid("a"), rid("b"));
    let (first, second) = tokio::join!(
        alice.submit_record_action(&party, &a),
        bob.submit_record_action(&party, &b),
    );
    assert_eq!(first.unwrap(), RotationOutcome::Recorded { remaining: 3 });
    assert_eq!(second.unwrap(), RotationOutcome::Recorded { remaining: 3 });

    let after = remaining(&mesh).await;
    assert_eq!(after[..2].iter().copied().collect::<BTreeSet<_>>(), BTreeSet::from([2, 3]));
    assert_eq!(after[2..], [0, 0]);
}

#[tokio::test(start_paused = true)]
async fn test_reset_over_rpc_needs_direct_rights() {
    let mesh = party_mesh(&["alice"]).await;
    let err = mesh
        .peer("alice")
        .session
        .call("cooldown.reset", json!({"cohort": "party", "entity": "a"}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PermissionDenied(_)));

    let err = mesh
        .peer("alice")
        .session
        .call("cooldown.recordAction", json!({"cohort": "nowhere", "entity": "a"}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidPayload(_)));
}

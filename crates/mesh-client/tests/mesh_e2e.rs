//! End-to-end tests: mesh controllers talking through a real hub.
//!
//! Transports are the in-memory doubles from `mesh_client::testing`, so
//! what is exercised here is signaling: the hub relays every description
//! and candidate between the sessions.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use hub_service::config::Config;
use hub_test_utils::TestHubServer;
use mesh_client::testing::{MockMediaCapture, MockPeerConnectionFactory};
use mesh_client::{LinkState, MeshConfig, MeshError, MeshEvent, MeshSnapshot, RoomSession};
use signaling_protocol::{ErrorCode, MediaKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(20);

struct Participant {
    session: RoomSession,
    events: mpsc::UnboundedReceiver<MeshEvent>,
    factory: MockPeerConnectionFactory,
    capture: MockMediaCapture,
}

async fn join(server: &TestHubServer, username: &str) -> Participant {
    let factory = MockPeerConnectionFactory::auto_connect();
    let capture = MockMediaCapture::new();
    let mut session = RoomSession::join(
        &server.ws_url(),
        username,
        Arc::new(factory.clone()),
        Arc::new(capture.clone()),
        MeshConfig::default(),
    )
    .await
    .unwrap();
    let events = session.take_events().unwrap();

    Participant {
        session,
        events,
        factory,
        capture,
    }
}

/// Poll snapshots until `predicate` holds.
async fn wait_until<F>(session: &RoomSession, what: &str, mut predicate: F) -> MeshSnapshot
where
    F: FnMut(&MeshSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let snapshot = session.snapshot().await.unwrap();
        if predicate(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}: {snapshot:?}");
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Read events until one matches.
async fn wait_event<F>(events: &mut mpsc::UnboundedReceiver<MeshEvent>, mut predicate: F) -> MeshEvent
where
    F: FnMut(&MeshEvent) -> bool,
{
    let result = tokio::time::timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            if predicate(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;

    match result {
        Ok(Some(event)) => event,
        Ok(None) => panic!("event stream ended"),
        Err(_) => panic!("timed out waiting for event"),
    }
}

fn connected_to(snapshot: &MeshSnapshot, remote_id: &str) -> bool {
    snapshot
        .link(remote_id)
        .is_some_and(|link| link.state == LinkState::Connected)
}

#[tokio::test]
async fn test_two_participants_connect() {
    let server = TestHubServer::spawn().await.unwrap();
    let alice = join(&server, "alice").await;
    let bob = join(&server, "bob").await;

    let alice_id = alice.session.local_id().to_string();
    let bob_id = bob.session.local_id().to_string();
    assert_ne!(alice_id, bob_id);

    wait_until(&alice.session, "alice -> bob", |s| connected_to(s, &bob_id)).await;
    let snapshot = wait_until(&bob.session, "bob -> alice", |s| connected_to(s, &alice_id)).await;

    assert_eq!(snapshot.roster.len(), 2);
    assert_eq!(snapshot.links.len(), 1);

    // One negotiation per side.
    assert_eq!(alice.factory.connections_to(&bob_id).len(), 1);
    assert_eq!(bob.factory.connections_to(&alice_id).len(), 1);

    // Exactly one side produced the offer.
    let offers = alice.factory.latest(&bob_id).unwrap().offers_created()
        + bob.factory.latest(&alice_id).unwrap().offers_created();
    assert_eq!(offers, 1);

    // Candidates were relayed both ways.
    assert!(!alice
        .factory
        .latest(&bob_id)
        .unwrap()
        .added_candidates()
        .is_empty());
    assert!(!bob
        .factory
        .latest(&alice_id)
        .unwrap()
        .added_candidates()
        .is_empty());
}

#[tokio::test]
async fn test_three_participants_form_full_mesh() {
    let server = TestHubServer::spawn().await.unwrap();
    let participants = vec![
        join(&server, "alice").await,
        join(&server, "bob").await,
        join(&server, "carol").await,
    ];
    let ids: Vec<String> = participants
        .iter()
        .map(|p| p.session.local_id().to_string())
        .collect();

    for participant in &participants {
        let own = participant.session.local_id().to_string();
        let others: Vec<&String> = ids.iter().filter(|id| **id != own).collect();

        let snapshot = wait_until(&participant.session, "full mesh", |s| {
            others.iter().all(|id| connected_to(s, id))
        })
        .await;
        assert_eq!(snapshot.links.len(), 2);
        assert_eq!(snapshot.roster.len(), 3);
        assert_eq!(participant.factory.created_count(), 2);
    }
}

#[tokio::test]
async fn test_media_state_reaches_other_participants() {
    let server = TestHubServer::spawn().await.unwrap();
    let alice = join(&server, "alice").await;
    let bob = join(&server, "bob").await;
    let alice_id = alice.session.local_id().to_string();
    let bob_id = bob.session.local_id().to_string();

    wait_until(&alice.session, "link", |s| connected_to(s, &bob_id)).await;

    alice.session.enable(MediaKind::Audio).await.unwrap();
    assert!(alice.capture.is_held(MediaKind::Audio));
    assert!(alice
        .factory
        .latest(&bob_id)
        .unwrap()
        .tracks()
        .get(MediaKind::Audio)
        .is_some());

    wait_until(&bob.session, "alice audio on", |s| {
        s.remote_audio.get(&alice_id) == Some(&true)
    })
    .await;

    alice.session.disable(MediaKind::Audio).await.unwrap();
    assert!(!alice.capture.is_held(MediaKind::Audio));

    let snapshot = wait_until(&bob.session, "alice audio off", |s| {
        s.remote_audio.get(&alice_id) == Some(&false)
    })
    .await;
    assert_eq!(snapshot.remote_video.get(&alice_id), Some(&false));
}

#[tokio::test]
async fn test_late_joiner_receives_current_track() {
    let server = TestHubServer::spawn().await.unwrap();
    let alice = join(&server, "alice").await;
    alice.session.enable(MediaKind::Video).await.unwrap();

    let bob = join(&server, "bob").await;
    let bob_id = bob.session.local_id().to_string();
    wait_until(&alice.session, "link", |s| connected_to(s, &bob_id)).await;

    let connection = alice.factory.latest(&bob_id).unwrap();
    assert!(connection.initial_tracks().get(MediaKind::Video).is_some());

    let alice_id = alice.session.local_id().to_string();
    wait_until(&bob.session, "alice video in join states", |s| {
        s.remote_video.get(&alice_id) == Some(&true)
    })
    .await;
}

#[tokio::test]
async fn test_chat_delivered_to_everyone() {
    let server = TestHubServer::spawn().await.unwrap();
    let mut alice = join(&server, "alice").await;
    let mut bob = join(&server, "bob").await;

    alice.session.send_chat("hello mesh").await.unwrap();

    for events in [&mut alice.events, &mut bob.events] {
        match wait_event(events, |e| matches!(e, MeshEvent::Chat { .. })).await {
            MeshEvent::Chat { username, text, .. } => {
                assert_eq!(username, "alice");
                assert_eq!(text, "hello mesh");
            }
            other => panic!("expected chat, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_leave_closes_links_on_remaining_participants() {
    let server = TestHubServer::spawn().await.unwrap();
    let alice = join(&server, "alice").await;
    let mut bob = join(&server, "bob").await;
    let alice_id = alice.session.local_id().to_string();
    let bob_id = bob.session.local_id().to_string();

    wait_until(&bob.session, "link", |s| connected_to(s, &alice_id)).await;
    alice.session.enable(MediaKind::Audio).await.unwrap();

    let alice_connection = alice.factory.latest(&bob_id).unwrap();
    let alice_capture = alice.capture.clone();
    let mut alice_events = alice.events;
    alice.session.leave().await.unwrap();

    assert!(alice_connection.is_closed());
    assert!(!alice_capture.is_held(MediaKind::Audio));
    wait_event(&mut alice_events, |e| matches!(e, MeshEvent::Left)).await;

    let closed = wait_event(&mut bob.events, |e| {
        matches!(e, MeshEvent::LinkClosed { remote_id } if *remote_id == alice_id)
    })
    .await;
    assert_eq!(
        closed,
        MeshEvent::LinkClosed {
            remote_id: alice_id.clone()
        }
    );

    let snapshot = wait_until(&bob.session, "alice gone", |s| {
        s.links.is_empty() && s.roster.len() == 1
    })
    .await;
    assert!(!snapshot.remote_audio.contains_key(&alice_id));
    assert!(bob.factory.latest(&alice_id).unwrap().is_closed());
}

#[tokio::test]
async fn test_join_rejected_when_room_full() {
    let server = TestHubServer::spawn_with_config(Config {
        max_participants: 1,
        ..Config::default()
    })
    .await
    .unwrap();
    let _alice = join(&server, "alice").await;

    let result = RoomSession::join(
        &server.ws_url(),
        "bob",
        Arc::new(MockPeerConnectionFactory::auto_connect()),
        Arc::new(MockMediaCapture::new()),
        MeshConfig::default(),
    )
    .await;

    match result {
        Err(MeshError::Rejected { code, .. }) => assert_eq!(code, ErrorCode::CapacityExceeded),
        Err(other) => panic!("expected rejection, got {other:?}"),
        Ok(_) => panic!("expected rejection, got a session"),
    }
}

#[tokio::test]
async fn test_hub_shutdown_reported() {
    let server = TestHubServer::spawn().await.unwrap();
    let mut alice = join(&server, "alice").await;

    server.shutdown();

    wait_event(&mut alice.events, |e| matches!(e, MeshEvent::HubDisconnected)).await;
    assert!(matches!(
        alice.session.snapshot().await,
        Err(MeshError::Stopped)
    ));
}

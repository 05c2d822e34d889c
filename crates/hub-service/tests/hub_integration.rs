//! End-to-end tests for the signaling hub over real WebSockets.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use hub_service::config::Config;
use hub_test_utils::{TestHubServer, TestWsClient};
use serde_json::json;
use signaling_protocol::{ClientMessage, ErrorCode, ServerMessage, SessionDescription};
use std::time::Duration;

const QUIET: Duration = Duration::from_millis(200);

fn user_ids(message: &ServerMessage) -> Vec<String> {
    match message {
        ServerMessage::UserList { users } => users.iter().map(|u| u.user_id.clone()).collect(),
        other => panic!("expected user_list, got {other:?}"),
    }
}

fn error_code(message: &ServerMessage) -> ErrorCode {
    match message {
        ServerMessage::Error { code, .. } => *code,
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_sequence_over_socket() {
    let server = TestHubServer::spawn().await.unwrap();
    let mut alice = TestWsClient::connect(&server.ws_url()).await.unwrap();
    let mut bob = TestWsClient::connect(&server.ws_url()).await.unwrap();

    let alice_id = alice.join("alice").await;

    bob.send(&ClientMessage::SetUsername {
        username: "  bob ".to_string(),
    })
    .await;

    let bob_id = match bob.recv().await {
        ServerMessage::UsernameAccepted { username, user_id } => {
            assert_eq!(username, "bob");
            user_id
        }
        other => panic!("expected username_accepted, got {other:?}"),
    };
    assert_eq!(user_ids(&bob.recv().await), vec![alice_id.clone(), bob_id.clone()]);
    assert!(matches!(bob.recv().await, ServerMessage::AudioStates { .. }));
    assert!(matches!(bob.recv().await, ServerMessage::VideoStates { .. }));

    match alice.recv().await {
        ServerMessage::System { message, .. } => assert_eq!(message, "bob joined the room"),
        other => panic!("expected system, got {other:?}"),
    }
    assert_eq!(user_ids(&alice.recv().await), vec![alice_id, bob_id]);
}

#[tokio::test]
async fn test_malformed_frames_keep_channel_open() {
    let server = TestHubServer::spawn().await.unwrap();
    let mut client = TestWsClient::connect(&server.ws_url()).await.unwrap();

    client.send_raw("not json").await;
    assert_eq!(error_code(&client.recv().await), ErrorCode::MalformedMessage);

    client.send_json(&json!({ "type": "teleport" })).await;
    assert_eq!(error_code(&client.recv().await), ErrorCode::MalformedMessage);

    client
        .send_json(&json!({ "type": "set_username", "username": "" }))
        .await;
    assert_eq!(error_code(&client.recv().await), ErrorCode::MalformedMessage);

    // Still usable afterwards.
    let id = client.join("carol").await;
    assert!(!id.is_empty());
}

#[tokio::test]
async fn test_room_messages_before_join_are_rejected() {
    let server = TestHubServer::spawn().await.unwrap();
    let mut client = TestWsClient::connect(&server.ws_url()).await.unwrap();

    client.send(&ClientMessage::AudioEnabled).await;
    assert_eq!(error_code(&client.recv().await), ErrorCode::NotJoined);

    let state = server.room().get_state().await.unwrap();
    assert_eq!(state.peer_count(), 0);
}

#[tokio::test]
async fn test_capacity_rejection_over_socket() {
    let config = Config {
        max_participants: 1,
        ..Config::default()
    };
    let server = TestHubServer::spawn_with_config(config).await.unwrap();

    let mut alice = TestWsClient::connect(&server.ws_url()).await.unwrap();
    alice.join("alice").await;

    let mut bob = TestWsClient::connect(&server.ws_url()).await.unwrap();
    bob.send(&ClientMessage::SetUsername {
        username: "bob".to_string(),
    })
    .await;

    match bob.recv().await {
        ServerMessage::Error { code, message } => {
            assert_eq!(code, ErrorCode::CapacityExceeded);
            assert!(message.starts_with("Server full"));
        }
        other => panic!("expected error, got {other:?}"),
    }
    bob.expect_closed().await;

    alice.expect_silence(QUIET).await;
    assert_eq!(server.room().get_state().await.unwrap().peer_count(), 1);
}

#[tokio::test]
async fn test_offer_relayed_with_sender_identity() {
    let server = TestHubServer::spawn().await.unwrap();
    let mut alice = TestWsClient::connect(&server.ws_url()).await.unwrap();
    let mut bob = TestWsClient::connect(&server.ws_url()).await.unwrap();

    let alice_id = alice.join("alice").await;
    let bob_id = bob.join("bob").await;
    alice
        .recv_until(|m| matches!(m, ServerMessage::VideoStates { .. }))
        .await;

    alice
        .send(&ClientMessage::Offer {
            target_user_id: bob_id.clone(),
            payload: SessionDescription::offer("v=0 alice"),
        })
        .await;

    match bob.recv().await {
        ServerMessage::Offer {
            sender_user_id,
            sender_username,
            payload,
        } => {
            assert_eq!(sender_user_id, alice_id);
            assert_eq!(sender_username, "alice");
            assert_eq!(payload.sdp, "v=0 alice");
        }
        other => panic!("expected offer, got {other:?}"),
    }

    // Relay to a departed id is dropped without an error.
    alice
        .send(&ClientMessage::Answer {
            target_user_id: "nobody".to_string(),
            payload: SessionDescription::answer("v=0"),
        })
        .await;
    alice.expect_silence(QUIET).await;
}

#[tokio::test]
async fn test_abrupt_disconnect_announced() {
    let server = TestHubServer::spawn().await.unwrap();
    let mut alice = TestWsClient::connect(&server.ws_url()).await.unwrap();
    let mut bob = TestWsClient::connect(&server.ws_url()).await.unwrap();

    let alice_id = alice.join("alice").await;
    bob.join("bob").await;
    alice
        .recv_until(|m| matches!(m, ServerMessage::VideoStates { .. }))
        .await;

    bob.close().await;

    match alice.recv().await {
        ServerMessage::System { message, .. } => assert_eq!(message, "bob left the room"),
        other => panic!("expected system, got {other:?}"),
    }
    assert_eq!(user_ids(&alice.recv().await), vec![alice_id]);
}

#[tokio::test]
async fn test_leave_closes_socket_and_updates_media_lists() {
    let server = TestHubServer::spawn().await.unwrap();
    let mut alice = TestWsClient::connect(&server.ws_url()).await.unwrap();
    let mut bob = TestWsClient::connect(&server.ws_url()).await.unwrap();

    alice.join("alice").await;
    let bob_id = bob.join("bob").await;
    alice
        .recv_until(|m| matches!(m, ServerMessage::VideoStates { .. }))
        .await;

    bob.send(&ClientMessage::AudioEnabled).await;
    match alice.recv().await {
        ServerMessage::AudioStates { states } => {
            let bob_state = states.iter().find(|s| s.user_id == bob_id).unwrap();
            assert!(bob_state.is_audio_enabled);
        }
        other => panic!("expected audio_states, got {other:?}"),
    }

    bob.send(&ClientMessage::Leave).await;
    bob.expect_closed().await;

    let audio = alice
        .recv_until(|m| matches!(m, ServerMessage::AudioStates { .. }))
        .await;
    match audio {
        ServerMessage::AudioStates { states } => assert_eq!(states.len(), 1),
        other => panic!("expected audio_states, got {other:?}"),
    }
}

#[tokio::test]
async fn test_shutdown_closes_participants() {
    let server = TestHubServer::spawn().await.unwrap();
    let mut alice = TestWsClient::connect(&server.ws_url()).await.unwrap();
    alice.join("alice").await;

    server.shutdown();
    alice.expect_closed().await;
}

//! `RoomActor` - the single owner of room membership.
//!
//! The `RoomActor`:
//! - Owns the peer [`Registry`] (ids, display names, media flags, channels)
//! - Processes one inbound envelope at a time, so a mutation and every
//!   broadcast it causes are queued on all channels before the next
//!   envelope from any channel is looked at
//! - Never awaits a connection: fan-out uses non-blocking enqueues
//!
//! # Join ordering
//!
//! `username_accepted` to the joiner, then `system` to everyone else, then
//! `user_list`, `audio_states` and `video_states` to everyone. Since each
//! connection's queue is FIFO, no peer can see an id before the `user_list`
//! that contains it.
//!
//! # Slow consumers
//!
//! A peer whose outbound queue is full (or whose connection has already
//! stopped) is queued for eviction. Evictions run after the current
//! envelope's fan-out completes, each as an ordinary departure.

use crate::config::Config;
use crate::errors::HubError;
use crate::observability::metrics as prom;
use crate::registry::{IdGenerator, Peer, RandomIdGenerator, Registry};

use super::connection::{ConnectionActorHandle, DeliveryError};
use super::messages::{LeaveReason, PeerInfo, RoomMessage, RoomState};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use chrono::Utc;
use signaling_protocol::{ClientMessage, MediaKind, ServerMessage};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Handle to the `RoomActor`.
#[derive(Clone, Debug)]
pub struct RoomHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
}

impl RoomHandle {
    /// Forward a decoded envelope from a connection.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Draining` if the room has stopped.
    pub async fn inbound(
        &self,
        connection: ConnectionActorHandle,
        message: ClientMessage,
    ) -> Result<(), HubError> {
        self.sender
            .send(RoomMessage::Inbound {
                connection,
                message,
            })
            .await
            .map_err(|_| HubError::Draining)
    }

    /// Notify the room that a connection's transport closed.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Draining` if the room has stopped.
    pub async fn disconnected(&self, connection_id: String) -> Result<(), HubError> {
        self.sender
            .send(RoomMessage::Disconnected { connection_id })
            .await
            .map_err(|_| HubError::Draining)
    }

    /// Get a snapshot of the room.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Internal` if the room has stopped.
    pub async fn get_state(&self) -> Result<RoomState, HubError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::GetState { respond_to: tx })
            .await
            .map_err(|e| HubError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the room actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Token for a connection actor; cancelled when the room shuts down.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// Identity of the peer that sent an envelope.
struct Origin {
    id: String,
    name: String,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    registry: Registry,
    id_generator: Box<dyn IdGenerator>,
    max_participants: usize,
    /// Connections whose outbound queue rejected an envelope.
    pending_evictions: Vec<ConnectionActorHandle>,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn the room actor with random peer ids.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        config: &Config,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomHandle, JoinHandle<()>) {
        Self::spawn_with_generator(config, cancel_token, metrics, Box::new(RandomIdGenerator))
    }

    /// Spawn the room actor with a custom id source.
    pub fn spawn_with_generator(
        config: &Config,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
        id_generator: Box<dyn IdGenerator>,
    ) -> (RoomHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.room_mailbox);

        let actor = Self {
            receiver,
            cancel_token: cancel_token.clone(),
            registry: Registry::new(),
            id_generator,
            max_participants: config.max_participants,
            pending_evictions: Vec::new(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Room, "room"),
        };

        let task_handle = tokio::spawn(actor.run());

        (
            RoomHandle {
                sender,
                cancel_token,
            },
            task_handle,
        )
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "hub.actor.room")]
    async fn run(mut self) {
        info!(
            target: "hub.actor.room",
            max_participants = self.max_participants,
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "hub.actor.room",
                        "RoomActor received cancellation signal"
                    );
                    self.graceful_shutdown();
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_depth(self.receiver.len());
                            self.handle_message(message);
                            self.drain_evictions();
                            self.mailbox.record_processed();
                        }
                        None => {
                            info!(
                                target: "hub.actor.room",
                                "RoomActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "hub.actor.room",
            peers = self.registry.len(),
            messages_processed = self.mailbox.messages_processed(),
            evictions = self.metrics.eviction_count(),
            "RoomActor stopped"
        );
    }

    fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Inbound {
                connection,
                message,
            } => {
                let message_type = message.type_name();
                let started = Instant::now();
                prom::record_message(message_type);

                if let Err(e) = self.handle_inbound(&connection, message) {
                    self.reply_error(&connection, &e);
                }

                prom::record_message_latency(message_type, started.elapsed());
            }

            RoomMessage::Disconnected { connection_id } => {
                self.handle_leave(&connection_id, LeaveReason::Disconnected);
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }
        }
    }

    fn handle_inbound(
        &mut self,
        connection: &ConnectionActorHandle,
        message: ClientMessage,
    ) -> Result<(), HubError> {
        match message {
            ClientMessage::SetUsername { username } => self.handle_join(connection, username),
            message => {
                let origin = self.origin_of(connection)?;
                self.handle_peer_message(connection, origin, message)
            }
        }
    }

    /// Handle an envelope from a joined peer.
    fn handle_peer_message(
        &mut self,
        connection: &ConnectionActorHandle,
        origin: Origin,
        message: ClientMessage,
    ) -> Result<(), HubError> {
        match message {
            ClientMessage::SetUsername { .. } => return Err(HubError::AlreadyJoined),

            ClientMessage::Chat { text } => {
                let chat = ServerMessage::Chat {
                    user_id: origin.id,
                    username: origin.name,
                    text,
                    timestamp: Utc::now(),
                };
                self.broadcast(None, &chat);
            }

            ClientMessage::AudioEnabled => self.handle_media_state(&origin.id, MediaKind::Audio, true),
            ClientMessage::AudioDisabled => {
                self.handle_media_state(&origin.id, MediaKind::Audio, false);
            }
            ClientMessage::VideoEnabled => self.handle_media_state(&origin.id, MediaKind::Video, true),
            ClientMessage::VideoDisabled => {
                self.handle_media_state(&origin.id, MediaKind::Video, false);
            }

            ClientMessage::Offer {
                target_user_id,
                payload,
            } => self.relay(
                &target_user_id,
                ServerMessage::Offer {
                    sender_user_id: origin.id,
                    sender_username: origin.name,
                    payload,
                },
            ),

            ClientMessage::Answer {
                target_user_id,
                payload,
            } => self.relay(
                &target_user_id,
                ServerMessage::Answer {
                    sender_user_id: origin.id,
                    sender_username: origin.name,
                    payload,
                },
            ),

            ClientMessage::IceCandidate {
                target_user_id,
                payload,
            } => self.relay(
                &target_user_id,
                ServerMessage::IceCandidate {
                    sender_user_id: origin.id,
                    sender_username: origin.name,
                    payload,
                },
            ),

            ClientMessage::Leave => {
                self.handle_leave(connection.connection_id(), LeaveReason::Voluntary);
                connection.close("left");
            }
        }

        Ok(())
    }

    fn origin_of(&self, connection: &ConnectionActorHandle) -> Result<Origin, HubError> {
        self.registry
            .peer_for_connection(connection.connection_id())
            .map(|peer| Origin {
                id: peer.id.clone(),
                name: peer.display_name.clone(),
            })
            .ok_or(HubError::NotJoined)
    }

    /// Admit a connection as a new peer.
    #[instrument(skip_all, fields(connection_id = %connection.connection_id()))]
    fn handle_join(
        &mut self,
        connection: &ConnectionActorHandle,
        username: String,
    ) -> Result<(), HubError> {
        if self
            .registry
            .peer_for_connection(connection.connection_id())
            .is_some()
        {
            return Err(HubError::AlreadyJoined);
        }

        if self.registry.len() >= self.max_participants {
            prom::record_join_rejected("capacity");
            warn!(
                target: "hub.actor.room",
                connection_id = %connection.connection_id(),
                max_participants = self.max_participants,
                "Join rejected, room at capacity"
            );
            return Err(HubError::CapacityExceeded {
                max: self.max_participants,
            });
        }

        let peer_id = self
            .registry
            .allocate_id(self.id_generator.as_mut())
            .map_err(|e| {
                prom::record_join_rejected("id_allocation");
                warn!(
                    target: "hub.actor.room",
                    connection_id = %connection.connection_id(),
                    error = %e,
                    "Join rejected, no free peer id"
                );
                e
            })?;

        self.registry.insert(Peer::new(
            peer_id.clone(),
            username.clone(),
            connection.clone(),
        ))?;

        self.deliver(
            connection,
            ServerMessage::UsernameAccepted {
                username: username.clone(),
                user_id: peer_id.clone(),
            },
        );
        self.broadcast(
            Some(&peer_id),
            &ServerMessage::system(format!("{username} joined the room")),
        );
        self.broadcast_roster();
        self.metrics.set_peers(self.registry.len());

        info!(
            target: "hub.actor.room",
            peer_id = %peer_id,
            connection_id = %connection.connection_id(),
            peers = self.registry.len(),
            "Peer joined"
        );

        Ok(())
    }

    /// Remove the peer bound to `connection_id`, if any, and tell the rest.
    fn handle_leave(&mut self, connection_id: &str, reason: LeaveReason) {
        let Some(peer) = self.registry.remove_by_connection(connection_id) else {
            debug!(
                target: "hub.actor.room",
                connection_id = %connection_id,
                reason = reason.as_str(),
                "Connection left without joining"
            );
            return;
        };

        self.broadcast(
            None,
            &ServerMessage::system(format!("{} left the room", peer.display_name)),
        );
        self.broadcast_roster();
        self.metrics.set_peers(self.registry.len());

        info!(
            target: "hub.actor.room",
            peer_id = %peer.id,
            connection_id = %connection_id,
            reason = reason.as_str(),
            peers = self.registry.len(),
            "Peer left"
        );
    }

    fn handle_media_state(&mut self, peer_id: &str, kind: MediaKind, enabled: bool) {
        if !self.registry.set_media(peer_id, kind, enabled) {
            return;
        }

        debug!(
            target: "hub.actor.room",
            peer_id = %peer_id,
            kind = kind.as_str(),
            enabled = enabled,
            "Media state changed"
        );

        let states = match kind {
            MediaKind::Audio => ServerMessage::AudioStates {
                states: self.registry.audio_states(),
            },
            MediaKind::Video => ServerMessage::VideoStates {
                states: self.registry.video_states(),
            },
        };
        self.broadcast(None, &states);
    }

    /// Forward a signaling envelope to one peer. Absent targets are dropped.
    fn relay(&mut self, target_id: &str, message: ServerMessage) {
        let Some(target) = self.registry.get(target_id) else {
            prom::record_relay_dropped();
            debug!(
                target: "hub.actor.room",
                target_id = %target_id,
                message_type = message.type_name(),
                "Relay target not registered, dropping"
            );
            return;
        };

        let connection = target.connection.clone();
        self.deliver(&connection, message);
    }

    fn broadcast_roster(&mut self) {
        let users = ServerMessage::UserList {
            users: self.registry.users(),
        };
        let audio = ServerMessage::AudioStates {
            states: self.registry.audio_states(),
        };
        let video = ServerMessage::VideoStates {
            states: self.registry.video_states(),
        };

        self.broadcast(None, &users);
        self.broadcast(None, &audio);
        self.broadcast(None, &video);
    }

    /// Enqueue `message` on every peer except `except`.
    fn broadcast(&mut self, except: Option<&str>, message: &ServerMessage) {
        let mut failed = Vec::new();

        for peer in self.registry.iter() {
            if except == Some(peer.id.as_str()) {
                continue;
            }
            if let Err(e) = peer.connection.try_send(message.clone()) {
                failed.push((peer.connection.clone(), e));
            }
        }

        for (connection, e) in failed {
            self.queue_eviction(connection, e);
        }
    }

    fn deliver(&mut self, connection: &ConnectionActorHandle, message: ServerMessage) {
        if let Err(e) = connection.try_send(message) {
            self.queue_eviction(connection.clone(), e);
        }
    }

    fn reply_error(&mut self, connection: &ConnectionActorHandle, error: &HubError) {
        debug!(
            target: "hub.actor.room",
            connection_id = %connection.connection_id(),
            error = %error,
            "Replying with error"
        );

        self.deliver(
            connection,
            ServerMessage::error(error.error_code(), error.client_message()),
        );

        if error.closes_channel() {
            connection.close(error.client_message());
        }
    }

    fn queue_eviction(&mut self, connection: ConnectionActorHandle, error: DeliveryError) {
        if self
            .pending_evictions
            .iter()
            .any(|c| c.connection_id() == connection.connection_id())
        {
            return;
        }

        warn!(
            target: "hub.actor.room",
            connection_id = %connection.connection_id(),
            error = %error,
            "Outbound queue rejected envelope, evicting"
        );
        self.pending_evictions.push(connection);
    }

    /// Evict every connection queued during fan-out. An eviction broadcasts
    /// a departure, which can itself queue further evictions.
    fn drain_evictions(&mut self) {
        while !self.pending_evictions.is_empty() {
            for connection in std::mem::take(&mut self.pending_evictions) {
                connection.cancel();
                if self
                    .registry
                    .peer_for_connection(connection.connection_id())
                    .is_some()
                {
                    self.metrics.record_eviction();
                    self.handle_leave(connection.connection_id(), LeaveReason::Evicted);
                }
            }
        }
    }

    fn get_state(&self) -> RoomState {
        RoomState {
            peers: self
                .registry
                .iter()
                .map(|p| PeerInfo {
                    peer_id: p.id.clone(),
                    display_name: p.display_name.clone(),
                    connection_id: p.connection_id().to_string(),
                    audio_enabled: p.audio_enabled,
                    video_enabled: p.video_enabled,
                    joined_at: p.joined_at,
                })
                .collect(),
            max_participants: self.max_participants,
        }
    }

    fn graceful_shutdown(&mut self) {
        info!(
            target: "hub.actor.room",
            peers = self.registry.len(),
            "Performing graceful shutdown"
        );

        for peer in self.registry.iter() {
            peer.connection.close("server shutting down");
        }

        self.metrics.set_peers(0);
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::actors::messages::ConnectionMessage;
    use signaling_protocol::{ErrorCode, IceCandidate, SessionDescription};
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Test-side view of one connection: the handle the room sees and the
    /// mailbox it writes into.
    struct TestConn {
        handle: ConnectionActorHandle,
        outbox: mpsc::Receiver<ConnectionMessage>,
    }

    impl TestConn {
        fn new(id: &str, buffer: usize) -> Self {
            let (sender, outbox) = mpsc::channel(buffer);
            Self {
                handle: ConnectionActorHandle::new(id.to_string(), sender, CancellationToken::new()),
                outbox,
            }
        }

        async fn next(&mut self) -> ServerMessage {
            match tokio::time::timeout(Duration::from_secs(1), self.outbox.recv()).await {
                Ok(Some(ConnectionMessage::Send { message })) => message,
                other => panic!("expected an envelope, got {other:?}"),
            }
        }

        async fn next_close(&mut self) -> String {
            match tokio::time::timeout(Duration::from_secs(1), self.outbox.recv()).await {
                Ok(Some(ConnectionMessage::Close { reason })) => reason,
                other => panic!("expected close, got {other:?}"),
            }
        }

        fn assert_idle(&mut self) {
            assert!(
                self.outbox.try_recv().is_err(),
                "connection {} has unexpected envelopes",
                self.handle.connection_id()
            );
        }

        /// Drain everything queued so far.
        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.outbox.try_recv() {
                if let ConnectionMessage::Send { message } = msg {
                    out.push(message);
                }
            }
            out
        }
    }

    struct ScriptedIds(VecDeque<String>);

    impl IdGenerator for ScriptedIds {
        fn generate(&mut self) -> String {
            self.0.pop_front().unwrap_or_default()
        }
    }

    fn spawn_room(max_participants: usize, ids: &[&str]) -> RoomHandle {
        let config = Config {
            max_participants,
            ..Config::default()
        };
        let generator = ScriptedIds(ids.iter().map(|s| (*s).to_string()).collect());
        let (handle, _task) = RoomActor::spawn_with_generator(
            &config,
            CancellationToken::new(),
            ActorMetrics::new(),
            Box::new(generator),
        );
        handle
    }

    async fn join(room: &RoomHandle, conn: &TestConn, name: &str) {
        room.inbound(
            conn.handle.clone(),
            ClientMessage::SetUsername {
                username: name.to_string(),
            },
        )
        .await
        .unwrap();
    }

    fn user_ids(message: &ServerMessage) -> Vec<String> {
        match message {
            ServerMessage::UserList { users } => users.iter().map(|u| u.user_id.clone()).collect(),
            other => panic!("expected user_list, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_join_sequence() {
        let room = spawn_room(10, &["aaa"]);
        let mut alice = TestConn::new("c-alice", 16);

        join(&room, &alice, "alice").await;

        assert_eq!(
            alice.next().await,
            ServerMessage::UsernameAccepted {
                username: "alice".to_string(),
                user_id: "aaa".to_string()
            }
        );
        assert_eq!(user_ids(&alice.next().await), vec!["aaa"]);
        assert!(matches!(alice.next().await, ServerMessage::AudioStates { .. }));
        assert!(matches!(alice.next().await, ServerMessage::VideoStates { .. }));
        alice.assert_idle();
    }

    #[tokio::test]
    async fn test_second_join_notifies_existing_peers_only() {
        let room = spawn_room(10, &["aaa", "bbb"]);
        let mut alice = TestConn::new("c-alice", 16);
        let mut bob = TestConn::new("c-bob", 16);

        join(&room, &alice, "alice").await;
        room.get_state().await.unwrap();
        alice.drain();

        join(&room, &bob, "bob").await;
        room.get_state().await.unwrap();

        match alice.next().await {
            ServerMessage::System { message, .. } => assert_eq!(message, "bob joined the room"),
            other => panic!("expected system, got {other:?}"),
        }
        assert_eq!(user_ids(&alice.next().await), vec!["aaa", "bbb"]);

        let bob_messages = bob.drain();
        assert!(matches!(
            bob_messages[0],
            ServerMessage::UsernameAccepted { ref user_id, .. } if user_id == "bbb"
        ));
        assert_eq!(user_ids(&bob_messages[1]), vec!["aaa", "bbb"]);
        assert!(
            !bob_messages
                .iter()
                .any(|m| matches!(m, ServerMessage::System { .. })),
            "joiner must not get its own join notice"
        );
    }

    #[tokio::test]
    async fn test_messages_before_join_are_rejected() {
        let room = spawn_room(10, &["aaa"]);
        let mut anon = TestConn::new("c-anon", 16);

        room.inbound(
            anon.handle.clone(),
            ClientMessage::Chat {
                text: "hello".to_string(),
            },
        )
        .await
        .unwrap();

        match anon.next().await {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::NotJoined),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(room.get_state().await.unwrap().peer_count(), 0);
    }

    #[tokio::test]
    async fn test_second_set_username_is_rejected() {
        let room = spawn_room(10, &["aaa", "bbb"]);
        let mut alice = TestConn::new("c-alice", 16);

        join(&room, &alice, "alice").await;
        join(&room, &alice, "alice2").await;
        let state = room.get_state().await.unwrap();

        let errors: Vec<_> = alice
            .drain()
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::Error { code, .. } => Some(code),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![ErrorCode::AlreadyJoined]);
        assert_eq!(state.peer_count(), 1);
        assert_eq!(state.peers[0].display_name, "alice");
    }

    #[tokio::test]
    async fn test_capacity_rejection_closes_channel() {
        let room = spawn_room(1, &["aaa", "bbb"]);
        let mut alice = TestConn::new("c-alice", 16);
        let mut bob = TestConn::new("c-bob", 16);

        join(&room, &alice, "alice").await;
        join(&room, &bob, "bob").await;

        match bob.next().await {
            ServerMessage::Error { code, message } => {
                assert_eq!(code, ErrorCode::CapacityExceeded);
                assert!(message.starts_with("Server full"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(bob.next_close().await.starts_with("Server full"));

        let state = room.get_state().await.unwrap();
        assert_eq!(state.peer_count(), 1);

        // Existing peer saw nothing beyond its own join.
        let alice_messages = alice.drain();
        assert_eq!(alice_messages.len(), 4);
    }

    #[tokio::test]
    async fn test_default_capacity_refuses_next_join() {
        let max = crate::config::DEFAULT_MAX_PARTICIPANTS;
        let ids: Vec<String> = (0..=max).map(|i| format!("p{i:03}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let room = spawn_room(Config::default().max_participants, &id_refs);

        // Every join is broadcast to everyone already present.
        let mut members = Vec::new();
        for i in 0..max {
            let conn = TestConn::new(&format!("c-{i}"), 4 * max + 8);
            join(&room, &conn, &format!("user{i}")).await;
            members.push(conn);
        }
        assert_eq!(room.get_state().await.unwrap().peer_count(), max);

        let mut late = TestConn::new("c-late", 16);
        join(&room, &late, "late").await;

        match late.next().await {
            ServerMessage::Error { code, message } => {
                assert_eq!(code, ErrorCode::CapacityExceeded);
                assert_eq!(
                    message,
                    "Server full (200 participants), please try again later"
                );
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(late.next_close().await.starts_with("Server full"));

        let state = room.get_state().await.unwrap();
        assert_eq!(state.peer_count(), max);
        assert_eq!(state.max_participants, 200);
        assert!(members.iter().all(|m| !m.handle.is_cancelled()));
    }

    #[tokio::test]
    async fn test_id_exhaustion_keeps_channel_open() {
        let room = spawn_room(10, &["aaa"]);
        let mut alice = TestConn::new("c-alice", 16);
        let mut bob = TestConn::new("c-bob", 16);

        join(&room, &alice, "alice").await;
        join(&room, &bob, "bob").await;
        room.get_state().await.unwrap();

        match bob.next().await {
            ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::IdAllocationFailed),
            other => panic!("expected error, got {other:?}"),
        }
        bob.assert_idle();
        assert!(!bob.handle.is_cancelled());
        assert_eq!(alice.drain().len(), 4);
    }

    #[tokio::test]
    async fn test_relay_overwrites_sender_and_reaches_only_target() {
        let room = spawn_room(10, &["aaa", "bbb", "ccc"]);
        let alice = TestConn::new("c-alice", 32);
        let mut bob = TestConn::new("c-bob", 32);
        let mut carol = TestConn::new("c-carol", 32);

        join(&room, &alice, "alice").await;
        join(&room, &bob, "bob").await;
        join(&room, &carol, "carol").await;
        room.get_state().await.unwrap();
        bob.drain();
        carol.drain();

        room.inbound(
            alice.handle.clone(),
            ClientMessage::Offer {
                target_user_id: "bbb".to_string(),
                payload: SessionDescription::offer("v=0"),
            },
        )
        .await
        .unwrap();
        room.get_state().await.unwrap();

        assert_eq!(
            bob.next().await,
            ServerMessage::Offer {
                sender_user_id: "aaa".to_string(),
                sender_username: "alice".to_string(),
                payload: SessionDescription::offer("v=0"),
            }
        );
        carol.assert_idle();
    }

    #[tokio::test]
    async fn test_relay_to_absent_target_is_silent() {
        let room = spawn_room(10, &["aaa"]);
        let mut alice = TestConn::new("c-alice", 16);

        join(&room, &alice, "alice").await;
        room.get_state().await.unwrap();
        alice.drain();

        room.inbound(
            alice.handle.clone(),
            ClientMessage::IceCandidate {
                target_user_id: "gone".to_string(),
                payload: IceCandidate {
                    candidate: "candidate:0".to_string(),
                    sdp_mid: None,
                    sdp_m_line_index: None,
                },
            },
        )
        .await
        .unwrap();
        room.get_state().await.unwrap();

        alice.assert_idle();
    }

    #[tokio::test]
    async fn test_media_state_broadcast_to_all() {
        let room = spawn_room(10, &["aaa", "bbb"]);
        let mut alice = TestConn::new("c-alice", 16);
        let mut bob = TestConn::new("c-bob", 16);

        join(&room, &alice, "alice").await;
        join(&room, &bob, "bob").await;
        room.get_state().await.unwrap();
        alice.drain();
        bob.drain();

        room.inbound(alice.handle.clone(), ClientMessage::VideoEnabled)
            .await
            .unwrap();

        for conn in [&mut alice, &mut bob] {
            match conn.next().await {
                ServerMessage::VideoStates { states } => {
                    assert_eq!(states.len(), 2);
                    assert!(states[0].is_video_enabled);
                    assert!(!states[1].is_video_enabled);
                }
                other => panic!("expected video_states, got {other:?}"),
            }
        }

        let state = room.get_state().await.unwrap();
        assert!(state.peers[0].video_enabled);
        assert!(!state.peers[0].audio_enabled);
    }

    #[tokio::test]
    async fn test_repeated_media_toggle_is_idempotent() {
        let room = spawn_room(10, &["aaa", "bbb"]);
        let mut alice = TestConn::new("c-alice", 16);
        let mut bob = TestConn::new("c-bob", 16);

        join(&room, &alice, "alice").await;
        join(&room, &bob, "bob").await;
        room.get_state().await.unwrap();
        alice.drain();
        bob.drain();

        for _ in 0..2 {
            room.inbound(alice.handle.clone(), ClientMessage::AudioEnabled)
                .await
                .unwrap();
        }
        // Video is already off.
        for _ in 0..2 {
            room.inbound(bob.handle.clone(), ClientMessage::VideoDisabled)
                .await
                .unwrap();
        }
        let state = room.get_state().await.unwrap();

        for conn in [&mut alice, &mut bob] {
            let messages = conn.drain();
            assert_eq!(messages.len(), 4);

            let audio: Vec<_> = messages
                .iter()
                .filter(|m| matches!(m, ServerMessage::AudioStates { .. }))
                .collect();
            assert_eq!(audio.len(), 2);
            assert_eq!(audio[0], audio[1]);
            match audio[0] {
                ServerMessage::AudioStates { states } => {
                    assert_eq!(states.len(), 2);
                    assert_eq!(states[0].user_id, "aaa");
                    assert!(states[0].is_audio_enabled);
                    assert!(!states[1].is_audio_enabled);
                }
                other => panic!("expected audio_states, got {other:?}"),
            }

            let video: Vec<_> = messages
                .iter()
                .filter(|m| matches!(m, ServerMessage::VideoStates { .. }))
                .collect();
            assert_eq!(video.len(), 2);
            assert_eq!(video[0], video[1]);
            match video[0] {
                ServerMessage::VideoStates { states } => {
                    assert!(states.iter().all(|s| !s.is_video_enabled));
                }
                other => panic!("expected video_states, got {other:?}"),
            }
        }

        assert!(state.peers[0].audio_enabled);
        assert!(!state.peers[1].audio_enabled);
        assert!(!state.peers[1].video_enabled);
    }

    #[tokio::test]
    async fn test_chat_is_stamped_by_hub() {
        let room = spawn_room(10, &["aaa"]);
        let mut alice = TestConn::new("c-alice", 16);

        join(&room, &alice, "alice").await;
        room.get_state().await.unwrap();
        alice.drain();

        room.inbound(
            alice.handle.clone(),
            ClientMessage::Chat {
                text: "hi".to_string(),
            },
        )
        .await
        .unwrap();

        match alice.next().await {
            ServerMessage::Chat {
                user_id,
                username,
                text,
                ..
            } => {
                assert_eq!(user_id, "aaa");
                assert_eq!(username, "alice");
                assert_eq!(text, "hi");
            }
            other => panic!("expected chat, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_broadcasts_departure() {
        let room = spawn_room(10, &["aaa", "bbb"]);
        let mut alice = TestConn::new("c-alice", 16);
        let bob = TestConn::new("c-bob", 16);

        join(&room, &alice, "alice").await;
        join(&room, &bob, "bob").await;
        room.get_state().await.unwrap();
        alice.drain();

        room.disconnected("c-bob".to_string()).await.unwrap();

        match alice.next().await {
            ServerMessage::System { message, .. } => assert_eq!(message, "bob left the room"),
            other => panic!("expected system, got {other:?}"),
        }
        assert_eq!(user_ids(&alice.next().await), vec!["aaa"]);
        assert!(matches!(alice.next().await, ServerMessage::AudioStates { .. }));
        assert!(matches!(alice.next().await, ServerMessage::VideoStates { .. }));

        // A second notification for the same connection is a no-op.
        room.disconnected("c-bob".to_string()).await.unwrap();
        room.get_state().await.unwrap();
        alice.assert_idle();
    }

    #[tokio::test]
    async fn test_explicit_leave_closes_channel() {
        let room = spawn_room(10, &["aaa"]);
        let mut alice = TestConn::new("c-alice", 16);

        join(&room, &alice, "alice").await;
        room.get_state().await.unwrap();
        alice.drain();

        room.inbound(alice.handle.clone(), ClientMessage::Leave)
            .await
            .unwrap();

        assert_eq!(alice.next_close().await, "left");
        assert_eq!(room.get_state().await.unwrap().peer_count(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_evicts_slow_peer() {
        let room = spawn_room(10, &["aaa", "bbb"]);
        // Room for the join sequence and nothing more.
        let slow = TestConn::new("c-slow", 4);
        let mut alice = TestConn::new("c-alice", 64);

        join(&room, &slow, "slow").await;
        join(&room, &alice, "alice").await;
        let state = room.get_state().await.unwrap();

        assert_eq!(state.peer_count(), 1);
        assert_eq!(state.peers[0].display_name, "alice");
        assert!(slow.handle.is_cancelled());

        let alice_messages = alice.drain();
        assert!(alice_messages.iter().any(|m| matches!(
            m,
            ServerMessage::System { message, .. } if message == "slow left the room"
        )));
        assert_eq!(user_ids(alice_messages.iter().rev().nth(2).unwrap()), vec!["bbb"]);
    }

    #[tokio::test]
    async fn test_cancel_closes_peers() {
        let room = spawn_room(10, &["aaa"]);
        let mut alice = TestConn::new("c-alice", 16);

        join(&room, &alice, "alice").await;
        room.get_state().await.unwrap();
        alice.drain();

        room.cancel();
        assert!(room.is_cancelled());
        assert_eq!(alice.next_close().await, "server shutting down");
    }
}

//! `RoomSession` - one participant's membership in a room.
//!
//! Ties the hub channel to the mesh controller: joins, then pumps every
//! inbound envelope into the controller until the session leaves or the
//! hub goes away.

use crate::config::MeshConfig;
use crate::errors::MeshError;
use crate::hub_client::{HubConnection, HubTasks};
use crate::mesh::{MeshController, MeshEvent, MeshHandle, MeshSnapshot};
use crate::transport::{MediaCapture, PeerConnectionFactory};

use signaling_protocol::{ClientMessage, MediaKind, ServerMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// A joined participant.
///
/// Dropping a session without [`RoomSession::leave`] tears everything
/// down without telling the hub; the hub then treats it as a disconnect.
pub struct RoomSession {
    local_id: String,
    username: String,
    mesh: MeshHandle,
    events: Option<mpsc::UnboundedReceiver<MeshEvent>>,
    controller: Option<JoinHandle<()>>,
    hub: Option<HubTasks>,
    pump_token: CancellationToken,
    cancel_token: CancellationToken,
    drain_timeout: Duration,
}

impl RoomSession {
    /// Connect to the hub at `url` and join as `username`.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Connect` or `MeshError::Timeout` if the hub is
    /// unreachable, and `MeshError::Rejected` if the hub answers the join
    /// with an error (for example a full room).
    #[instrument(skip_all, name = "mesh.session.join", fields(url = %url))]
    pub async fn join(
        url: &str,
        username: &str,
        factory: Arc<dyn PeerConnectionFactory>,
        capture: Arc<dyn MediaCapture>,
        config: MeshConfig,
    ) -> Result<Self, MeshError> {
        let cancel_token = CancellationToken::new();

        let connection = tokio::time::timeout(
            config.join_timeout,
            HubConnection::connect(url, config.hub_buffer, cancel_token.child_token()),
        )
        .await
        .map_err(|_| MeshError::Timeout("hub connection"))??;

        let HubConnection {
            outbound,
            mut inbound,
            tasks,
        } = connection;

        let (local_id, username) =
            match handshake(&outbound, &mut inbound, username, config.join_timeout).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    cancel_token.cancel();
                    return Err(e);
                }
            };

        info!(
            target: "mesh.controller",
            local_id = %local_id,
            username = %username,
            "Joined room"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let drain_timeout = config.link_close_timeout;
        let (mesh, controller) = MeshController::spawn(
            local_id.clone(),
            config,
            factory,
            capture,
            outbound,
            events_tx,
            cancel_token.child_token(),
        );

        let pump_token = cancel_token.child_token();
        tokio::spawn(pump_inbound(inbound, mesh.clone(), pump_token.clone()));

        Ok(Self {
            local_id,
            username,
            mesh,
            events: Some(events_rx),
            controller: Some(controller),
            hub: Some(tasks),
            pump_token,
            cancel_token,
            drain_timeout,
        })
    }

    /// Peer id the hub allocated.
    #[must_use]
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Take the event stream. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<MeshEvent>> {
        self.events.take()
    }

    #[must_use]
    pub fn mesh(&self) -> &MeshHandle {
        &self.mesh
    }

    /// # Errors
    ///
    /// See [`MeshHandle::enable`].
    pub async fn enable(&self, kind: MediaKind) -> Result<(), MeshError> {
        self.mesh.enable(kind).await
    }

    /// # Errors
    ///
    /// See [`MeshHandle::disable`].
    pub async fn disable(&self, kind: MediaKind) -> Result<(), MeshError> {
        self.mesh.disable(kind).await
    }

    /// # Errors
    ///
    /// Returns `MeshError::Stopped` once the session has ended.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), MeshError> {
        self.mesh.send_chat(text).await
    }

    /// # Errors
    ///
    /// Returns `MeshError::Stopped` once the session has ended.
    pub async fn snapshot(&self) -> Result<MeshSnapshot, MeshError> {
        self.mesh.snapshot().await
    }

    /// Leave the room.
    ///
    /// Stops handling inbound traffic, then has the controller cancel
    /// retries, close every link, release capture and send `leave`. The
    /// hub channel is closed once that message is flushed.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Stopped` if the session had already ended (for
    /// example because the hub went away).
    pub async fn leave(mut self) -> Result<(), MeshError> {
        self.pump_token.cancel();

        let result = self.mesh.leave().await;

        if let Some(controller) = self.controller.take() {
            let _ = controller.await;
        }
        if let Some(hub) = self.hub.take() {
            hub.finish(self.drain_timeout).await;
        }

        info!(
            target: "mesh.controller",
            local_id = %self.local_id,
            "Left room"
        );
        result
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Send `set_username` and wait for the verdict.
async fn handshake(
    outbound: &mpsc::Sender<ClientMessage>,
    inbound: &mut mpsc::Receiver<ServerMessage>,
    username: &str,
    timeout: Duration,
) -> Result<(String, String), MeshError> {
    outbound
        .send(ClientMessage::SetUsername {
            username: username.to_string(),
        })
        .await
        .map_err(|_| MeshError::HubClosed)?;

    let verdict = async {
        while let Some(message) = inbound.recv().await {
            match message {
                ServerMessage::UsernameAccepted { username, user_id } => {
                    return Ok((user_id, username));
                }
                ServerMessage::Error { code, message } => {
                    return Err(MeshError::Rejected { code, message });
                }
                other => {
                    debug!(
                        target: "mesh.hub_client",
                        message_type = other.type_name(),
                        "Ignoring envelope before acceptance"
                    );
                }
            }
        }
        Err(MeshError::HubClosed)
    };

    tokio::time::timeout(timeout, verdict)
        .await
        .map_err(|_| MeshError::Timeout("username_accepted"))?
}

/// Feed hub envelopes to the controller until cancelled or the hub closes.
async fn pump_inbound(
    mut inbound: mpsc::Receiver<ServerMessage>,
    mesh: MeshHandle,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,

            message = inbound.recv() => {
                match message {
                    Some(message) => {
                        if mesh.inbound(message).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        let _ = mesh.hub_closed().await;
                        break;
                    }
                }
            }
        }
    }
    debug!(target: "mesh.hub_client", "Inbound pump stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::testing::{MockMediaCapture, MockPeerConnectionFactory};
    use futures::{SinkExt, StreamExt};
    use signaling_protocol::{decode_client_message, encode_server_message, ErrorCode};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{accept_async, WebSocketStream};

    /// Accept one socket, read `set_username`, answer with `reply`.
    async fn scripted_hub(
        reply: ServerMessage,
    ) -> (String, JoinHandle<WebSocketStream<tokio::net::TcpStream>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(stream).await.unwrap();

            match socket.next().await {
                Some(Ok(Message::Text(text))) => assert!(matches!(
                    decode_client_message(text.as_str()).unwrap(),
                    ClientMessage::SetUsername { .. }
                )),
                other => panic!("expected set_username, got {other:?}"),
            }
            let text = encode_server_message(&reply).unwrap();
            socket.send(Message::text(text)).await.unwrap();
            socket
        });
        (url, task)
    }

    fn mocks() -> (Arc<dyn PeerConnectionFactory>, Arc<dyn MediaCapture>) {
        (
            Arc::new(MockPeerConnectionFactory::new()),
            Arc::new(MockMediaCapture::new()),
        )
    }

    #[tokio::test]
    async fn test_join_rejected_by_hub_error() {
        let (url, _hub) =
            scripted_hub(ServerMessage::error(ErrorCode::CapacityExceeded, "Room is full")).await;
        let (factory, capture) = mocks();

        let result = RoomSession::join(&url, "alice", factory, capture, MeshConfig::default()).await;

        match result {
            Err(MeshError::Rejected { code, message }) => {
                assert_eq!(code, ErrorCode::CapacityExceeded);
                assert_eq!(message, "Room is full");
            }
            Err(other) => panic!("expected rejection, got {other:?}"),
            Ok(_) => panic!("expected rejection, got a session"),
        }
    }

    #[tokio::test]
    async fn test_join_accepted_then_hub_loss_reported() {
        let (url, hub) = scripted_hub(ServerMessage::UsernameAccepted {
            username: "alice".to_string(),
            user_id: "k3j9x0a1b".to_string(),
        })
        .await;
        let (factory, capture) = mocks();

        let mut session = RoomSession::join(&url, "alice", factory, capture, MeshConfig::default())
            .await
            .unwrap();
        assert_eq!(session.local_id(), "k3j9x0a1b");
        assert_eq!(session.username(), "alice");

        let mut events = session.take_events().unwrap();
        assert!(session.take_events().is_none());

        drop(hub.await.unwrap());

        loop {
            match events.recv().await {
                Some(MeshEvent::HubDisconnected) => break,
                Some(_) => {}
                None => panic!("events ended without a disconnect"),
            }
        }
        assert!(matches!(session.snapshot().await, Err(MeshError::Stopped)));
    }

    #[tokio::test]
    async fn test_join_times_out_without_acceptance() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let _hub = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = accept_async(stream).await.unwrap();
            // Read but never answer.
            while socket.next().await.is_some() {}
        });
        let (factory, capture) = mocks();

        let config = MeshConfig::default().with_join_timeout(Duration::from_millis(200));
        let result = RoomSession::join(&url, "alice", factory, capture, config).await;

        assert!(matches!(
            result,
            Err(MeshError::Timeout("username_accepted"))
        ));
    }
}

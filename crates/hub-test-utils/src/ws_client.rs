//! Raw-protocol WebSocket participant.
//!
//! Speaks the hub's JSON envelopes directly, with no mesh logic, so tests
//! can assert exactly what the hub sends and in which order.

use futures::{SinkExt, StreamExt};
use signaling_protocol::{
    decode_server_message, encode_client_message, ClientMessage, ServerMessage,
};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Default wait for an expected envelope.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// A test participant connected to a hub.
pub struct TestWsClient {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestWsClient {
    /// Open a WebSocket to `url` (e.g. `TestHubServer::ws_url()`).
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", url, e))?;
        Ok(Self { socket })
    }

    /// Send a typed envelope.
    pub async fn send(&mut self, message: &ClientMessage) {
        let text = encode_client_message(message).expect("client message should encode");
        self.send_raw(&text).await;
    }

    /// Send arbitrary JSON.
    pub async fn send_json(&mut self, value: &serde_json::Value) {
        self.send_raw(&value.to_string()).await;
    }

    /// Send an arbitrary text frame.
    pub async fn send_raw(&mut self, text: &str) {
        self.socket
            .send(Message::text(text.to_string()))
            .await
            .expect("websocket send should succeed");
    }

    /// Receive the next envelope, failing the test after [`RECV_TIMEOUT`].
    pub async fn recv(&mut self) -> ServerMessage {
        self.try_recv_within(RECV_TIMEOUT)
            .await
            .expect("expected an envelope from the hub")
    }

    /// Receive the next envelope if one arrives within `timeout`.
    ///
    /// Returns `None` on timeout or when the hub closes the socket.
    pub async fn try_recv_within(&mut self, timeout: Duration) -> Option<ServerMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, self.socket.next())
                .await
                .ok()??;
            match frame {
                Ok(Message::Text(text)) => {
                    return Some(
                        decode_server_message(text.as_str()).expect("hub sent a valid envelope"),
                    );
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    /// Skip envelopes until one matches `predicate`.
    pub async fn recv_until<F>(&mut self, mut predicate: F) -> ServerMessage
    where
        F: FnMut(&ServerMessage) -> bool,
    {
        loop {
            let message = self.recv().await;
            if predicate(&message) {
                return message;
            }
        }
    }

    /// Assert that nothing arrives within `timeout`.
    pub async fn expect_silence(&mut self, timeout: Duration) {
        if let Some(message) = self.try_recv_within(timeout).await {
            panic!("expected no envelope, got {message:?}");
        }
    }

    /// Wait until the hub closes the socket.
    pub async fn expect_closed(&mut self) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, self.socket.next()).await {
                Ok(None | Some(Ok(Message::Close(_)) | Err(_))) => return,
                Ok(Some(Ok(_))) => continue,
                Err(_) => panic!("hub did not close the socket"),
            }
        }
    }

    /// Complete the join handshake and drain the initial roster envelopes.
    ///
    /// Returns the allocated peer id.
    pub async fn join(&mut self, username: &str) -> String {
        self.send(&ClientMessage::SetUsername {
            username: username.to_string(),
        })
        .await;

        let user_id = match self.recv().await {
            ServerMessage::UsernameAccepted { user_id, .. } => user_id,
            other => panic!("expected username_accepted, got {other:?}"),
        };
        self.recv_until(|m| matches!(m, ServerMessage::VideoStates { .. }))
            .await;
        user_id
    }

    /// Close the socket from the participant side.
    pub async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}

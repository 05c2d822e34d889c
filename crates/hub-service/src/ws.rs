//! WebSocket endpoint.
//!
//! Each upgraded socket is split: the write half goes to a
//! [`ConnectionActor`], the read half stays in the handler task, which
//! decodes frames and forwards envelopes to the room. Decode failures are
//! answered directly on the same connection and never reach the room.

use crate::actors::{ConnectionActor, ConnectionActorHandle};
use crate::errors::HubError;
use crate::routes::AppState;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::StreamExt;
use signaling_protocol::{decode_client_message, ServerMessage};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Time allowed for the writer to flush after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// `GET /ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[instrument(skip_all, name = "hub.ws", fields(connection_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4().to_string();
    tracing::Span::current().record("connection_id", connection_id.as_str());

    let (sink, mut stream) = socket.split();
    let cancel_token = state.room.child_token();
    let (connection, writer) = ConnectionActor::spawn(
        connection_id.clone(),
        sink,
        state.config.outbound_buffer,
        cancel_token.clone(),
    );
    let connections = state.metrics.connection_created();

    info!(
        target: "hub.ws",
        connection_id = %connection_id,
        connections = connections,
        "Connection opened"
    );

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if !forward_text(&state, &connection, &text).await {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    reply_error(&connection, &HubError::Protocol(
                        signaling_protocol::ProtocolError::NotAnObject,
                    ))
                    .await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Ping/pong are answered by the WebSocket layer.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(
                        target: "hub.ws",
                        connection_id = %connection_id,
                        error = %e,
                        "Socket read failed"
                    );
                    break;
                }
            },
        }
    }

    if state.room.disconnected(connection_id.clone()).await.is_err() {
        debug!(
            target: "hub.ws",
            connection_id = %connection_id,
            "Room stopped before disconnect was delivered"
        );
    }

    // Let queued envelopes (such as a final error) reach the socket first.
    connection.close("closing");
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        cancel_token.cancel();
    }
    let connections = state.metrics.connection_closed();

    info!(
        target: "hub.ws",
        connection_id = %connection_id,
        connections = connections,
        "Connection closed"
    );
}

/// Decode one text frame and hand it to the room.
///
/// Returns false when the room is gone and the socket should close.
async fn forward_text(state: &AppState, connection: &ConnectionActorHandle, text: &str) -> bool {
    match decode_client_message(text) {
        Ok(message) => match state.room.inbound(connection.clone(), message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    target: "hub.ws",
                    connection_id = %connection.connection_id(),
                    error = %e,
                    "Room unavailable"
                );
                reply_error(connection, &e).await;
                false
            }
        },
        Err(e) => {
            reply_error(connection, &HubError::Protocol(e)).await;
            true
        }
    }
}

async fn reply_error(connection: &ConnectionActorHandle, error: &HubError) {
    debug!(
        target: "hub.ws",
        connection_id = %connection.connection_id(),
        error = %error,
        "Rejecting frame"
    );

    let _ = connection
        .send(ServerMessage::error(error.error_code(), error.client_message()))
        .await;
}

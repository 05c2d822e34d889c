//! `ConnectionActor` - per-WebSocket writer actor.
//!
//! Each `ConnectionActor`:
//! - Owns the write half of exactly one WebSocket
//! - Serializes `ServerMessage`s from the room (and from its own reader's
//!   error replies) onto the socket in the order they were queued
//! - Stops on `Close`, on a socket write failure, or on cancellation
//!
//! The room never awaits a connection: it enqueues with
//! [`ConnectionActorHandle::try_send`] and treats a full or closed queue as
//! a slow consumer to evict. The bounded queue length is the hub's
//! `outbound_buffer` setting.
//!
//! # Lifecycle
//!
//! 1. Spawned by the WebSocket handler when the upgrade completes
//! 2. Runs until the socket fails, the room closes it, or the token fires
//! 3. Cancels its own token on exit so the paired reader stops too

use crate::errors::HubError;

use super::messages::ConnectionMessage;
use super::metrics::{ActorType, MailboxMonitor};

use axum::extract::ws::{close_code, CloseFrame, Message};
use futures::{Sink, SinkExt};
use signaling_protocol::{encode_server_message, ServerMessage};
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Upper bound on writing the final close frame.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a non-blocking enqueue failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound queue full")]
    Full,
    #[error("connection closed")]
    Closed,
}

impl<T> From<TrySendError<T>> for DeliveryError {
    fn from(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        }
    }
}

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: String,
}

impl ConnectionActorHandle {
    /// Build a handle around an existing mailbox.
    ///
    /// The room only talks to connections through handles, so tests drive
    /// it with a plain channel in place of a socket.
    #[must_use]
    pub fn new(
        connection_id: String,
        sender: mpsc::Sender<ConnectionMessage>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            sender,
            cancel_token,
            connection_id,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Enqueue an envelope without waiting.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Full` if the outbound queue is at capacity and
    /// `DeliveryError::Closed` if the actor has stopped.
    pub fn try_send(&self, message: ServerMessage) -> Result<(), DeliveryError> {
        self.sender
            .try_send(ConnectionMessage::Send { message })
            .map_err(DeliveryError::from)
    }

    /// Enqueue an envelope, waiting for queue space.
    ///
    /// Used by the connection's own reader for error replies.
    ///
    /// # Errors
    ///
    /// Returns `HubError::Internal` if the actor has stopped.
    pub async fn send(&self, message: ServerMessage) -> Result<(), HubError> {
        self.sender
            .send(ConnectionMessage::Send { message })
            .await
            .map_err(|e| HubError::Internal(format!("channel send failed: {e}")))
    }

    /// Ask the actor to flush queued envelopes, write a close frame and stop.
    ///
    /// If the queue is full the actor is cancelled instead.
    pub fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self
            .sender
            .try_send(ConnectionMessage::Close { reason })
            .is_err()
        {
            self.cancel_token.cancel();
        }
    }

    /// Cancel the connection actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor<S> {
    connection_id: String,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Write half of the WebSocket.
    sink: S,
    cancel_token: CancellationToken,
    mailbox: MailboxMonitor,
}

impl<S> ConnectionActor<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    /// Spawn a new connection actor over `sink`.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connection_id: String,
        sink: S,
        buffer: usize,
        cancel_token: CancellationToken,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(buffer);

        let actor = Self {
            connection_id: connection_id.clone(),
            receiver,
            sink,
            cancel_token: cancel_token.clone(),
            mailbox: MailboxMonitor::new(ActorType::Connection, &connection_id),
        };

        let task_handle = tokio::spawn(actor.run());

        (
            ConnectionActorHandle::new(connection_id, sender, cancel_token),
            task_handle,
        )
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "hub.actor.connection",
        fields(connection_id = %self.connection_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "hub.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "hub.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    self.write_close("cancelled").await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_depth(self.receiver.len());
                            let should_exit = self.handle_message(message).await;
                            self.mailbox.record_processed();

                            if should_exit {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "hub.actor.connection",
                                connection_id = %self.connection_id,
                                "ConnectionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        // Stop the paired reader as well.
        self.cancel_token.cancel();

        info!(
            target: "hub.actor.connection",
            connection_id = %self.connection_id,
            messages_processed = self.mailbox.messages_processed(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Send { message } => !self.write_envelope(&message).await,
            ConnectionMessage::Close { reason } => {
                self.write_close(&reason).await;
                true
            }
        }
    }

    /// Write one envelope. Returns false if the socket is gone.
    async fn write_envelope(&mut self, message: &ServerMessage) -> bool {
        let text = match encode_server_message(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    target: "hub.actor.connection",
                    connection_id = %self.connection_id,
                    message_type = message.type_name(),
                    error = %e,
                    "Dropping envelope that failed to encode"
                );
                return true;
            }
        };

        match self.sink.send(Message::Text(text)).await {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    target: "hub.actor.connection",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Socket write failed"
                );
                false
            }
        }
    }

    async fn write_close(&mut self, reason: &str) {
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: reason.to_string().into(),
        };

        match tokio::time::timeout(
            CLOSE_FRAME_TIMEOUT,
            self.sink.send(Message::Close(Some(frame))),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(
                    target: "hub.actor.connection",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Close frame not written"
                );
            }
            Err(_) => {
                debug!(
                    target: "hub.actor.connection",
                    connection_id = %self.connection_id,
                    "Close frame write timed out"
                );
            }
        }
    }
}

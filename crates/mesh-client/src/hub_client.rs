//! WebSocket channel to the signaling hub.
//!
//! Splits the socket into a writer task draining an outbound queue and a
//! reader task feeding an inbound queue, so the controller only ever talks
//! to channels. The writer closes the socket once every outbound sender has
//! been dropped, which is how a `leave` gets flushed before disconnecting.

use crate::errors::MeshError;

use futures::{SinkExt, StreamExt};
use signaling_protocol::{decode_server_message, encode_client_message, ClientMessage, ServerMessage};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An open hub channel.
#[derive(Debug)]
pub struct HubConnection {
    /// Envelopes to send. The socket closes once all clones are dropped.
    pub outbound: mpsc::Sender<ClientMessage>,
    /// Envelopes received. Yields `None` once the hub closes the socket.
    pub inbound: mpsc::Receiver<ServerMessage>,
    pub tasks: HubTasks,
}

/// The socket's reader and writer tasks.
#[derive(Debug)]
pub struct HubTasks {
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl HubConnection {
    /// Open a WebSocket to `url`.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Connect` if the handshake fails.
    pub async fn connect(
        url: &str,
        buffer: usize,
        cancel_token: CancellationToken,
    ) -> Result<Self, MeshError> {
        let (socket, _response) = connect_async(url)
            .await
            .map_err(|e| MeshError::Connect(format!("{url}: {e}")))?;

        info!(target: "mesh.hub_client", url = %url, "Hub connected");

        let (mut sink, mut stream) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<ClientMessage>(buffer.max(1));
        let (inbound_tx, inbound) = mpsc::channel::<ServerMessage>(buffer.max(1));

        let writer_token = cancel_token.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = writer_token.cancelled() => break,

                    message = outbound_rx.recv() => {
                        let Some(message) = message else { break };

                        let text = match encode_client_message(&message) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(
                                    target: "mesh.hub_client",
                                    message_type = message.type_name(),
                                    error = %e,
                                    "Dropping envelope that failed to encode"
                                );
                                continue;
                            }
                        };

                        if let Err(e) = sink.send(Message::text(text)).await {
                            debug!(target: "mesh.hub_client", error = %e, "Hub write failed");
                            break;
                        }
                    }
                }
            }

            if let Err(e) = sink.close().await {
                debug!(target: "mesh.hub_client", error = %e, "Hub close failed");
            }
            debug!(target: "mesh.hub_client", "Hub writer stopped");
        });

        let reader_token = cancel_token.clone();
        let reader = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    () = reader_token.cancelled() => break,
                    frame = stream.next() => frame,
                };

                match frame {
                    Some(Ok(Message::Text(text))) => match decode_server_message(text.as_str()) {
                        Ok(message) => {
                            if inbound_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(
                                target: "mesh.hub_client",
                                error = %e,
                                "Ignoring undecodable envelope"
                            );
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!(
                            target: "mesh.hub_client",
                            reason = frame.as_ref().map_or("", |f| f.reason.as_str()),
                            "Hub closed the connection"
                        );
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(target: "mesh.hub_client", error = %e, "Hub read failed");
                        break;
                    }
                    None => break,
                }
            }
            debug!(target: "mesh.hub_client", "Hub reader stopped");
        });

        Ok(Self {
            outbound,
            inbound,
            tasks: HubTasks {
                writer,
                reader,
                cancel_token,
            },
        })
    }
}

impl HubTasks {
    /// Wait up to `timeout` for the writer to flush and close the socket,
    /// then stop the reader.
    pub async fn finish(mut self, timeout: Duration) {
        if tokio::time::timeout(timeout, &mut self.writer).await.is_err() {
            debug!(target: "mesh.hub_client", "Hub writer did not drain in time");
            self.writer.abort();
        }

        self.cancel_token.cancel();
        if tokio::time::timeout(timeout, &mut self.reader).await.is_err() {
            self.reader.abort();
        }
    }
}

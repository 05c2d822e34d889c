//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via `tokio::sync::mpsc`.
//! Response patterns use `tokio::sync::oneshot` for request-reply semantics.

use super::connection::ConnectionActorHandle;

use chrono::{DateTime, Utc};
use signaling_protocol::{ClientMessage, ServerMessage};
use tokio::sync::oneshot;

/// Messages sent to `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// A decoded envelope from a connection, joined or not.
    Inbound {
        /// Handle used for replies and, after join, as the peer's channel.
        connection: ConnectionActorHandle,
        message: ClientMessage,
    },

    /// A connection's transport closed. Removes the peer if it had joined.
    Disconnected { connection_id: String },

    /// Get a snapshot of room membership.
    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
}

/// Messages sent to `ConnectionActor`.
#[derive(Debug)]
pub enum ConnectionMessage {
    /// Write an envelope to the socket.
    Send { message: ServerMessage },

    /// Write a close frame and stop.
    Close { reason: String },
}

/// Why a peer left the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// Participant sent `leave`.
    Voluntary,
    /// Transport closed.
    Disconnected,
    /// Outbound queue was full or closed during fan-out.
    Evicted,
}

impl LeaveReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LeaveReason::Voluntary => "voluntary",
            LeaveReason::Disconnected => "disconnected",
            LeaveReason::Evicted => "evicted",
        }
    }
}

/// Snapshot of one registered peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: String,
    pub display_name: String,
    pub connection_id: String,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub joined_at: DateTime<Utc>,
}

/// Snapshot of the room, peers in join order.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub peers: Vec<PeerInfo>,
    pub max_participants: usize,
}

impl RoomState {
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Find a peer by display name (names are not unique; first match wins).
    #[must_use]
    pub fn peer_named(&self, display_name: &str) -> Option<&PeerInfo> {
        self.peers.iter().find(|p| p.display_name == display_name)
    }
}

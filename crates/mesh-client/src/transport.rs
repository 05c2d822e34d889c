//! Platform seam for peer transports and capture devices.
//!
//! The mesh client never touches media or network paths itself. A platform
//! (a browser binding, a native WebRTC stack, or the mocks in
//! `mesh_client::testing`) implements these traits and reports
//! asynchronous transport activity as [`TransportEvent`]s on the channel it
//! is handed at creation.

use crate::errors::MeshError;

use async_trait::async_trait;
use signaling_protocol::{IceCandidate, MediaKind, SessionDescription};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A captured local media track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// A media track received from a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// The local tracks currently attached to every link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackSet {
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
}

impl TrackSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, kind: MediaKind) -> Option<&LocalTrack> {
        match kind {
            MediaKind::Audio => self.audio.as_ref(),
            MediaKind::Video => self.video.as_ref(),
        }
    }

    /// Replace the track for `kind`, returning the previous one.
    pub fn set(&mut self, kind: MediaKind, track: Option<LocalTrack>) -> Option<LocalTrack> {
        match kind {
            MediaKind::Audio => std::mem::replace(&mut self.audio, track),
            MediaKind::Video => std::mem::replace(&mut self.video, track),
        }
    }

    pub fn take(&mut self, kind: MediaKind) -> Option<LocalTrack> {
        self.set(kind, None)
    }

    /// Held tracks, audio first.
    pub fn iter(&self) -> impl Iterator<Item = &LocalTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// Connectivity state reported by the platform transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    /// Transient loss; the platform may recover or report `Failed`.
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Asynchronous activity of one peer transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local network-path candidate to trickle to the remote peer.
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteTrack(RemoteTrack),
}

/// One peer-to-peer media transport.
///
/// Implementations must be safe to call from the owning link task while the
/// platform emits events concurrently.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, MeshError>;

    async fn create_answer(&self) -> Result<SessionDescription, MeshError>;

    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), MeshError>;

    /// Apply the remote description. Applying an offer while a local offer
    /// is outstanding rolls the local offer back.
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MeshError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MeshError>;

    /// Attach (`Some`) or detach (`None`) the local track for `kind`.
    async fn set_track(&self, kind: MediaKind, track: Option<LocalTrack>)
        -> Result<(), MeshError>;

    /// Release all transport resources. Idempotent.
    async fn close(&self);
}

/// Creates transports for new links.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a transport toward `remote_id` with `tracks` already attached.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Transport` if the platform refuses.
    async fn create(
        &self,
        remote_id: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
        tracks: &TrackSet,
    ) -> Result<Arc<dyn PeerConnection>, MeshError>;
}

/// Local capture devices.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    /// # Errors
    ///
    /// Returns `MeshError::Capture` if the device is unavailable.
    async fn acquire(&self, kind: MediaKind) -> Result<LocalTrack, MeshError>;

    async fn release(&self, track: LocalTrack);
}

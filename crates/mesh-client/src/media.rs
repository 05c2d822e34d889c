//! Media state synchronizer.
//!
//! Owns the local [`TrackSet`] and keeps three things in step: the capture
//! device, the tracks attached to every live link, and the media flags the
//! hub advertises for this participant. The hub only hears about a change
//! once every link has acknowledged it.

use crate::errors::MeshError;
use crate::link::LinkHandle;
use crate::transport::{LocalTrack, MediaCapture, TrackSet};

use futures::future::join_all;
use signaling_protocol::{ClientMessage, MediaKind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct MediaSynchronizer {
    capture: Arc<dyn MediaCapture>,
    tracks: TrackSet,
    audio_enabled: bool,
    video_enabled: bool,
}

impl MediaSynchronizer {
    #[must_use]
    pub fn new(capture: Arc<dyn MediaCapture>) -> Self {
        Self {
            capture,
            tracks: TrackSet::new(),
            audio_enabled: false,
            video_enabled: false,
        }
    }

    /// Tracks new links are created with.
    #[must_use]
    pub fn tracks(&self) -> &TrackSet {
        &self.tracks
    }

    #[must_use]
    pub fn is_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_enabled,
            MediaKind::Video => self.video_enabled,
        }
    }

    /// Turn a media kind on.
    ///
    /// Acquires the capture track unless one is already held, attaches it
    /// to every link in `links` and waits for each to acknowledge, then
    /// tells the hub. A held track is not re-acquired or re-attached; the
    /// state message is sent again.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Capture` if the device cannot be acquired (the
    /// hub is not told) and `MeshError::HubClosed` if the state message
    /// cannot be queued.
    pub async fn enable(
        &mut self,
        kind: MediaKind,
        links: &[LinkHandle],
        outbound: &mpsc::Sender<ClientMessage>,
    ) -> Result<(), MeshError> {
        if self.tracks.get(kind).is_none() {
            let track = self.capture.acquire(kind).await?;
            info!(
                target: "mesh.media",
                kind = %kind,
                track_id = %track.id,
                "Capture acquired"
            );
            self.tracks.set(kind, Some(track.clone()));
            apply_to_links(kind, Some(track), links).await;
        } else {
            debug!(
                target: "mesh.media",
                kind = %kind,
                "Track already held, re-sending state"
            );
        }

        self.set_flag(kind, true);
        send_state(outbound, kind, true).await
    }

    /// Turn a media kind off.
    ///
    /// Detaches the track from every link, releases the capture device,
    /// then tells the hub.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::HubClosed` if the state message cannot be queued.
    pub async fn disable(
        &mut self,
        kind: MediaKind,
        links: &[LinkHandle],
        outbound: &mpsc::Sender<ClientMessage>,
    ) -> Result<(), MeshError> {
        if let Some(track) = self.tracks.take(kind) {
            apply_to_links(kind, None, links).await;
            self.capture.release(track).await;
            info!(target: "mesh.media", kind = %kind, "Capture released");
        }

        self.set_flag(kind, false);
        send_state(outbound, kind, false).await
    }

    /// Release every held track without notifying links or the hub.
    pub async fn release_all(&mut self) {
        for kind in MediaKind::ALL {
            if let Some(track) = self.tracks.take(kind) {
                self.capture.release(track).await;
            }
            self.set_flag(kind, false);
        }
    }

    fn set_flag(&mut self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Audio => self.audio_enabled = enabled,
            MediaKind::Video => self.video_enabled = enabled,
        }
    }
}

/// Apply a track change to every link and wait for all of them.
async fn apply_to_links(kind: MediaKind, track: Option<LocalTrack>, links: &[LinkHandle]) {
    let results = join_all(
        links
            .iter()
            .map(|link| async { (link.remote_id(), link.set_track(kind, track.clone()).await) }),
    )
    .await;

    for (remote_id, result) in results {
        if let Err(e) = result {
            // The failed link reports itself; its replacement gets the
            // current track set at creation.
            warn!(
                target: "mesh.media",
                remote_id = %remote_id,
                kind = %kind,
                error = %e,
                "Track change not applied to link"
            );
        }
    }
}

async fn send_state(
    outbound: &mpsc::Sender<ClientMessage>,
    kind: MediaKind,
    enabled: bool,
) -> Result<(), MeshError> {
    outbound
        .send(ClientMessage::media_state(kind, enabled))
        .await
        .map_err(|_| MeshError::HubClosed)
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
    use crate::link::{LinkActor, LinkParams};
    use crate::testing::{MockMediaCapture, MockPeerConnection};
    use signaling_protocol::LinkRole;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        synchronizer: MediaSynchronizer,
        capture: MockMediaCapture,
        links: Vec<LinkHandle>,
        connections: Vec<Arc<MockPeerConnection>>,
        outbound_tx: mpsc::Sender<ClientMessage>,
        outbound: mpsc::Receiver<ClientMessage>,
        _reports: mpsc::UnboundedReceiver<crate::link::LinkReport>,
    }

    fn fixture(remote_ids: &[&str]) -> Fixture {
        let capture = MockMediaCapture::new();
        let (outbound_tx, outbound) = mpsc::channel(32);
        let (reports_tx, reports) = mpsc::unbounded_channel();

        let mut links = Vec::new();
        let mut connections = Vec::new();
        for remote_id in remote_ids {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let connection = Arc::new(MockPeerConnection::new(remote_id, events_tx, false));
            let params = LinkParams {
                remote_id: (*remote_id).to_string(),
                generation: 1,
                role: LinkRole::Responder,
                establishment_timeout: Duration::from_secs(10),
                command_buffer: 8,
                outbound: outbound_tx.clone(),
                reports: reports_tx.clone(),
                cancel_token: CancellationToken::new(),
            };
            let (handle, _task) =
                LinkActor::spawn_with_connection(params, connection.clone(), events_rx);
            links.push(handle);
            connections.push(connection);
        }

        Fixture {
            synchronizer: MediaSynchronizer::new(Arc::new(capture.clone())),
            capture,
            links,
            connections,
            outbound_tx,
            outbound,
            _reports: reports,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_applies_to_every_link_before_notifying_hub() {
        let mut f = fixture(&["bob", "carol"]);

        f.synchronizer
            .enable(MediaKind::Audio, &f.links, &f.outbound_tx)
            .await
            .unwrap();

        // Every link acknowledged before enable returned.
        for connection in &f.connections {
            assert!(connection.tracks().get(MediaKind::Audio).is_some());
        }
        assert_eq!(f.outbound.recv().await, Some(ClientMessage::AudioEnabled));
        assert!(f.synchronizer.is_enabled(MediaKind::Audio));
        assert!(!f.synchronizer.is_enabled(MediaKind::Video));
        assert_eq!(f.capture.acquired(MediaKind::Audio), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_enable_resends_without_reacquiring() {
        let mut f = fixture(&["bob"]);

        for _ in 0..2 {
            f.synchronizer
                .enable(MediaKind::Video, &f.links, &f.outbound_tx)
                .await
                .unwrap();
            assert_eq!(f.outbound.recv().await, Some(ClientMessage::VideoEnabled));
        }

        assert_eq!(f.capture.acquired(MediaKind::Video), 1);
        assert_eq!(f.connections[0].track_changes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_detaches_then_releases() {
        let mut f = fixture(&["bob", "carol"]);

        f.synchronizer
            .enable(MediaKind::Audio, &f.links, &f.outbound_tx)
            .await
            .unwrap();
        f.outbound.recv().await;

        f.synchronizer
            .disable(MediaKind::Audio, &f.links, &f.outbound_tx)
            .await
            .unwrap();

        for connection in &f.connections {
            assert!(connection.tracks().get(MediaKind::Audio).is_none());
        }
        assert_eq!(f.capture.released(MediaKind::Audio), 1);
        assert!(!f.capture.is_held(MediaKind::Audio));
        assert!(f.synchronizer.tracks().is_empty());
        assert_eq!(f.outbound.recv().await, Some(ClientMessage::AudioDisabled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_failure_leaves_state_untouched() {
        let mut f = fixture(&["bob"]);
        f.capture.set_unavailable(MediaKind::Video);

        let result = f
            .synchronizer
            .enable(MediaKind::Video, &f.links, &f.outbound_tx)
            .await;

        assert!(matches!(result, Err(MeshError::Capture(_))));
        assert!(!f.synchronizer.is_enabled(MediaKind::Video));
        assert!(f.outbound.try_recv().is_err());
        assert_eq!(f.connections[0].track_changes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_all_frees_capture() {
        let mut f = fixture(&[]);

        f.synchronizer
            .enable(MediaKind::Audio, &f.links, &f.outbound_tx)
            .await
            .unwrap();
        f.synchronizer
            .enable(MediaKind::Video, &f.links, &f.outbound_tx)
            .await
            .unwrap();

        f.synchronizer.release_all().await;

        assert!(!f.capture.is_held(MediaKind::Audio));
        assert!(!f.capture.is_held(MediaKind::Video));
        assert!(!f.synchronizer.is_enabled(MediaKind::Audio));
    }
}

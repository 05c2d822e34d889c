//! In-memory transport and capture doubles.
//!
//! Available to this crate's unit tests and, behind the `test-utils`
//! feature, to integration tests and downstream crates.
//!
//! [`MockPeerConnection`] records every call. Built with `auto_connect`, it
//! behaves like a transport on a perfect network: it gathers one local
//! candidate when its first local description is set and reports
//! `Connected` once both descriptions are in place.

use crate::errors::MeshError;
use crate::transport::{
    LocalTrack, MediaCapture, PeerConnection, PeerConnectionFactory, TrackSet, TransportEvent,
    TransportState,
};

use async_trait::async_trait;
use signaling_protocol::{IceCandidate, MediaKind, SessionDescription};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct ConnectionRecord {
    offers_created: u32,
    answers_created: u32,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_history: Vec<SessionDescription>,
    candidates: Vec<IceCandidate>,
    initial_tracks: TrackSet,
    tracks: TrackSet,
    track_changes: usize,
    gathered: bool,
    connected: bool,
    closed: bool,
    answers_held: bool,
}

/// Scriptable [`PeerConnection`].
#[derive(Debug)]
pub struct MockPeerConnection {
    remote_id: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    auto_connect: bool,
    record: Mutex<ConnectionRecord>,
    answers_released: Notify,
}

impl MockPeerConnection {
    #[must_use]
    pub fn new(
        remote_id: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
        auto_connect: bool,
    ) -> Self {
        Self::with_tracks(remote_id, events, auto_connect, TrackSet::new())
    }

    fn with_tracks(
        remote_id: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
        auto_connect: bool,
        tracks: TrackSet,
    ) -> Self {
        Self {
            remote_id: remote_id.to_string(),
            events,
            auto_connect,
            record: Mutex::new(ConnectionRecord {
                initial_tracks: tracks.clone(),
                tracks,
                ..ConnectionRecord::default()
            }),
            answers_released: Notify::new(),
        }
    }

    #[must_use]
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    /// Report a transport event as the platform would.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Report `Connected`.
    pub fn connect(&self) {
        self.emit(TransportEvent::StateChanged(TransportState::Connected));
    }

    /// Make `create_answer` block until [`Self::release_answers`].
    pub fn hold_answers(&self) {
        lock(&self.record).answers_held = true;
    }

    pub fn release_answers(&self) {
        lock(&self.record).answers_held = false;
        self.answers_released.notify_waiters();
    }

    #[must_use]
    pub fn offers_created(&self) -> u32 {
        lock(&self.record).offers_created
    }

    #[must_use]
    pub fn answers_created(&self) -> u32 {
        lock(&self.record).answers_created
    }

    #[must_use]
    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.record).local.clone()
    }

    /// Every remote description applied, oldest first.
    #[must_use]
    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        lock(&self.record).remote_history.clone()
    }

    #[must_use]
    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.record).candidates.clone()
    }

    /// Tracks passed at creation.
    #[must_use]
    pub fn initial_tracks(&self) -> TrackSet {
        lock(&self.record).initial_tracks.clone()
    }

    /// Tracks currently attached.
    #[must_use]
    pub fn tracks(&self) -> TrackSet {
        lock(&self.record).tracks.clone()
    }

    /// Number of `set_track` calls.
    #[must_use]
    pub fn track_changes(&self) -> usize {
        lock(&self.record).track_changes
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.record).closed
    }

    fn check_open(&self) -> Result<(), MeshError> {
        if lock(&self.record).closed {
            Err(MeshError::Transport("connection closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn maybe_connect(&self) {
        let ready = {
            let mut record = lock(&self.record);
            let ready = self.auto_connect
                && !record.connected
                && record.local.is_some()
                && record.remote.is_some();
            if ready {
                record.connected = true;
            }
            ready
        };

        if ready {
            self.connect();
        }
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, MeshError> {
        self.check_open()?;
        let mut record = lock(&self.record);
        record.offers_created += 1;
        Ok(SessionDescription::offer(format!(
            "offer:{}:{}",
            self.remote_id, record.offers_created
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MeshError> {
        loop {
            let released = self.answers_released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if !lock(&self.record).answers_held {
                break;
            }
            released.await;
        }

        self.check_open()?;
        let mut record = lock(&self.record);
        record.answers_created += 1;
        Ok(SessionDescription::answer(format!(
            "answer:{}:{}",
            self.remote_id, record.answers_created
        )))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MeshError> {
        self.check_open()?;
        let gather = {
            let mut record = lock(&self.record);
            record.local = Some(description);
            let gather = self.auto_connect && !record.gathered;
            record.gathered = true;
            gather
        };

        if gather {
            self.emit(TransportEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:host:{}", self.remote_id),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            }));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), MeshError> {
        self.check_open()?;
        {
            let mut record = lock(&self.record);
            record.remote_history.push(description.clone());
            record.remote = Some(description);
        }
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MeshError> {
        self.check_open()?;
        lock(&self.record).candidates.push(candidate);
        Ok(())
    }

    async fn set_track(
        &self,
        kind: MediaKind,
        track: Option<LocalTrack>,
    ) -> Result<(), MeshError> {
        self.check_open()?;
        let mut record = lock(&self.record);
        record.tracks.set(kind, track);
        record.track_changes += 1;
        Ok(())
    }

    async fn close(&self) {
        lock(&self.record).closed = true;
    }
}

#[derive(Debug, Default)]
struct FactoryRecord {
    created: Vec<Arc<MockPeerConnection>>,
    failures_remaining: usize,
}

/// [`PeerConnectionFactory`] handing out [`MockPeerConnection`]s and
/// keeping every one it created.
#[derive(Debug, Clone, Default)]
pub struct MockPeerConnectionFactory {
    auto_connect: bool,
    record: Arc<Mutex<FactoryRecord>>,
}

impl MockPeerConnectionFactory {
    /// Connections that only move when the test drives them.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections that connect on their own once negotiated.
    #[must_use]
    pub fn auto_connect() -> Self {
        Self {
            auto_connect: true,
            ..Self::default()
        }
    }

    /// Make the next `count` creations fail.
    pub fn fail_next(&self, count: usize) {
        lock(&self.record).failures_remaining = count;
    }

    #[must_use]
    pub fn created_count(&self) -> usize {
        lock(&self.record).created.len()
    }

    /// Every connection created toward `remote_id`, oldest first.
    #[must_use]
    pub fn connections_to(&self, remote_id: &str) -> Vec<Arc<MockPeerConnection>> {
        lock(&self.record)
            .created
            .iter()
            .filter(|connection| connection.remote_id == remote_id)
            .cloned()
            .collect()
    }

    /// The newest connection toward `remote_id`.
    #[must_use]
    pub fn latest(&self, remote_id: &str) -> Option<Arc<MockPeerConnection>> {
        self.connections_to(remote_id).pop()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerConnectionFactory {
    async fn create(
        &self,
        remote_id: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
        tracks: &TrackSet,
    ) -> Result<Arc<dyn PeerConnection>, MeshError> {
        let mut record = lock(&self.record);
        if record.failures_remaining > 0 {
            record.failures_remaining -= 1;
            return Err(MeshError::Transport(format!(
                "no transport toward {remote_id}"
            )));
        }

        let connection = Arc::new(MockPeerConnection::with_tracks(
            remote_id,
            events,
            self.auto_connect,
            tracks.clone(),
        ));
        record.created.push(connection.clone());
        Ok(connection)
    }
}

#[derive(Debug, Default)]
struct CaptureRecord {
    next_id: u32,
    acquired: Vec<LocalTrack>,
    released: Vec<LocalTrack>,
    unavailable: Vec<MediaKind>,
}

/// [`MediaCapture`] that hands out numbered tracks.
#[derive(Debug, Clone, Default)]
pub struct MockMediaCapture {
    record: Arc<Mutex<CaptureRecord>>,
}

impl MockMediaCapture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make future acquisitions of `kind` fail.
    pub fn set_unavailable(&self, kind: MediaKind) {
        lock(&self.record).unavailable.push(kind);
    }

    #[must_use]
    pub fn acquired(&self, kind: MediaKind) -> usize {
        lock(&self.record)
            .acquired
            .iter()
            .filter(|track| track.kind == kind)
            .count()
    }

    #[must_use]
    pub fn released(&self, kind: MediaKind) -> usize {
        lock(&self.record)
            .released
            .iter()
            .filter(|track| track.kind == kind)
            .count()
    }

    /// Whether a track of `kind` is acquired and not yet released.
    #[must_use]
    pub fn is_held(&self, kind: MediaKind) -> bool {
        self.acquired(kind) > self.released(kind)
    }
}

#[async_trait]
impl MediaCapture for MockMediaCapture {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalTrack, MeshError> {
        let mut record = lock(&self.record);
        if record.unavailable.contains(&kind) {
            return Err(MeshError::Capture(format!("no {kind} device")));
        }

        record.next_id += 1;
        let track = LocalTrack {
            id: format!("{kind}-{}", record.next_id),
            kind,
        };
        record.acquired.push(track.clone());
        Ok(track)
    }

    async fn release(&self, track: LocalTrack) {
        lock(&self.record).released.push(track);
    }
}

//! `MeshController` - owner of this participant's links.
//!
//! The controller is the single writer of the link table, the roster, the
//! remote media flags, the [`Supervisor`] and the [`MediaSynchronizer`].
//! Everything that changes them arrives on one of its inputs:
//!
//! - hub envelopes and application requests through [`MeshHandle`]
//! - link reports, tagged with the reporting link's generation
//! - retry timers fired by the supervisor
//!
//! Observable outcomes leave as [`MeshEvent`]s on an unbounded channel.
//!
//! # Invariants
//!
//! - At most one link per remote peer; a replacement is only spawned once
//!   the previous link's transport is closed
//! - A peer missing from the latest roster has no link and no pending retry
//! - Nothing is sent to the hub after leave starts

use crate::config::MeshConfig;
use crate::errors::MeshError;
use crate::link::{LinkActor, LinkHandle, LinkParams, LinkReport, LinkReportKind, LinkState};
use crate::media::MediaSynchronizer;
use crate::supervisor::{FailureOutcome, RetryFired, Supervisor};
use crate::transport::{MediaCapture, PeerConnectionFactory, RemoteTrack};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use signaling_protocol::{
    ClientMessage, ErrorCode, LinkRole, MediaKind, ServerMessage, SessionDescription, UserEntry,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Something the application may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// The hub published a new roster (join order, including this peer).
    MembershipChanged { users: Vec<UserEntry> },
    LinkStateChanged {
        remote_id: String,
        state: LinkState,
    },
    /// A link was closed because its peer left, or by leave.
    LinkClosed { remote_id: String },
    /// Retries toward this peer are exhausted.
    PeerUnreachable { remote_id: String },
    RemoteTrack {
        remote_id: String,
        track: RemoteTrack,
    },
    /// Remote media flags for one kind, keyed by peer id.
    MediaStatesChanged {
        kind: MediaKind,
        states: HashMap<String, bool>,
    },
    Chat {
        user_id: String,
        username: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    System {
        message: String,
        timestamp: DateTime<Utc>,
    },
    HubError { code: ErrorCode, message: String },
    /// The hub channel closed without a leave.
    HubDisconnected,
    Left,
}

/// One row of [`MeshSnapshot::links`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub remote_id: String,
    pub generation: u64,
    pub role: LinkRole,
    pub state: LinkState,
}

/// Point-in-time view of the controller's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSnapshot {
    pub local_id: String,
    /// Live links, sorted by remote id.
    pub links: Vec<LinkSnapshot>,
    pub roster: Vec<UserEntry>,
    pub remote_audio: HashMap<String, bool>,
    pub remote_video: HashMap<String, bool>,
    pub local_audio: bool,
    pub local_video: bool,
    /// Consecutive failed attempts per peer since its last `Connected`.
    pub retry_attempts: HashMap<String, u32>,
    /// Rostered peers whose retries are exhausted.
    pub unreachable: Vec<String>,
}

impl MeshSnapshot {
    #[must_use]
    pub fn link(&self, remote_id: &str) -> Option<&LinkSnapshot> {
        self.links.iter().find(|link| link.remote_id == remote_id)
    }
}

/// Messages handled by the `MeshController`.
#[derive(Debug)]
enum MeshCommand {
    Inbound(ServerMessage),
    SetMedia {
        kind: MediaKind,
        enabled: bool,
        respond_to: oneshot::Sender<Result<(), MeshError>>,
    },
    Chat {
        text: String,
        respond_to: oneshot::Sender<Result<(), MeshError>>,
    },
    Snapshot {
        respond_to: oneshot::Sender<MeshSnapshot>,
    },
    Leave {
        respond_to: oneshot::Sender<()>,
    },
    HubClosed,
}

/// Handle to the `MeshController`.
#[derive(Clone, Debug)]
pub struct MeshHandle {
    sender: mpsc::Sender<MeshCommand>,
    cancel_token: CancellationToken,
}

impl MeshHandle {
    /// Hand an envelope from the hub to the controller.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Stopped` if the controller has exited.
    pub async fn inbound(&self, message: ServerMessage) -> Result<(), MeshError> {
        self.command(MeshCommand::Inbound(message)).await
    }

    /// Turn local media on. Returns once every link has the track and the
    /// hub has been told.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Capture` if the device is unavailable, or
    /// `MeshError::Stopped` if the controller has exited.
    pub async fn enable(&self, kind: MediaKind) -> Result<(), MeshError> {
        self.set_media(kind, true).await
    }

    /// Turn local media off.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Stopped` if the controller has exited.
    pub async fn disable(&self, kind: MediaKind) -> Result<(), MeshError> {
        self.set_media(kind, false).await
    }

    /// Send a chat line to the room.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Stopped` if the controller has exited.
    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.command(MeshCommand::Chat {
            text: text.into(),
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| MeshError::Stopped)?
    }

    /// # Errors
    ///
    /// Returns `MeshError::Stopped` if the controller has exited.
    pub async fn snapshot(&self) -> Result<MeshSnapshot, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.command(MeshCommand::Snapshot { respond_to: tx }).await?;
        rx.await.map_err(|_| MeshError::Stopped)
    }

    /// Close every link, release capture, send `leave` and stop the
    /// controller.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Stopped` if the controller had already exited.
    pub async fn leave(&self) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.command(MeshCommand::Leave { respond_to: tx }).await?;
        rx.await.map_err(|_| MeshError::Stopped)
    }

    /// Tell the controller the hub channel is gone.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Stopped` if the controller has exited.
    pub async fn hub_closed(&self) -> Result<(), MeshError> {
        self.command(MeshCommand::HubClosed).await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn set_media(&self, kind: MediaKind, enabled: bool) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.command(MeshCommand::SetMedia {
            kind,
            enabled,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| MeshError::Stopped)?
    }

    async fn command(&self, command: MeshCommand) -> Result<(), MeshError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| MeshError::Stopped)
    }
}

struct LinkEntry {
    handle: LinkHandle,
    state: LinkState,
}

/// The `MeshController` implementation.
pub struct MeshController {
    local_id: String,
    config: MeshConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    receiver: mpsc::Receiver<MeshCommand>,
    reports_tx: mpsc::UnboundedSender<LinkReport>,
    reports: mpsc::UnboundedReceiver<LinkReport>,
    retries: mpsc::UnboundedReceiver<RetryFired>,
    /// Queue toward the hub.
    outbound: mpsc::Sender<ClientMessage>,
    events: mpsc::UnboundedSender<MeshEvent>,
    cancel_token: CancellationToken,
    links: HashMap<String, LinkEntry>,
    next_generation: u64,
    roster: Vec<UserEntry>,
    remote_audio: HashMap<String, bool>,
    remote_video: HashMap<String, bool>,
    supervisor: Supervisor,
    media: MediaSynchronizer,
}

impl MeshController {
    /// Spawn the controller for the participant `local_id`.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        local_id: String,
        config: MeshConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        capture: Arc<dyn MediaCapture>,
        outbound: mpsc::Sender<ClientMessage>,
        events: mpsc::UnboundedSender<MeshEvent>,
        cancel_token: CancellationToken,
    ) -> (MeshHandle, JoinHandle<()>) {
        let (controller, handle) = Self::new(
            local_id,
            config,
            factory,
            capture,
            outbound,
            events,
            cancel_token,
        );
        let task_handle = tokio::spawn(controller.run());
        (handle, task_handle)
    }

    fn new(
        local_id: String,
        config: MeshConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        capture: Arc<dyn MediaCapture>,
        outbound: mpsc::Sender<ClientMessage>,
        events: mpsc::UnboundedSender<MeshEvent>,
        cancel_token: CancellationToken,
    ) -> (Self, MeshHandle) {
        let (sender, receiver) = mpsc::channel(config.command_buffer.max(1));
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let (fired_tx, retries) = mpsc::unbounded_channel();

        let supervisor = Supervisor::new(
            config.retry_policy.clone(),
            cancel_token.clone(),
            fired_tx,
        );

        let controller = Self {
            local_id,
            config,
            factory,
            receiver,
            reports_tx,
            reports,
            retries,
            outbound,
            events,
            cancel_token: cancel_token.clone(),
            links: HashMap::new(),
            next_generation: 0,
            roster: Vec::new(),
            remote_audio: HashMap::new(),
            remote_video: HashMap::new(),
            supervisor,
            media: MediaSynchronizer::new(capture),
        };

        (
            controller,
            MeshHandle {
                sender,
                cancel_token,
            },
        )
    }

    #[instrument(skip_all, name = "mesh.controller", fields(local_id = %self.local_id))]
    async fn run(mut self) {
        info!(
            target: "mesh.controller",
            local_id = %self.local_id,
            "MeshController started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "mesh.controller",
                        "MeshController received cancellation signal"
                    );
                    self.close_everything().await;
                    break;
                }

                command = self.receiver.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command).await {
                                break;
                            }
                        }
                        None => {
                            debug!(
                                target: "mesh.controller",
                                "MeshController channel closed, exiting"
                            );
                            self.close_everything().await;
                            break;
                        }
                    }
                }

                Some(report) = self.reports.recv() => {
                    self.handle_report(report).await;
                }

                Some(fired) = self.retries.recv() => {
                    self.handle_retry(fired).await;
                }
            }
        }

        info!(
            target: "mesh.controller",
            local_id = %self.local_id,
            "MeshController stopped"
        );
    }

    /// Handle a single command. Returns true if the controller should exit.
    async fn handle_command(&mut self, command: MeshCommand) -> bool {
        match command {
            MeshCommand::Inbound(message) => {
                self.handle_server_message(message).await;
                false
            }
            MeshCommand::SetMedia {
                kind,
                enabled,
                respond_to,
            } => {
                let links = self.live_links();
                let result = if enabled {
                    self.media.enable(kind, &links, &self.outbound).await
                } else {
                    self.media.disable(kind, &links, &self.outbound).await
                };
                let _ = respond_to.send(result);
                false
            }
            MeshCommand::Chat { text, respond_to } => {
                let _ = respond_to.send(self.send_to_hub(ClientMessage::Chat { text }).await);
                false
            }
            MeshCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
                false
            }
            MeshCommand::Leave { respond_to } => {
                self.leave().await;
                let _ = respond_to.send(());
                true
            }
            MeshCommand::HubClosed => {
                warn!(target: "mesh.controller", "Hub connection lost");
                self.close_everything().await;
                self.emit(MeshEvent::HubDisconnected);
                true
            }
        }
    }

    async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::UserList { users } => self.handle_user_list(users).await,
            ServerMessage::Offer {
                sender_user_id,
                payload,
                ..
            } => self.handle_offer(sender_user_id, payload).await,
            ServerMessage::Answer {
                sender_user_id,
                payload,
                ..
            } => {
                if let Some(link) = self.link_for(&sender_user_id, "answer") {
                    if let Err(e) = link.remote_answer(payload).await {
                        debug!(target: "mesh.controller", error = %e, "Answer not delivered");
                    }
                }
            }
            ServerMessage::IceCandidate {
                sender_user_id,
                payload,
                ..
            } => {
                if let Some(link) = self.link_for(&sender_user_id, "ice_candidate") {
                    if let Err(e) = link.remote_candidate(payload).await {
                        debug!(target: "mesh.controller", error = %e, "Candidate not delivered");
                    }
                }
            }
            ServerMessage::AudioStates { states } => self.handle_media_states(
                MediaKind::Audio,
                states
                    .into_iter()
                    .map(|s| (s.user_id, s.is_audio_enabled))
                    .collect(),
            ),
            ServerMessage::VideoStates { states } => self.handle_media_states(
                MediaKind::Video,
                states
                    .into_iter()
                    .map(|s| (s.user_id, s.is_video_enabled))
                    .collect(),
            ),
            ServerMessage::Chat {
                user_id,
                username,
                text,
                timestamp,
            } => self.emit(MeshEvent::Chat {
                user_id,
                username,
                text,
                timestamp,
            }),
            ServerMessage::System { message, timestamp } => {
                self.emit(MeshEvent::System { message, timestamp });
            }
            ServerMessage::Error { code, message } => {
                warn!(
                    target: "mesh.controller",
                    code = code.as_str(),
                    message = %message,
                    "Hub reported an error"
                );
                self.emit(MeshEvent::HubError { code, message });
            }
            ServerMessage::UsernameAccepted { .. } => {
                debug!(target: "mesh.controller", "Ignoring repeated username_accepted");
            }
        }
    }

    async fn handle_user_list(&mut self, users: Vec<UserEntry>) {
        let listed: HashSet<String> = users
            .iter()
            .map(|user| user.user_id.clone())
            .filter(|id| id != &self.local_id)
            .collect();

        self.roster = users;
        self.emit(MeshEvent::MembershipChanged {
            users: self.roster.clone(),
        });

        let departed: Vec<(String, LinkEntry)> = {
            let ids: Vec<String> = self
                .links
                .keys()
                .filter(|id| !listed.contains(*id))
                .cloned()
                .collect();
            ids.into_iter()
                .filter_map(|id| self.links.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        let close_timeout = self.config.link_close_timeout;
        join_all(
            departed
                .iter()
                .map(|(_, entry)| entry.handle.close(close_timeout)),
        )
        .await;

        for (remote_id, _) in departed {
            info!(
                target: "mesh.controller",
                remote_id = %remote_id,
                "Peer departed, link closed"
            );
            self.emit(MeshEvent::LinkClosed { remote_id });
        }

        self.supervisor.retain(&listed);
        self.remote_audio.retain(|id, _| listed.contains(id));
        self.remote_video.retain(|id, _| listed.contains(id));

        let needed: Vec<String> = self
            .roster
            .iter()
            .map(|user| user.user_id.clone())
            .filter(|id| listed.contains(id) && !self.links.contains_key(id))
            .collect();

        for remote_id in needed {
            if self.supervisor.has_pending(&remote_id) {
                continue;
            }
            if self.supervisor.clear_exhausted(&remote_id) {
                info!(
                    target: "mesh.controller",
                    remote_id = %remote_id,
                    "Recreating link to previously unreachable peer"
                );
            }
            self.create_link(&remote_id).await;
        }
    }

    async fn handle_offer(
        &mut self,
        sender_user_id: String,
        offer: SessionDescription,
    ) {
        if !self.links.contains_key(&sender_user_id)
            && self.is_rostered(&sender_user_id)
            && self.supervisor.take_pending(&sender_user_id)
        {
            info!(
                target: "mesh.controller",
                remote_id = %sender_user_id,
                "Offer from peer awaiting retry, creating link now"
            );
            self.create_link(&sender_user_id).await;
        }

        if let Some(link) = self.link_for(&sender_user_id, "offer") {
            if let Err(e) = link.remote_offer(offer).await {
                debug!(target: "mesh.controller", error = %e, "Offer not delivered");
            }
        }
    }

    fn handle_media_states(&mut self, kind: MediaKind, states: Vec<(String, bool)>) {
        let states: HashMap<String, bool> = states
            .into_iter()
            .filter(|(id, _)| id != &self.local_id)
            .collect();

        match kind {
            MediaKind::Audio => self.remote_audio.clone_from(&states),
            MediaKind::Video => self.remote_video.clone_from(&states),
        }

        self.emit(MeshEvent::MediaStatesChanged { kind, states });
    }

    async fn handle_report(&mut self, report: LinkReport) {
        let current = self
            .links
            .get(&report.remote_id)
            .is_some_and(|entry| entry.handle.generation() == report.generation);

        if !current {
            debug!(
                target: "mesh.controller",
                remote_id = %report.remote_id,
                generation = report.generation,
                "Discarding report from superseded link"
            );
            return;
        }

        let remote_id = report.remote_id;
        match report.kind {
            LinkReportKind::State(state) => {
                if let Some(entry) = self.links.get_mut(&remote_id) {
                    entry.state = state;
                }
                if state == LinkState::Connected {
                    self.supervisor.on_connected(&remote_id);
                }
                self.emit(MeshEvent::LinkStateChanged { remote_id, state });
            }
            LinkReportKind::RemoteTrack(track) => {
                self.emit(MeshEvent::RemoteTrack { remote_id, track });
            }
            LinkReportKind::Failed { reason } => {
                self.links.remove(&remote_id);
                debug!(
                    target: "mesh.controller",
                    remote_id = %remote_id,
                    reason = %reason,
                    "Link failed"
                );
                self.on_link_failed(&remote_id);
            }
            LinkReportKind::Closed => {
                self.links.remove(&remote_id);
                self.emit(MeshEvent::LinkClosed { remote_id });
            }
        }
    }

    async fn handle_retry(&mut self, fired: RetryFired) {
        if !self.supervisor.accept(&fired) {
            debug!(
                target: "mesh.controller",
                remote_id = %fired.remote_id,
                "Ignoring cancelled retry"
            );
            return;
        }

        if !self.is_rostered(&fired.remote_id) || self.links.contains_key(&fired.remote_id) {
            return;
        }

        info!(
            target: "mesh.controller",
            remote_id = %fired.remote_id,
            attempt = fired.attempt,
            "Retrying link"
        );
        self.create_link(&fired.remote_id).await;
    }

    /// Spawn a fresh link generation toward `remote_id`.
    async fn create_link(&mut self, remote_id: &str) {
        if let Some(previous) = self.links.remove(remote_id) {
            previous.handle.close(self.config.link_close_timeout).await;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let role = LinkRole::for_pair(&self.local_id, remote_id);

        let params = LinkParams {
            remote_id: remote_id.to_string(),
            generation,
            role,
            establishment_timeout: self.config.establishment_timeout,
            command_buffer: self.config.command_buffer,
            outbound: self.outbound.clone(),
            reports: self.reports_tx.clone(),
            cancel_token: self.cancel_token.child_token(),
        };

        match LinkActor::spawn(params, self.factory.as_ref(), self.media.tracks()).await {
            Ok((handle, _task)) => {
                debug!(
                    target: "mesh.controller",
                    remote_id = %remote_id,
                    generation = generation,
                    role = ?role,
                    "Link created"
                );
                self.links.insert(
                    remote_id.to_string(),
                    LinkEntry {
                        handle,
                        state: LinkState::New,
                    },
                );
            }
            Err(e) => {
                warn!(
                    target: "mesh.controller",
                    remote_id = %remote_id,
                    error = %e,
                    "Transport creation failed"
                );
                self.on_link_failed(remote_id);
            }
        }
    }

    fn on_link_failed(&mut self, remote_id: &str) {
        self.emit(MeshEvent::LinkStateChanged {
            remote_id: remote_id.to_string(),
            state: LinkState::Failed,
        });

        match self.supervisor.on_failed(remote_id) {
            FailureOutcome::Exhausted => self.emit(MeshEvent::PeerUnreachable {
                remote_id: remote_id.to_string(),
            }),
            FailureOutcome::Scheduled { .. } | FailureOutcome::Suppressed => {}
        }
    }

    async fn leave(&mut self) {
        info!(target: "mesh.controller", local_id = %self.local_id, "Leaving room");

        self.close_everything().await;

        if let Err(e) = self.send_to_hub(ClientMessage::Leave).await {
            debug!(target: "mesh.controller", error = %e, "Leave not sent");
        }
        self.emit(MeshEvent::Left);
    }

    /// Cancel retries, close every link, then release capture.
    async fn close_everything(&mut self) {
        self.supervisor.cancel_all();

        let links: Vec<(String, LinkEntry)> = self.links.drain().collect();
        let close_timeout = self.config.link_close_timeout;
        join_all(links.iter().map(|(_, entry)| entry.handle.close(close_timeout))).await;

        for (remote_id, _) in links {
            self.emit(MeshEvent::LinkClosed { remote_id });
        }

        self.media.release_all().await;
    }

    fn snapshot(&self) -> MeshSnapshot {
        let mut links: Vec<LinkSnapshot> = self
            .links
            .iter()
            .map(|(remote_id, entry)| LinkSnapshot {
                remote_id: remote_id.clone(),
                generation: entry.handle.generation(),
                role: entry.handle.role(),
                state: entry.state,
            })
            .collect();
        links.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));

        let remote_ids = self
            .roster
            .iter()
            .map(|user| user.user_id.as_str())
            .filter(|id| *id != self.local_id);
        let retry_attempts = remote_ids
            .clone()
            .map(|id| (id.to_string(), self.supervisor.attempts(id)))
            .filter(|(_, attempts)| *attempts > 0)
            .collect();
        let unreachable = remote_ids
            .filter(|id| self.supervisor.is_exhausted(id))
            .map(str::to_string)
            .collect();

        MeshSnapshot {
            local_id: self.local_id.clone(),
            links,
            roster: self.roster.clone(),
            remote_audio: self.remote_audio.clone(),
            remote_video: self.remote_video.clone(),
            local_audio: self.media.is_enabled(MediaKind::Audio),
            local_video: self.media.is_enabled(MediaKind::Video),
            retry_attempts,
            unreachable,
        }
    }

    fn live_links(&self) -> Vec<LinkHandle> {
        self.links.values().map(|entry| entry.handle.clone()).collect()
    }

    fn link_for(&self, remote_id: &str, message_type: &'static str) -> Option<LinkHandle> {
        let link = self.links.get(remote_id).map(|entry| entry.handle.clone());
        if link.is_none() {
            debug!(
                target: "mesh.controller",
                remote_id = %remote_id,
                message_type = message_type,
                "No link for sender, dropping"
            );
        }
        link
    }

    fn is_rostered(&self, remote_id: &str) -> bool {
        remote_id != self.local_id && self.roster.iter().any(|user| user.user_id == remote_id)
    }

    async fn send_to_hub(&self, message: ClientMessage) -> Result<(), MeshError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| MeshError::HubClosed)
    }

    fn emit(&self, event: MeshEvent) {
        // The application may have dropped its receiver.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::supervisor::RetryPolicy;
    use crate::testing::{MockMediaCapture, MockPeerConnectionFactory};
    use crate::transport::{TransportEvent, TransportState};
    use signaling_protocol::AudioState;
    use std::time::Duration;

    /// Local id sits between the two remotes: it answers "aaa" and offers
    /// to "ccc".
    const LOCAL: &str = "bbb";

    struct Harness {
        handle: MeshHandle,
        task: JoinHandle<()>,
        factory: MockPeerConnectionFactory,
        capture: MockMediaCapture,
        outbound: mpsc::Receiver<ClientMessage>,
        events: mpsc::UnboundedReceiver<MeshEvent>,
    }

    impl Harness {
        fn spawn(config: MeshConfig) -> Self {
            Self::spawn_with_factory(config, MockPeerConnectionFactory::new())
        }

        fn spawn_with_factory(config: MeshConfig, factory: MockPeerConnectionFactory) -> Self {
            let capture = MockMediaCapture::new();
            let (outbound_tx, outbound) = mpsc::channel(64);
            let (events_tx, events) = mpsc::unbounded_channel();

            let (handle, task) = MeshController::spawn(
                LOCAL.to_string(),
                config,
                Arc::new(factory.clone()),
                Arc::new(capture.clone()),
                outbound_tx,
                events_tx,
                CancellationToken::new(),
            );

            Self {
                handle,
                task,
                factory,
                capture,
                outbound,
                events,
            }
        }

        async fn roster(&self, ids: &[&str]) {
            let users = ids
                .iter()
                .map(|id| UserEntry {
                    user_id: (*id).to_string(),
                    username: format!("user-{id}"),
                })
                .collect();
            self.handle
                .inbound(ServerMessage::UserList { users })
                .await
                .unwrap();
        }

        async fn wait_for(&mut self, predicate: impl Fn(&MeshEvent) -> bool) -> MeshEvent {
            loop {
                let event = self.events.recv().await.expect("event channel closed");
                if predicate(&event) {
                    return event;
                }
            }
        }

        async fn wait_for_state(&mut self, remote: &str, expected: LinkState) {
            self.wait_for(|event| {
                matches!(
                    event,
                    MeshEvent::LinkStateChanged { remote_id, state }
                        if remote_id == remote && *state == expected
                )
            })
            .await;
        }

        fn drain_events(&mut self) -> Vec<MeshEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        fn drain_outbound(&mut self) -> Vec<ClientMessage> {
            let mut messages = Vec::new();
            while let Ok(message) = self.outbound.try_recv() {
                messages.push(message);
            }
            messages
        }
    }

    fn offer_from(sender: &str, sdp: &str) -> ServerMessage {
        ServerMessage::Offer {
            sender_user_id: sender.to_string(),
            sender_username: format!("user-{sender}"),
            payload: SessionDescription::offer(sdp),
        }
    }

    fn fail_transport(factory: &MockPeerConnectionFactory, remote_id: &str) {
        factory
            .latest(remote_id)
            .unwrap()
            .emit(TransportEvent::StateChanged(TransportState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_list_creates_links_with_roles() {
        let mut mesh = Harness::spawn(MeshConfig::default());

        mesh.roster(&["aaa", LOCAL, "ccc"]).await;
        mesh.wait_for_state("ccc", LinkState::Negotiating).await;

        let snapshot = mesh.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.links.len(), 2);
        assert_eq!(snapshot.link("aaa").unwrap().role, LinkRole::Responder);
        assert_eq!(snapshot.link("ccc").unwrap().role, LinkRole::Initiator);
        assert!(snapshot.link(LOCAL).is_none());
        assert_eq!(snapshot.roster.len(), 3);

        // Only the initiator side offers.
        let offers: Vec<_> = mesh
            .drain_outbound()
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::Offer { target_user_id, .. } => Some(target_user_id),
                _ => None,
            })
            .collect();
        assert_eq!(offers, vec!["ccc".to_string()]);
        assert_eq!(mesh.factory.created_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_user_list_keeps_existing_links() {
        let mut mesh = Harness::spawn(MeshConfig::default());

        mesh.roster(&["aaa", LOCAL]).await;
        mesh.roster(&["aaa", LOCAL]).await;
        mesh.wait_for_state("aaa", LinkState::AwaitingOffer).await;

        let snapshot = mesh.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.link("aaa").unwrap().generation, 1);
        assert_eq!(mesh.factory.created_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_departed_peer_link_closed() {
        let mut mesh = Harness::spawn(MeshConfig::default());

        mesh.roster(&["aaa", LOCAL, "ccc"]).await;
        mesh.wait_for_state("aaa", LinkState::AwaitingOffer).await;

        mesh.roster(&[LOCAL, "ccc"]).await;
        let closed = mesh
            .wait_for(|e| matches!(e, MeshEvent::LinkClosed { .. }))
            .await;
        assert_eq!(
            closed,
            MeshEvent::LinkClosed {
                remote_id: "aaa".to_string()
            }
        );

        assert!(mesh.factory.latest("aaa").unwrap().is_closed());
        let snapshot = mesh.handle.snapshot().await.unwrap();
        assert!(snapshot.link("aaa").is_none());
        assert!(snapshot.link("ccc").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_link_retried_with_new_generation() {
        let mut mesh = Harness::spawn(MeshConfig::default());

        mesh.roster(&[LOCAL, "ccc"]).await;
        mesh.wait_for_state("ccc", LinkState::Negotiating).await;

        fail_transport(&mesh.factory, "ccc");
        mesh.wait_for_state("ccc", LinkState::Failed).await;
        assert!(mesh.factory.latest("ccc").unwrap().is_closed());

        let started = tokio::time::Instant::now();
        mesh.wait_for_state("ccc", LinkState::Negotiating).await;
        assert!(started.elapsed() >= Duration::from_secs(1));

        let snapshot = mesh.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.link("ccc").unwrap().generation, 2);
        assert_eq!(snapshot.retry_attempts.get("ccc"), Some(&1));
        assert_eq!(mesh.factory.connections_to("ccc").len(), 2);

        mesh.factory.latest("ccc").unwrap().connect();
        mesh.wait_for_state("ccc", LinkState::Connected).await;
        let snapshot = mesh.handle.snapshot().await.unwrap();
        assert!(snapshot.retry_attempts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_emits_one_unreachable_until_relisted() {
        let config = MeshConfig::default().with_retry_policy(RetryPolicy {
            max_retries: 1,
            ..RetryPolicy::default()
        });
        let mut mesh = Harness::spawn(config);

        mesh.roster(&[LOCAL, "ccc"]).await;

        // No answers arrive, so each generation times out.
        mesh.wait_for(|e| matches!(e, MeshEvent::PeerUnreachable { .. }))
            .await;
        assert_eq!(mesh.factory.connections_to("ccc").len(), 2);
        let snapshot = mesh.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.unreachable, vec!["ccc".to_string()]);
        assert!(snapshot.link("ccc").is_none());

        tokio::time::sleep(Duration::from_secs(120)).await;
        let later = mesh.drain_events();
        assert!(!later
            .iter()
            .any(|e| matches!(e, MeshEvent::PeerUnreachable { .. })));
        assert_eq!(mesh.factory.connections_to("ccc").len(), 2);

        // The next roster listing the peer recreates the link.
        mesh.roster(&[LOCAL, "ccc"]).await;
        mesh.wait_for_state("ccc", LinkState::Negotiating).await;
        assert_eq!(mesh.factory.connections_to("ccc").len(), 3);
        assert!(mesh.handle.snapshot().await.unwrap().unreachable.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offer_during_retry_backoff_creates_link_immediately() {
        let config = MeshConfig::default().with_retry_policy(RetryPolicy {
            initial_delay: Duration::from_secs(60),
            ..RetryPolicy::default()
        });
        let mut mesh = Harness::spawn(config);

        mesh.roster(&["aaa", LOCAL]).await;
        mesh.wait_for_state("aaa", LinkState::AwaitingOffer).await;
        fail_transport(&mesh.factory, "aaa");
        mesh.wait_for_state("aaa", LinkState::Failed).await;

        let started = tokio::time::Instant::now();
        mesh.handle.inbound(offer_from("aaa", "fresh")).await.unwrap();

        mesh.wait_for_state("aaa", LinkState::Negotiating).await;
        assert!(started.elapsed() < Duration::from_secs(60));
        assert!(mesh
            .drain_outbound()
            .iter()
            .any(|m| matches!(m, ClientMessage::Answer { target_user_id, .. } if target_user_id == "aaa")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_departure_cancels_pending_retry() {
        let mut mesh = Harness::spawn(MeshConfig::default());

        mesh.roster(&["aaa", LOCAL]).await;
        mesh.wait_for_state("aaa", LinkState::AwaitingOffer).await;
        fail_transport(&mesh.factory, "aaa");
        mesh.wait_for_state("aaa", LinkState::Failed).await;

        mesh.roster(&[LOCAL]).await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(mesh.factory.connections_to("aaa").len(), 1);
        assert!(mesh.handle.snapshot().await.unwrap().links.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_signaling_from_unknown_sender_dropped() {
        let mut mesh = Harness::spawn(MeshConfig::default());

        mesh.roster(&[LOCAL]).await;
        mesh.handle.inbound(offer_from("zzz", "stray")).await.unwrap();

        let snapshot = mesh.handle.snapshot().await.unwrap();
        assert!(snapshot.links.is_empty());
        assert_eq!(mesh.factory.created_count(), 0);
        assert!(mesh.drain_outbound().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_report_discarded() {
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (outbound_tx, _outbound) = mpsc::channel(64);
        let (mut controller, _handle) = MeshController::new(
            LOCAL.to_string(),
            MeshConfig::default(),
            Arc::new(MockPeerConnectionFactory::new()),
            Arc::new(MockMediaCapture::new()),
            outbound_tx,
            events_tx,
            CancellationToken::new(),
        );

        controller
            .handle_user_list(vec![UserEntry {
                user_id: "aaa".to_string(),
                username: "alice".to_string(),
            }])
            .await;
        while events.try_recv().is_ok() {}

        controller
            .handle_report(LinkReport {
                remote_id: "aaa".to_string(),
                generation: 0,
                kind: LinkReportKind::Failed {
                    reason: "late".to_string(),
                },
            })
            .await;

        assert!(events.try_recv().is_err());
        assert!(controller.links.contains_key("aaa"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_states_exclude_self() {
        let mut mesh = Harness::spawn(MeshConfig::default());

        mesh.handle
            .inbound(ServerMessage::AudioStates {
                states: vec![
                    AudioState {
                        user_id: LOCAL.to_string(),
                        is_audio_enabled: true,
                    },
                    AudioState {
                        user_id: "aaa".to_string(),
                        is_audio_enabled: true,
                    },
                ],
            })
            .await
            .unwrap();

        let event = mesh
            .wait_for(|e| matches!(e, MeshEvent::MediaStatesChanged { .. }))
            .await;
        assert_eq!(
            event,
            MeshEvent::MediaStatesChanged {
                kind: MediaKind::Audio,
                states: HashMap::from([("aaa".to_string(), true)]),
            }
        );

        let snapshot = mesh.handle.snapshot().await.unwrap();
        assert_eq!(snapshot.remote_audio.get("aaa"), Some(&true));
        assert!(snapshot.remote_video.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hub_notices_surface_as_events() {
        let mut mesh = Harness::spawn(MeshConfig::default());

        mesh.handle
            .inbound(ServerMessage::error(ErrorCode::NotJoined, "join first"))
            .await
            .unwrap();
        mesh.handle
            .inbound(ServerMessage::system("aaa joined the room"))
            .await
            .unwrap();

        assert!(matches!(
            mesh.events.recv().await,
            Some(MeshEvent::HubError {
                code: ErrorCode::NotJoined,
                ..
            })
        ));
        assert!(matches!(
            mesh.events.recv().await,
            Some(MeshEvent::System { message, .. }) if message == "aaa joined the room"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_reaches_links_then_hub() {
        let mut mesh = Harness::spawn(MeshConfig::default());

        mesh.roster(&["aaa", LOCAL]).await;
        mesh.wait_for_state("aaa", LinkState::AwaitingOffer).await;

        mesh.handle.enable(MediaKind::Audio).await.unwrap();

        let connection = mesh.factory.latest("aaa").unwrap();
        assert!(connection.tracks().get(MediaKind::Audio).is_some());
        assert_eq!(
            mesh.drain_outbound().last(),
            Some(&ClientMessage::AudioEnabled)
        );
        assert!(mesh.handle.snapshot().await.unwrap().local_audio);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_links_start_with_held_tracks() {
        let mut mesh = Harness::spawn(MeshConfig::default());

        mesh.handle.enable(MediaKind::Video).await.unwrap();
        mesh.roster(&["aaa", LOCAL]).await;
        mesh.wait_for_state("aaa", LinkState::AwaitingOffer).await;

        let connection = mesh.factory.latest("aaa").unwrap();
        assert!(connection.initial_tracks().get(MediaKind::Video).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_closes_links_releases_capture_then_sends_leave() {
        let mut mesh = Harness::spawn(MeshConfig::default());

        mesh.roster(&["aaa", LOCAL, "ccc"]).await;
        mesh.wait_for_state("aaa", LinkState::AwaitingOffer).await;
        mesh.handle.enable(MediaKind::Audio).await.unwrap();
        mesh.drain_outbound();

        mesh.handle.leave().await.unwrap();
        (&mut mesh.task).await.unwrap();

        for remote_id in ["aaa", "ccc"] {
            assert!(mesh.factory.latest(remote_id).unwrap().is_closed());
        }
        assert!(!mesh.capture.is_held(MediaKind::Audio));
        assert_eq!(mesh.drain_outbound(), vec![ClientMessage::Leave]);
        assert_eq!(mesh.drain_events().last(), Some(&MeshEvent::Left));

        assert!(matches!(
            mesh.handle.snapshot().await,
            Err(MeshError::Stopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hub_closed_shuts_down_without_leave() {
        let mut mesh = Harness::spawn(MeshConfig::default());

        mesh.roster(&["aaa", LOCAL]).await;
        mesh.wait_for_state("aaa", LinkState::AwaitingOffer).await;
        mesh.drain_outbound();

        mesh.handle.hub_closed().await.unwrap();
        (&mut mesh.task).await.unwrap();

        assert!(mesh.factory.latest("aaa").unwrap().is_closed());
        assert!(mesh.drain_outbound().is_empty());
        assert_eq!(
            mesh.drain_events().last(),
            Some(&MeshEvent::HubDisconnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_closes_links() {
        let mut mesh = Harness::spawn(MeshConfig::default());

        mesh.roster(&["aaa", LOCAL]).await;
        mesh.wait_for_state("aaa", LinkState::AwaitingOffer).await;

        mesh.handle.cancel();
        (&mut mesh.task).await.unwrap();

        assert!(mesh.factory.latest("aaa").unwrap().is_closed());
        assert!(mesh.handle.is_cancelled());
    }
}

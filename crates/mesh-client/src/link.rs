//! `LinkActor` - negotiation state machine for one remote peer.
//!
//! Each `LinkActor`:
//! - Owns one platform [`PeerConnection`] and its [`LinkState`]
//! - Exchanges offers, answers and candidates with the remote peer through
//!   the hub's outbound queue
//! - Reports state changes, remote tracks and its terminal outcome to the
//!   mesh controller, tagged with its generation
//!
//! The controller replaces a failed link with a fresh actor and a higher
//! generation, so a report from a superseded actor is recognisable and
//! dropped.
//!
//! # Lifecycle
//!
//! 1. Spawned by the controller when a rostered peer needs a link
//! 2. Initiator offers, responder waits for the offer
//! 3. Runs until closed by the controller, cancelled, timed out, or failed
//!    by its transport
//! 4. Closes the transport before reporting its terminal state

use crate::errors::MeshError;
use crate::transport::{
    LocalTrack, PeerConnection, PeerConnectionFactory, RemoteTrack, TrackSet, TransportEvent,
    TransportState,
};

use signaling_protocol::{ClientMessage, IceCandidate, LinkRole, MediaKind, SessionDescription};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Negotiation state of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    New,
    /// Initiator is creating and sending its offer.
    Offering,
    /// Responder is waiting for the initiator's offer.
    AwaitingOffer,
    /// Descriptions exchanged, transport not yet connected.
    Negotiating,
    Connected,
    /// Connected, with a local re-offer outstanding.
    Renegotiating,
    Failed,
    Closed,
}

impl LinkState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LinkState::New => "new",
            LinkState::Offering => "offering",
            LinkState::AwaitingOffer => "awaiting_offer",
            LinkState::Negotiating => "negotiating",
            LinkState::Connected => "connected",
            LinkState::Renegotiating => "renegotiating",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }

    /// Whether `next` is a legal successor of this state.
    #[must_use]
    pub const fn can_transition_to(&self, next: LinkState) -> bool {
        matches!(
            (self, next),
            (
                LinkState::New,
                LinkState::Offering | LinkState::AwaitingOffer
            ) | (
                LinkState::Offering | LinkState::AwaitingOffer,
                LinkState::Negotiating
            ) | (
                LinkState::Negotiating | LinkState::Renegotiating,
                LinkState::Connected
            ) | (LinkState::Connected, LinkState::Renegotiating)
                | (
                    LinkState::New
                        | LinkState::Offering
                        | LinkState::AwaitingOffer
                        | LinkState::Negotiating
                        | LinkState::Connected
                        | LinkState::Renegotiating,
                    LinkState::Failed | LinkState::Closed
                )
                | (LinkState::Failed, LinkState::Closed)
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a link reports to the mesh controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkReportKind {
    State(LinkState),
    RemoteTrack(RemoteTrack),
    /// Terminal failure. The transport is already closed.
    Failed { reason: String },
    /// Terminal close. The transport is already closed.
    Closed,
}

/// A report from one link generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkReport {
    pub remote_id: String,
    pub generation: u64,
    pub kind: LinkReportKind,
}

/// Messages handled by a `LinkActor`.
#[derive(Debug)]
enum LinkCommand {
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    SetTrack {
        kind: MediaKind,
        track: Option<LocalTrack>,
        respond_to: oneshot::Sender<Result<(), MeshError>>,
    },
    Close {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to a `LinkActor`.
#[derive(Clone, Debug)]
pub struct LinkHandle {
    remote_id: String,
    generation: u64,
    role: LinkRole,
    sender: mpsc::Sender<LinkCommand>,
    cancel_token: CancellationToken,
}

impl LinkHandle {
    #[must_use]
    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn role(&self) -> LinkRole {
        self.role
    }

    /// Forward an offer from the remote peer.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Stopped` if the actor has exited.
    pub async fn remote_offer(&self, description: SessionDescription) -> Result<(), MeshError> {
        self.command(LinkCommand::RemoteOffer(description)).await
    }

    /// Forward an answer from the remote peer.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Stopped` if the actor has exited.
    pub async fn remote_answer(&self, description: SessionDescription) -> Result<(), MeshError> {
        self.command(LinkCommand::RemoteAnswer(description)).await
    }

    /// Forward a candidate from the remote peer.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Stopped` if the actor has exited.
    pub async fn remote_candidate(&self, candidate: IceCandidate) -> Result<(), MeshError> {
        self.command(LinkCommand::RemoteCandidate(candidate)).await
    }

    /// Attach or detach a local track and wait until the transport has it.
    ///
    /// # Errors
    ///
    /// Returns the transport's error, or `MeshError::Stopped` if the actor
    /// has exited.
    pub async fn set_track(
        &self,
        kind: MediaKind,
        track: Option<LocalTrack>,
    ) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.command(LinkCommand::SetTrack {
            kind,
            track,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| MeshError::Stopped)?
    }

    /// Close the link and wait, up to `timeout`, for its transport to be
    /// released. Falls back to cancellation.
    pub async fn close(&self, timeout: Duration) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(LinkCommand::Close { respond_to: tx })
            .await
            .is_ok()
            && tokio::time::timeout(timeout, rx).await.is_err()
        {
            warn!(
                target: "mesh.link",
                remote_id = %self.remote_id,
                generation = self.generation,
                "Link close timed out"
            );
        }
        self.cancel_token.cancel();
    }

    async fn command(&self, command: LinkCommand) -> Result<(), MeshError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| MeshError::Stopped)
    }
}

/// Everything a link needs besides its transport.
#[derive(Debug, Clone)]
pub struct LinkParams {
    pub remote_id: String,
    pub generation: u64,
    pub role: LinkRole,
    pub establishment_timeout: Duration,
    pub command_buffer: usize,
    /// Queue toward the hub.
    pub outbound: mpsc::Sender<ClientMessage>,
    pub reports: mpsc::UnboundedSender<LinkReport>,
    pub cancel_token: CancellationToken,
}

/// How the actor loop ended.
enum LinkExit {
    Closed(Option<oneshot::Sender<()>>),
    Failed(String),
}

/// The `LinkActor` implementation.
pub struct LinkActor {
    remote_id: String,
    generation: u64,
    role: LinkRole,
    state: LinkState,
    connection: Arc<dyn PeerConnection>,
    receiver: mpsc::Receiver<LinkCommand>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    events_open: bool,
    outbound: mpsc::Sender<ClientMessage>,
    reports: mpsc::UnboundedSender<LinkReport>,
    cancel_token: CancellationToken,
    timeout: Duration,
    /// Armed while establishing or renegotiating.
    deadline: Option<Instant>,
    has_local_description: bool,
    has_remote_description: bool,
    awaiting_answer: bool,
    /// Remote candidates that arrived before a remote description.
    pending_remote_candidates: Vec<IceCandidate>,
    /// Local candidates gathered before a local description.
    pending_local_candidates: Vec<IceCandidate>,
    renegotiation_pending: bool,
}

impl LinkActor {
    /// Create a transport through `factory` and spawn a link over it.
    ///
    /// # Errors
    ///
    /// Returns the factory's error; no actor is spawned in that case.
    pub async fn spawn(
        params: LinkParams,
        factory: &dyn PeerConnectionFactory,
        tracks: &TrackSet,
    ) -> Result<(LinkHandle, JoinHandle<()>), MeshError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = factory.create(&params.remote_id, events_tx, tracks).await?;
        Ok(Self::spawn_with_connection(params, connection, events_rx))
    }

    /// Spawn a link over an existing transport.
    pub fn spawn_with_connection(
        params: LinkParams,
        connection: Arc<dyn PeerConnection>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (LinkHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(params.command_buffer.max(1));

        let handle = LinkHandle {
            remote_id: params.remote_id.clone(),
            generation: params.generation,
            role: params.role,
            sender,
            cancel_token: params.cancel_token.clone(),
        };

        let actor = Self {
            remote_id: params.remote_id,
            generation: params.generation,
            role: params.role,
            state: LinkState::New,
            connection,
            receiver,
            events,
            events_open: true,
            outbound: params.outbound,
            reports: params.reports,
            cancel_token: params.cancel_token,
            timeout: params.establishment_timeout,
            deadline: None,
            has_local_description: false,
            has_remote_description: false,
            awaiting_answer: false,
            pending_remote_candidates: Vec::new(),
            pending_local_candidates: Vec::new(),
            renegotiation_pending: false,
        };

        let task_handle = tokio::spawn(actor.run());
        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "mesh.link",
        fields(remote_id = %self.remote_id, generation = self.generation)
    )]
    async fn run(mut self) {
        debug!(
            target: "mesh.link",
            remote_id = %self.remote_id,
            role = ?self.role,
            "LinkActor started"
        );

        self.deadline = Some(Instant::now() + self.timeout);

        let exit = match self.start().await {
            Ok(()) => self.event_loop().await,
            Err(e) => LinkExit::Failed(e.to_string()),
        };

        self.finish(exit).await;
    }

    async fn start(&mut self) -> Result<(), MeshError> {
        if self.role.is_initiator() {
            self.transition(LinkState::Offering)?;
            self.send_offer().await?;
            self.transition(LinkState::Negotiating)
        } else {
            self.transition(LinkState::AwaitingOffer)
        }
    }

    async fn event_loop(&mut self) -> LinkExit {
        loop {
            let deadline = self.deadline;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    return LinkExit::Closed(None);
                }

                () = wait_until(deadline) => {
                    let what = if self.state == LinkState::Renegotiating {
                        "renegotiation"
                    } else {
                        "establishment"
                    };
                    return LinkExit::Failed(format!("{what} timed out"));
                }

                command = self.receiver.recv() => {
                    match command {
                        Some(command) => {
                            if let Some(exit) = self.handle_command(command).await {
                                return exit;
                            }
                        }
                        None => return LinkExit::Closed(None),
                    }
                }

                event = self.events.recv(), if self.events_open => {
                    match event {
                        Some(event) => {
                            if let Err(e) = self.handle_event(event).await {
                                return LinkExit::Failed(e.to_string());
                            }
                        }
                        None => self.events_open = false,
                    }
                }
            }
        }
    }

    /// Handle one command. Returns an exit if the actor should stop.
    async fn handle_command(&mut self, command: LinkCommand) -> Option<LinkExit> {
        let result = match command {
            LinkCommand::Close { respond_to } => return Some(LinkExit::Closed(Some(respond_to))),
            LinkCommand::RemoteOffer(offer) => self.handle_remote_offer(offer).await,
            LinkCommand::RemoteAnswer(answer) => self.handle_remote_answer(answer).await,
            LinkCommand::RemoteCandidate(candidate) => {
                self.handle_remote_candidate(candidate).await;
                Ok(())
            }
            LinkCommand::SetTrack {
                kind,
                track,
                respond_to,
            } => match self.connection.set_track(kind, track).await {
                Ok(()) => {
                    let _ = respond_to.send(Ok(()));
                    self.after_track_change().await
                }
                Err(e) => {
                    let _ = respond_to.send(Err(MeshError::Transport(e.to_string())));
                    Err(e)
                }
            },
        };

        result.err().map(|e| LinkExit::Failed(e.to_string()))
    }

    async fn handle_event(&mut self, event: TransportEvent) -> Result<(), MeshError> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if self.has_local_description {
                    self.send_candidate(candidate).await
                } else {
                    self.pending_local_candidates.push(candidate);
                    Ok(())
                }
            }
            TransportEvent::StateChanged(TransportState::Connected) => {
                if self.state == LinkState::Negotiating {
                    self.enter_connected().await
                } else {
                    Ok(())
                }
            }
            TransportEvent::StateChanged(state @ (TransportState::Failed | TransportState::Closed)) => {
                Err(MeshError::Transport(format!("transport {state}")))
            }
            TransportEvent::StateChanged(state) => {
                debug!(
                    target: "mesh.link",
                    remote_id = %self.remote_id,
                    transport_state = %state,
                    "Transport state changed"
                );
                Ok(())
            }
            TransportEvent::RemoteTrack(track) => {
                self.report(LinkReportKind::RemoteTrack(track));
                Ok(())
            }
        }
    }

    async fn handle_remote_offer(&mut self, offer: SessionDescription) -> Result<(), MeshError> {
        match self.state {
            LinkState::AwaitingOffer => {
                self.answer(offer).await?;
                self.transition(LinkState::Negotiating)
            }
            LinkState::Negotiating if !self.role.is_initiator() => {
                debug!(
                    target: "mesh.link",
                    remote_id = %self.remote_id,
                    "Fresh offer while negotiating, restarting exchange"
                );
                self.answer(offer).await
            }
            LinkState::Connected => self.answer(offer).await,
            LinkState::Renegotiating if self.role.is_initiator() => {
                debug!(
                    target: "mesh.link",
                    remote_id = %self.remote_id,
                    "Ignoring colliding offer"
                );
                Ok(())
            }
            LinkState::Renegotiating => {
                debug!(
                    target: "mesh.link",
                    remote_id = %self.remote_id,
                    "Offer collision, yielding and re-offering"
                );
                self.awaiting_answer = false;
                self.answer(offer).await?;
                self.renegotiation_pending = true;
                self.enter_connected().await
            }
            state => {
                debug!(
                    target: "mesh.link",
                    remote_id = %self.remote_id,
                    state = %state,
                    "Ignoring offer"
                );
                Ok(())
            }
        }
    }

    async fn handle_remote_answer(&mut self, answer: SessionDescription) -> Result<(), MeshError> {
        if !self.awaiting_answer {
            debug!(
                target: "mesh.link",
                remote_id = %self.remote_id,
                "Ignoring unsolicited answer"
            );
            return Ok(());
        }

        match self.state {
            LinkState::Negotiating => {
                self.apply_remote_description(answer).await?;
                self.awaiting_answer = false;
                Ok(())
            }
            LinkState::Renegotiating => {
                self.apply_remote_description(answer).await?;
                self.awaiting_answer = false;
                self.enter_connected().await
            }
            _ => Ok(()),
        }
    }

    async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.has_remote_description {
            self.pending_remote_candidates.push(candidate);
            return;
        }

        if let Err(e) = self.connection.add_ice_candidate(candidate).await {
            warn!(
                target: "mesh.link",
                remote_id = %self.remote_id,
                error = %e,
                "Remote candidate rejected"
            );
        }
    }

    async fn after_track_change(&mut self) -> Result<(), MeshError> {
        match self.state {
            LinkState::Connected => self.renegotiate().await,
            LinkState::Failed | LinkState::Closed => Ok(()),
            _ => {
                self.renegotiation_pending = true;
                Ok(())
            }
        }
    }

    async fn enter_connected(&mut self) -> Result<(), MeshError> {
        self.transition(LinkState::Connected)?;
        self.deadline = None;

        if self.renegotiation_pending {
            self.renegotiate().await
        } else {
            Ok(())
        }
    }

    async fn renegotiate(&mut self) -> Result<(), MeshError> {
        self.renegotiation_pending = false;
        self.transition(LinkState::Renegotiating)?;
        self.deadline = Some(Instant::now() + self.timeout);
        self.send_offer().await
    }

    async fn send_offer(&mut self) -> Result<(), MeshError> {
        let offer = self.connection.create_offer().await?;
        self.connection.set_local_description(offer.clone()).await?;
        self.awaiting_answer = true;

        self.send_to_hub(ClientMessage::Offer {
            target_user_id: self.remote_id.clone(),
            payload: offer,
        })
        .await?;
        self.local_description_applied().await
    }

    async fn answer(&mut self, offer: SessionDescription) -> Result<(), MeshError> {
        self.apply_remote_description(offer).await?;

        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;

        self.send_to_hub(ClientMessage::Answer {
            target_user_id: self.remote_id.clone(),
            payload: answer,
        })
        .await?;
        self.local_description_applied().await
    }

    /// Apply a remote description and flush buffered remote candidates.
    async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MeshError> {
        self.connection.set_remote_description(description).await?;
        self.has_remote_description = true;

        for candidate in std::mem::take(&mut self.pending_remote_candidates) {
            self.handle_remote_candidate(candidate).await;
        }
        Ok(())
    }

    /// Mark the local description as set and trickle buffered candidates.
    async fn local_description_applied(&mut self) -> Result<(), MeshError> {
        self.has_local_description = true;

        for candidate in std::mem::take(&mut self.pending_local_candidates) {
            self.send_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn send_candidate(&self, candidate: IceCandidate) -> Result<(), MeshError> {
        self.send_to_hub(ClientMessage::IceCandidate {
            target_user_id: self.remote_id.clone(),
            payload: candidate,
        })
        .await
    }

    /// Queue an envelope for the hub. Nothing is queued once the link is
    /// cancelled, even if a transport call was still running at that point.
    async fn send_to_hub(&self, message: ClientMessage) -> Result<(), MeshError> {
        tokio::select! {
            biased;

            () = self.cancel_token.cancelled() => Err(MeshError::Stopped),

            result = self.outbound.send(message) => result.map_err(|_| MeshError::HubClosed),
        }
    }

    fn transition(&mut self, next: LinkState) -> Result<(), MeshError> {
        if !self.state.can_transition_to(next) {
            return Err(MeshError::InvalidTransition {
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }

        debug!(
            target: "mesh.link",
            remote_id = %self.remote_id,
            from = %self.state,
            to = %next,
            "Link state changed"
        );

        self.state = next;
        self.report(LinkReportKind::State(next));
        Ok(())
    }

    fn report(&self, kind: LinkReportKind) {
        // The controller may already be gone during shutdown.
        let _ = self.reports.send(LinkReport {
            remote_id: self.remote_id.clone(),
            generation: self.generation,
            kind,
        });
    }

    async fn finish(&mut self, exit: LinkExit) {
        self.connection.close().await;

        let exit = match exit {
            LinkExit::Failed(_) if self.cancel_token.is_cancelled() => LinkExit::Closed(None),
            exit => exit,
        };

        match exit {
            LinkExit::Closed(respond_to) => {
                self.state = LinkState::Closed;
                info!(
                    target: "mesh.link",
                    remote_id = %self.remote_id,
                    generation = self.generation,
                    "LinkActor closed"
                );
                self.report(LinkReportKind::Closed);
                if let Some(tx) = respond_to {
                    let _ = tx.send(());
                }
            }
            LinkExit::Failed(reason) => {
                self.state = LinkState::Failed;
                warn!(
                    target: "mesh.link",
                    remote_id = %self.remote_id,
                    generation = self.generation,
                    reason = %reason,
                    "LinkActor failed"
                );
                self.report(LinkReportKind::Failed { reason });
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

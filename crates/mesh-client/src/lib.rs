//! Participant-side mesh controller.
//!
//! Joins a room on the signaling hub and keeps one peer link per other
//! participant, negotiating each one through the hub. The actual media
//! transport and capture devices sit behind the [`PeerConnectionFactory`]
//! and [`MediaCapture`] traits so the controller can run against a real
//! platform stack or the doubles in `testing`.
//!
//! # Architecture
//!
//! ```text
//! RoomSession
//! ├── HubConnection (socket reader + writer tasks)
//! └── MeshController (single owner of mesh state)
//!     ├── Supervisor (retry timers)
//!     ├── MediaSynchronizer (capture + per-link tracks)
//!     └── LinkActor (one per remote peer)
//! ```
//!
//! # Modules
//!
//! - [`config`] - Timeouts, retry policy and buffer sizes
//! - [`errors`] - `MeshError`
//! - [`hub_client`] - WebSocket channel to the hub
//! - [`link`] - Per-peer negotiation state machine
//! - [`media`] - Local media state synchronizer
//! - [`mesh`] - The controller and its events
//! - [`session`] - Join/leave lifecycle
//! - [`supervisor`] - Backoff and retry bookkeeping
//! - [`transport`] - Platform transport and capture traits

#![warn(clippy::pedantic)]

pub mod config;
pub mod errors;
pub mod hub_client;
pub mod link;
pub mod media;
pub mod mesh;
pub mod session;
pub mod supervisor;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::MeshConfig;
pub use errors::MeshError;
pub use link::LinkState;
pub use mesh::{LinkSnapshot, MeshEvent, MeshHandle, MeshSnapshot};
pub use session::RoomSession;
pub use supervisor::RetryPolicy;
pub use transport::{
    LocalTrack, MediaCapture, PeerConnection, PeerConnectionFactory, RemoteTrack, TrackSet,
    TransportEvent, TransportState,
};

//! Signaling hub library.
//!
//! A WebSocket relay for full-mesh audio/video rooms. The hub tracks who is
//! present and brokers session descriptions and network-path candidates
//! between pairs of participants. Media never passes through it.
//!
//! # Architecture
//!
//! ```text
//! axum /ws handler (one task per socket, reads frames)
//! ├── ConnectionActor (writes frames to its socket)
//! └── RoomActor (singleton, owns the peer registry)
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Room and connection actors
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types mapped to protocol error codes
//! - [`observability`] - Health checks and Prometheus metrics
//! - [`registry`] - Peer registry and id allocation
//! - [`routes`] - Axum router and shared state
//! - [`ws`] - WebSocket reader loop

#![warn(clippy::pedantic)]

pub mod actors;
pub mod config;
pub mod errors;
pub mod observability;
pub mod registry;
pub mod routes;
pub mod ws;

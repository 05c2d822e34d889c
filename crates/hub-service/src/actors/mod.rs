//! Actor model implementation for the signaling hub.
//!
//! ```text
//! RoomActor (singleton, owns the peer registry)
//! └── talks to N ConnectionActors through bounded queues
//!     └── ConnectionActor (one per WebSocket, owns the write half)
//! ```
//!
//! Each WebSocket's read half runs in its handler task, decodes envelopes
//! and forwards them to the room. The room replies and fans out through
//! connection handles without ever awaiting a socket.
//!
//! - **Single writer**: only the room mutates membership and media flags
//! - **CancellationToken propagation**: connection tokens are children of
//!   the room's token, so shutdown reaches every socket
//! - **Mailbox monitoring**: depth thresholds with metrics (Room: 256/768, Connection: 64/192)

pub mod connection;
pub mod messages;
pub mod metrics;
pub mod room;

pub use connection::{ConnectionActor, ConnectionActorHandle, DeliveryError};
pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use room::{RoomActor, RoomHandle};

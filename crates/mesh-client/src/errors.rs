//! Mesh client error types.

use signaling_protocol::ErrorCode;
use thiserror::Error;

/// Errors surfaced by the mesh client.
#[derive(Debug, Error)]
pub enum MeshError {
    /// The hub channel could not be opened.
    #[error("Hub connection failed: {0}")]
    Connect(String),

    /// The hub answered the join handshake with an error.
    #[error("Join rejected ({}): {message}", .code.as_str())]
    Rejected { code: ErrorCode, message: String },

    /// The hub channel closed.
    #[error("Hub connection closed")]
    HubClosed,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// The platform transport reported an error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The capture device could not be acquired.
    #[error("Media capture error: {0}")]
    Capture(String),

    #[error("Invalid link transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// The actor that owns the request has stopped.
    #[error("Mesh controller stopped")]
    Stopped,
}

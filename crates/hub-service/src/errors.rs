//! Hub error types.
//!
//! Error types map to protocol [`ErrorCode`] values for `error` replies.
//! Internal details are logged server-side but not exposed to clients.

use signaling_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Hub error type.
///
/// Maps to `ErrorCode` values:
/// - `Protocol`: `malformed_message`
/// - `CapacityExceeded`: `capacity_exceeded`
/// - `NotJoined`: `not_joined`
/// - `AlreadyJoined`: `already_joined`
/// - `IdAllocation`: `id_allocation_failed`
/// - `Internal`, `Draining`: `internal_error`
#[derive(Debug, Error)]
pub enum HubError {
    /// Client sent an envelope that failed decoding or validation.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Room is at its configured participant ceiling.
    #[error("Room at capacity: {max} participants")]
    CapacityExceeded { max: usize },

    /// Channel sent a room message before completing the join handshake.
    #[error("Channel has not joined")]
    NotJoined,

    /// Channel attempted a second join.
    #[error("Channel already joined")]
    AlreadyJoined,

    /// Every generated peer id collided with a registered peer.
    #[error("Peer id allocation failed after {attempts} attempts")]
    IdAllocation { attempts: usize },

    /// Hub is shutting down.
    #[error("Hub is draining")]
    Draining,

    /// Internal error (actor channel failures and the like).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Returns the protocol `ErrorCode` for this error.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            HubError::Protocol(_) => ErrorCode::MalformedMessage,
            HubError::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            HubError::NotJoined => ErrorCode::NotJoined,
            HubError::AlreadyJoined => ErrorCode::AlreadyJoined,
            HubError::IdAllocation { .. } => ErrorCode::IdAllocationFailed,
            HubError::Draining | HubError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            HubError::Protocol(e) => e.to_string(),
            HubError::CapacityExceeded { max } => {
                format!("Server full ({max} participants), please try again later")
            }
            HubError::NotJoined => "Set a username before sending room messages".to_string(),
            HubError::AlreadyJoined => "Username already set for this connection".to_string(),
            HubError::IdAllocation { .. } => {
                "Could not allocate a user id, please retry".to_string()
            }
            HubError::Draining => "Server is shutting down".to_string(),
            HubError::Internal(_) => "An internal error occurred".to_string(),
        }
    }

    /// Whether the channel is closed after the error reply.
    #[must_use]
    pub fn closes_channel(&self) -> bool {
        matches!(self, HubError::CapacityExceeded { .. } | HubError::Draining)
    }
}

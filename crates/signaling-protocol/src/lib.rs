//! Signaling protocol for full-mesh audio/video rooms.
//!
//! Every participant holds one full-duplex channel to the signaling hub and
//! exchanges JSON envelopes over it. Each envelope is a single object tagged
//! by its `type` field. The hub attaches sender identity to everything it
//! fans out; clients never supply it.
//!
//! # Modules
//!
//! - [`messages`] - Envelope types for both directions
//! - [`codec`] - JSON encoding, decoding and field validation
//! - [`role`] - Deterministic offerer selection for a pair of peers

#![warn(clippy::pedantic)]

pub mod codec;
pub mod messages;
pub mod role;

pub use codec::{
    decode_client_message, decode_server_message, encode_client_message, encode_server_message,
    ProtocolError, MAX_CHAT_TEXT_LEN, MAX_USERNAME_LEN,
};
pub use messages::*;
pub use role::{is_initiator, LinkRole};

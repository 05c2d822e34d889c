//! JSON codec for signaling envelopes.
//!
//! Decoding on the hub side is strict: anything that is not a well-formed,
//! known envelope with valid fields is rejected with a [`ProtocolError`]
//! that can be echoed back to the sender.

use crate::messages::{ClientMessage, ServerMessage};
use serde_json::Value;

/// Maximum username length in characters, after trimming.
pub const MAX_USERNAME_LEN: usize = 32;

/// Maximum chat text length in characters.
pub const MAX_CHAT_TEXT_LEN: usize = 2000;

const CLIENT_MESSAGE_TYPES: [&str; 10] = [
    "set_username",
    "chat",
    "audio_enabled",
    "audio_disabled",
    "video_enabled",
    "video_disabled",
    "offer",
    "answer",
    "ice_candidate",
    "leave",
];

/// Error type for codec operations
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload is not a JSON object
    #[error("Message is not a JSON object")]
    NotAnObject,

    /// Object has no string `type` field
    #[error("Message has no type")]
    MissingType,

    /// `type` is not a known envelope
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    /// Fields are missing or have the wrong shape
    #[error("Malformed {message_type} message: {detail}")]
    Malformed {
        message_type: String,
        detail: String,
    },

    /// A field is present but its value is not acceptable
    #[error("Invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },

    /// Serialization failed
    #[error("Encoding failed: {0}")]
    Encode(String),
}

/// Decode and validate a participant envelope.
///
/// Usernames are returned trimmed.
///
/// # Errors
///
/// Returns an error if the text is not a known, well-formed envelope or if a
/// field fails validation.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::NotAnObject)?;

    let message_type = match &value {
        Value::Object(map) => match map.get("type") {
            Some(Value::String(t)) => t.clone(),
            _ => return Err(ProtocolError::MissingType),
        },
        _ => return Err(ProtocolError::NotAnObject),
    };

    if !CLIENT_MESSAGE_TYPES.contains(&message_type.as_str()) {
        return Err(ProtocolError::UnknownType(message_type));
    }

    let message: ClientMessage =
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
            message_type: message_type.clone(),
            detail: e.to_string(),
        })?;

    validate(message)
}

fn validate(message: ClientMessage) -> Result<ClientMessage, ProtocolError> {
    match message {
        ClientMessage::SetUsername { username } => {
            let trimmed = username.trim();
            if trimmed.is_empty() {
                return Err(ProtocolError::InvalidField {
                    field: "username",
                    reason: "must not be empty",
                });
            }
            if trimmed.chars().count() > MAX_USERNAME_LEN {
                return Err(ProtocolError::InvalidField {
                    field: "username",
                    reason: "too long",
                });
            }
            Ok(ClientMessage::SetUsername {
                username: trimmed.to_string(),
            })
        }
        ClientMessage::Chat { text } => {
            if text.trim().is_empty() {
                return Err(ProtocolError::InvalidField {
                    field: "text",
                    reason: "must not be empty",
                });
            }
            if text.chars().count() > MAX_CHAT_TEXT_LEN {
                return Err(ProtocolError::InvalidField {
                    field: "text",
                    reason: "too long",
                });
            }
            Ok(ClientMessage::Chat { text })
        }
        ClientMessage::Offer { target_user_id, .. }
        | ClientMessage::Answer { target_user_id, .. }
        | ClientMessage::IceCandidate { target_user_id, .. }
            if target_user_id.is_empty() =>
        {
            Err(ProtocolError::InvalidField {
                field: "targetUserId",
                reason: "must not be empty",
            })
        }
        other => Ok(other),
    }
}

/// Encode a participant envelope.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_client_message(message: &ClientMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Encode a hub envelope.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_server_message(message: &ServerMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Decode a hub envelope on the participant side.
///
/// # Errors
///
/// Returns an error if the text is not a known, well-formed hub envelope.
pub fn decode_server_message(text: &str) -> Result<ServerMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::NotAnObject)?;
    let message_type = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ProtocolError::MissingType)?;

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
        message_type,
        detail: e.to_string(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::messages::{ErrorCode, SdpType};

    #[test]
    fn test_decode_set_username_trims() {
        let msg = decode_client_message(r#"{"type":"set_username","username":"  alice "}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SetUsername {
                username: "alice".to_string()
            }
        );
    }

    #[test]
    fn test_decode_rejects_non_json() {
        assert_eq!(
            decode_client_message("hello"),
            Err(ProtocolError::NotAnObject)
        );
        assert_eq!(decode_client_message("[1,2]"), Err(ProtocolError::NotAnObject));
    }

    #[test]
    fn test_decode_rejects_missing_type() {
        assert_eq!(
            decode_client_message(r#"{"username":"alice"}"#),
            Err(ProtocolError::MissingType)
        );
        assert_eq!(
            decode_client_message(r#"{"type":7}"#),
            Err(ProtocolError::MissingType)
        );
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert_eq!(
            decode_client_message(r#"{"type":"kick","target":"x"}"#),
            Err(ProtocolError::UnknownType("kick".to_string()))
        );
    }

    #[test]
    fn test_decode_rejects_missing_field() {
        let err = decode_client_message(r#"{"type":"offer","targetUserId":"b"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { ref message_type, .. } if message_type == "offer"));
    }

    #[test]
    fn test_decode_rejects_empty_and_long_usernames() {
        assert!(matches!(
            decode_client_message(r#"{"type":"set_username","username":"   "}"#),
            Err(ProtocolError::InvalidField { field: "username", .. })
        ));

        let long = "x".repeat(MAX_USERNAME_LEN + 1);
        let text = format!(r#"{{"type":"set_username","username":"{long}"}}"#);
        assert!(matches!(
            decode_client_message(&text),
            Err(ProtocolError::InvalidField { field: "username", reason: "too long" })
        ));
    }

    #[test]
    fn test_decode_rejects_empty_chat_and_target() {
        assert!(matches!(
            decode_client_message(r#"{"type":"chat","text":""}"#),
            Err(ProtocolError::InvalidField { field: "text", .. })
        ));
        assert!(matches!(
            decode_client_message(
                r#"{"type":"answer","targetUserId":"","payload":{"type":"answer","sdp":"v=0"}}"#
            ),
            Err(ProtocolError::InvalidField { field: "targetUserId", .. })
        ));
    }

    #[test]
    fn test_decode_candidate_with_optional_fields_absent() {
        let msg = decode_client_message(
            r#"{"type":"ice_candidate","targetUserId":"b","payload":{"candidate":"candidate:0"}}"#,
        )
        .unwrap();

        match msg {
            ClientMessage::IceCandidate { payload, .. } => {
                assert_eq!(payload.candidate, "candidate:0");
                assert!(payload.sdp_mid.is_none());
                assert!(payload.sdp_m_line_index.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_decode_server_error_envelope() {
        let msg = decode_server_message(
            r#"{"type":"error","code":"capacity_exceeded","message":"Server full"}"#,
        )
        .unwrap();
        assert_eq!(msg, ServerMessage::error(ErrorCode::CapacityExceeded, "Server full"));
    }

    #[test]
    fn test_decode_server_offer_payload_type() {
        let msg = decode_server_message(
            r#"{"type":"offer","senderUserId":"a","senderUsername":"alice","payload":{"type":"offer","sdp":"v=0"}}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Offer { payload, .. } => assert_eq!(payload.sdp_type, SdpType::Offer),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

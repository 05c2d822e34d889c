//! Envelope types exchanged over the participant <-> hub channel.
//!
//! Tags are snake_case (`set_username`, `ice_candidate`) and fields are
//! camelCase (`userId`, `targetUserId`) on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of locally captured media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Both kinds, audio first.
    pub const ALL: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];

    /// Returns the kind as a string for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session description type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// A session description as produced by the platform peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled network-path candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

/// Messages sent from a participant to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join handshake. Must be the first message on a channel.
    SetUsername { username: String },

    /// Room chat. The hub stamps identity and time.
    Chat { text: String },

    AudioEnabled,
    AudioDisabled,
    VideoEnabled,
    VideoDisabled,

    /// Session-description offer for one remote peer.
    #[serde(rename_all = "camelCase")]
    Offer {
        target_user_id: String,
        payload: SessionDescription,
    },

    /// Session-description answer for one remote peer.
    #[serde(rename_all = "camelCase")]
    Answer {
        target_user_id: String,
        payload: SessionDescription,
    },

    /// Network-path candidate for one remote peer.
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        target_user_id: String,
        payload: IceCandidate,
    },

    /// Explicit departure. The hub closes the channel afterwards.
    Leave,
}

impl ClientMessage {
    /// Wire tag of this message, used for logs and metric labels.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::SetUsername { .. } => "set_username",
            ClientMessage::Chat { .. } => "chat",
            ClientMessage::AudioEnabled => "audio_enabled",
            ClientMessage::AudioDisabled => "audio_disabled",
            ClientMessage::VideoEnabled => "video_enabled",
            ClientMessage::VideoDisabled => "video_disabled",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "ice_candidate",
            ClientMessage::Leave => "leave",
        }
    }

    /// The media-state message for a kind and flag.
    #[must_use]
    pub const fn media_state(kind: MediaKind, enabled: bool) -> Self {
        match (kind, enabled) {
            (MediaKind::Audio, true) => ClientMessage::AudioEnabled,
            (MediaKind::Audio, false) => ClientMessage::AudioDisabled,
            (MediaKind::Video, true) => ClientMessage::VideoEnabled,
            (MediaKind::Video, false) => ClientMessage::VideoDisabled,
        }
    }
}

/// One entry of a `user_list` broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserEntry {
    pub user_id: String,
    pub username: String,
}

/// One entry of an `audio_states` broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioState {
    pub user_id: String,
    pub is_audio_enabled: bool,
}

/// One entry of a `video_states` broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoState {
    pub user_id: String,
    pub is_video_enabled: bool,
}

/// Error codes carried by `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MalformedMessage,
    CapacityExceeded,
    NotJoined,
    AlreadyJoined,
    IdAllocationFailed,
    InternalError,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MalformedMessage => "malformed_message",
            ErrorCode::CapacityExceeded => "capacity_exceeded",
            ErrorCode::NotJoined => "not_joined",
            ErrorCode::AlreadyJoined => "already_joined",
            ErrorCode::IdAllocationFailed => "id_allocation_failed",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

/// Messages sent from the hub to participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join accepted; carries the allocated peer id.
    #[serde(rename_all = "camelCase")]
    UsernameAccepted { username: String, user_id: String },

    /// Full membership in join order.
    UserList { users: Vec<UserEntry> },

    /// Human-readable room notice (joins and departures).
    System {
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Chat line with hub-stamped identity.
    #[serde(rename_all = "camelCase")]
    Chat {
        user_id: String,
        username: String,
        text: String,
        timestamp: DateTime<Utc>,
    },

    AudioStates { states: Vec<AudioState> },
    VideoStates { states: Vec<VideoState> },

    #[serde(rename_all = "camelCase")]
    Offer {
        sender_user_id: String,
        sender_username: String,
        payload: SessionDescription,
    },

    #[serde(rename_all = "camelCase")]
    Answer {
        sender_user_id: String,
        sender_username: String,
        payload: SessionDescription,
    },

    #[serde(rename_all = "camelCase")]
    IceCandidate {
        sender_user_id: String,
        sender_username: String,
        payload: IceCandidate,
    },

    Error { code: ErrorCode, message: String },
}

impl ServerMessage {
    /// Build an `error` envelope.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }

    /// Build a `system` notice stamped with the current time.
    #[must_use]
    pub fn system(message: impl Into<String>) -> Self {
        ServerMessage::System {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Wire tag of this message, used for logs and metric labels.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::UsernameAccepted { .. } => "username_accepted",
            ServerMessage::UserList { .. } => "user_list",
            ServerMessage::System { .. } => "system",
            ServerMessage::Chat { .. } => "chat",
            ServerMessage::AudioStates { .. } => "audio_states",
            ServerMessage::VideoStates { .. } => "video_states",
            ServerMessage::Offer { .. } => "offer",
            ServerMessage::Answer { .. } => "answer",
            ServerMessage::IceCandidate { .. } => "ice_candidate",
            ServerMessage::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_offer_wire_shape() {
        let msg = ClientMessage::Offer {
            target_user_id: "b2".to_string(),
            payload: SessionDescription::offer("v=0"),
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "offer",
                "targetUserId": "b2",
                "payload": { "type": "offer", "sdp": "v=0" }
            })
        );
    }

    #[test]
    fn test_unit_variants_serialize_as_bare_tag() {
        let value = serde_json::to_value(ClientMessage::AudioEnabled).unwrap();
        assert_eq!(value, json!({ "type": "audio_enabled" }));

        let value = serde_json::to_value(ClientMessage::Leave).unwrap();
        assert_eq!(value, json!({ "type": "leave" }));
    }

    #[test]
    fn test_username_accepted_uses_camel_case() {
        let msg = ServerMessage::UsernameAccepted {
            username: "alice".to_string(),
            user_id: "k3j9x0a1b".to_string(),
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({ "type": "username_accepted", "username": "alice", "userId": "k3j9x0a1b" })
        );
    }

    #[test]
    fn test_media_state_entries_use_flag_names() {
        let audio = ServerMessage::AudioStates {
            states: vec![AudioState {
                user_id: "a".to_string(),
                is_audio_enabled: true,
            }],
        };
        let video = ServerMessage::VideoStates {
            states: vec![VideoState {
                user_id: "a".to_string(),
                is_video_enabled: false,
            }],
        };

        assert_eq!(
            serde_json::to_value(&audio).unwrap(),
            json!({ "type": "audio_states", "states": [{ "userId": "a", "isAudioEnabled": true }] })
        );
        assert_eq!(
            serde_json::to_value(&video).unwrap(),
            json!({ "type": "video_states", "states": [{ "userId": "a", "isVideoEnabled": false }] })
        );
    }

    #[test]
    fn test_forwarded_candidate_carries_sender_fields() {
        let msg = ServerMessage::IceCandidate {
            sender_user_id: "a".to_string(),
            sender_username: "alice".to_string(),
            payload: IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            },
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "ice_candidate");
        assert_eq!(value["senderUserId"], "a");
        assert_eq!(value["senderUsername"], "alice");
        assert_eq!(value["payload"]["sdpMid"], "0");
        assert_eq!(value["payload"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_error_code_serialization_matches_as_str() {
        for code in [
            ErrorCode::MalformedMessage,
            ErrorCode::CapacityExceeded,
            ErrorCode::NotJoined,
            ErrorCode::AlreadyJoined,
            ErrorCode::IdAllocationFailed,
            ErrorCode::InternalError,
        ] {
            assert_eq!(serde_json::to_value(code).unwrap(), json!(code.as_str()));
        }
    }

    #[test]
    fn test_media_state_constructor() {
        assert_eq!(
            ClientMessage::media_state(MediaKind::Audio, true),
            ClientMessage::AudioEnabled
        );
        assert_eq!(
            ClientMessage::media_state(MediaKind::Video, false),
            ClientMessage::VideoDisabled
        );
    }
}

//! Realtime message envelopes.
//!
//! Every frame is a JSON object `{"type": ..., ...fields}`. Inbound frames
//! decode into [`ServerEvent`]; an unrecognised `type` becomes
//! [`ServerEvent::Unknown`] rather than an error. Outbound frames are
//! [`ClientCommand`]s.

use serde::{Deserialize, Deserializer, Serialize};

/// WebRTC signaling message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
    /// ICE candidate
    IceCandidate,
}

/// Encrypted chat message broadcast to the other members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Server-assigned message id
    #[serde(deserialize_with = "string_or_number")]
    pub message_id: String,
    /// Sender user id
    pub sender_id: String,
    /// Sender display name
    #[serde(default)]
    pub sender_name: Option<String>,
    /// Base64 ciphertext
    pub encrypted_content: String,
    /// Base64 nonce
    pub nonce: String,
    /// Server timestamp (ISO 8601)
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Signaling message relayed from one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEvent {
    /// Originating user id
    pub from_user: String,
    /// Message kind
    pub signal_type: SignalType,
    /// Opaque SDP or candidate payload
    pub signal_data: serde_json::Value,
}

/// Typing indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingEvent {
    /// Typing user id
    pub user_id: String,
    /// Typing user display name
    #[serde(default)]
    pub user_name: Option<String>,
    /// Whether the user is typing
    #[serde(default)]
    pub is_typing: bool,
}

/// Transfer progress or status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferUpdateEvent {
    /// Transfer id
    pub transfer_id: String,
    /// User reporting the update
    #[serde(default)]
    pub user_id: Option<String>,
    /// New status (wire name)
    pub status: String,
    /// Percentage, if reported
    #[serde(default)]
    pub progress: Option<f64>,
}

/// A relay transfer finished uploading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransferEvent {
    /// Transfer id
    pub transfer_id: String,
    /// Sender user id
    pub sender_id: String,
    /// Sender display name
    #[serde(default)]
    pub sender_name: Option<String>,
    /// Base64 encrypted filename
    pub encrypted_filename: String,
    /// Plaintext size in bytes
    pub file_size: u64,
    /// Status (wire name)
    pub status: String,
}

/// A member came online.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserJoinedEvent {
    /// User id
    pub user_id: String,
    /// Base64 public key, when the server has one
    #[serde(default)]
    pub public_key: Option<String>,
    /// Display name
    #[serde(default)]
    pub display_name: Option<String>,
}

/// A member went offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLeftEvent {
    /// User id
    pub user_id: String,
    /// Display name
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Snapshot of online members, sent on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUsersEvent {
    /// Online user ids
    #[serde(default)]
    pub users: Vec<String>,
}

/// Inbound realtime event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Encrypted chat message
    Chat(ChatEvent),
    /// WebRTC signaling
    Signal(SignalEvent),
    /// Typing indicator
    Typing(TypingEvent),
    /// Transfer status change
    TransferUpdate(TransferUpdateEvent),
    /// Relay transfer ready
    NewTransfer(NewTransferEvent),
    /// Member online
    UserJoined(UserJoinedEvent),
    /// Member offline
    UserLeft(UserLeftEvent),
    /// Online snapshot
    OnlineUsers(OnlineUsersEvent),
    /// Server keep-alive
    Ping,
    /// Reply to our keep-alive
    Pong,
    /// Any type this client does not know
    #[serde(other)]
    Unknown,
}

/// Dispatch key for [`ServerEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`ServerEvent::Chat`]
    Chat,
    /// [`ServerEvent::Signal`]
    Signal,
    /// [`ServerEvent::Typing`]
    Typing,
    /// [`ServerEvent::TransferUpdate`]
    TransferUpdate,
    /// [`ServerEvent::NewTransfer`]
    NewTransfer,
    /// [`ServerEvent::UserJoined`]
    UserJoined,
    /// [`ServerEvent::UserLeft`]
    UserLeft,
    /// [`ServerEvent::OnlineUsers`]
    OnlineUsers,
    /// [`ServerEvent::Ping`]
    Ping,
    /// [`ServerEvent::Pong`]
    Pong,
    /// [`ServerEvent::Unknown`]
    Unknown,
}

impl EventKind {
    /// Every kind, for subscribing to everything.
    pub const ALL: [EventKind; 11] = [
        Self::Chat,
        Self::Signal,
        Self::Typing,
        Self::TransferUpdate,
        Self::NewTransfer,
        Self::UserJoined,
        Self::UserLeft,
        Self::OnlineUsers,
        Self::Ping,
        Self::Pong,
        Self::Unknown,
    ];
}

impl ServerEvent {
    /// Dispatch key.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Chat(_) => EventKind::Chat,
            Self::Signal(_) => EventKind::Signal,
            Self::Typing(_) => EventKind::Typing,
            Self::TransferUpdate(_) => EventKind::TransferUpdate,
            Self::NewTransfer(_) => EventKind::NewTransfer,
            Self::UserJoined(_) => EventKind::UserJoined,
            Self::UserLeft(_) => EventKind::UserLeft,
            Self::OnlineUsers(_) => EventKind::OnlineUsers,
            Self::Ping => EventKind::Ping,
            Self::Pong => EventKind::Pong,
            Self::Unknown => EventKind::Unknown,
        }
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Fails if the frame is not a JSON object with a string `type`, or a
    /// known type is missing required fields.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encode as a text frame.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Outbound realtime command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Encrypted chat message
    Chat {
        /// Base64 ciphertext
        encrypted_content: String,
        /// Base64 nonce
        nonce: String,
    },
    /// Signaling message for one peer
    Signal {
        /// Recipient user id
        target_user: String,
        /// Message kind
        signal_type: SignalType,
        /// Opaque payload
        signal_data: serde_json::Value,
    },
    /// Typing indicator
    Typing {
        /// Whether the local user is typing
        is_typing: bool,
    },
    /// Transfer status change
    TransferUpdate {
        /// Transfer id
        transfer_id: String,
        /// New status (wire name)
        status: String,
        /// Percentage
        #[serde(skip_serializing_if = "Option::is_none", default)]
        progress: Option<f64>,
    },
    /// Keep-alive
    Ping,
}

impl ClientCommand {
    /// Encode as a text frame.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Int(i64),
    }

    Ok(match Id::deserialize(d)? {
        Id::Text(s) => s,
        Id::Int(n) => n.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_chat_with_numeric_id() {
        let text = json!({
            "type": "chat",
            "message_id": 42,
            "sender_id": "u1",
            "sender_name": "Alice",
            "encrypted_content": "Y3Q=",
            "nonce": "bm9uY2U=",
            "timestamp": "2024-05-01T10:00:00+00:00"
        })
        .to_string();

        let ServerEvent::Chat(chat) = ServerEvent::from_json(&text).unwrap() else {
            panic!("expected chat");
        };
        assert_eq!(chat.message_id, "42");
        assert_eq!(chat.sender_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let event = ServerEvent::from_json(r#"{"type":"room_archived","room":"x"}"#).unwrap();
        assert_eq!(event, ServerEvent::Unknown);
        assert_eq!(event.kind(), EventKind::Unknown);
    }

    #[test]
    fn test_missing_type_is_an_error() {
        assert!(ServerEvent::from_json(r#"{"users":[]}"#).is_err());
    }

    #[test]
    fn test_user_joined_without_key() {
        let event = ServerEvent::from_json(r#"{"type":"user_joined","user_id":"u2","public_key":null}"#)
            .unwrap();
        let ServerEvent::UserJoined(joined) = event else {
            panic!("expected user_joined");
        };
        assert!(joined.public_key.is_none());
    }

    #[test]
    fn test_signal_type_names() {
        let cmd = ClientCommand::Signal {
            target_user: "u2".into(),
            signal_type: SignalType::IceCandidate,
            signal_data: json!({"candidate": "c"}),
        };
        let value: serde_json::Value = serde_json::from_str(&cmd.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "signal");
        assert_eq!(value["signal_type"], "ice-candidate");
    }

    #[test]
    fn test_ping_pong_encoding() {
        assert_eq!(ClientCommand::Ping.to_json().unwrap(), r#"{"type":"ping"}"#);
        assert_eq!(ServerEvent::from_json(r#"{"type":"pong"}"#).unwrap(), ServerEvent::Pong);
    }

    #[test]
    fn test_transfer_update_omits_missing_progress() {
        let cmd = ClientCommand::TransferUpdate {
            transfer_id: "t1".into(),
            status: "completed".into(),
            progress: None,
        };
        assert!(!cmd.to_json().unwrap().contains("progress"));
    }

    #[test]
    fn test_kind_covers_all() {
        assert_eq!(EventKind::ALL.len(), 11);
        assert_eq!(ServerEvent::Ping.kind(), EventKind::Ping);
    }
}

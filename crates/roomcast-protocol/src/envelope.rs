//! Envelope types for the Roomcast protocol.
//!
//! An envelope is the unit exchanged both over client sockets and over the
//! external pub/sub channel. It is plain JSON:
//!
//! ```json
//! { "action": "CHAT_MESSAGE", "room_id": "general", "sender_id": "u-1", "data": "hi" }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;

/// Maximum room ID length.
pub const MAX_ROOM_ID_LENGTH: usize = 256;

/// A room identifier.
pub type RoomId = String;

/// Validate a room ID and return it trimmed.
///
/// # Errors
///
/// Returns an error message if the room ID is blank, too long or contains
/// control characters.
pub fn validate_room_id(room_id: &str) -> Result<&str, &'static str> {
    let trimmed = room_id.trim();
    if trimmed.is_empty() {
        return Err("room_id is required");
    }
    if trimmed.len() > MAX_ROOM_ID_LENGTH {
        return Err("room_id too long");
    }
    if trimmed.chars().any(char::is_control) {
        return Err("room_id contains invalid characters");
    }
    Ok(trimmed)
}

/// Envelope action.
///
/// Unknown action strings survive decoding as [`Action::Unknown`] so the hub
/// can reject them without dropping the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    /// Join a room.
    JoinRoom,
    /// Leave a room.
    LeaveRoom,
    /// Publish a chat message to a room.
    ChatMessage,
    /// Any action this server does not understand.
    Unknown(String),
}

impl Action {
    /// Wire name of the action.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Action::JoinRoom => "JOIN_ROOM",
            Action::LeaveRoom => "LEAVE_ROOM",
            Action::ChatMessage => "CHAT_MESSAGE",
            Action::Unknown(other) => other,
        }
    }
}

impl From<String> for Action {
    fn from(value: String) -> Self {
        match value.as_str() {
            "JOIN_ROOM" => Action::JoinRoom,
            "LEAVE_ROOM" => Action::LeaveRoom,
            "CHAT_MESSAGE" => Action::ChatMessage,
            _ => Action::Unknown(value),
        }
    }
}

impl From<Action> for String {
    fn from(action: Action) -> String {
        match action {
            Action::Unknown(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// What the sender wants done.
    pub action: Action,

    /// Target room.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub room_id: RoomId,

    /// Principal that sent the envelope. Filled in by the server when absent.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender_id: String,

    /// Opaque payload, forwarded byte-for-byte.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

impl Envelope {
    /// Create an envelope with no sender and no payload.
    #[must_use]
    pub fn new(action: Action, room_id: impl Into<RoomId>) -> Self {
        Self {
            action,
            room_id: room_id.into(),
            sender_id: String::new(),
            data: None,
        }
    }

    /// Create a JOIN_ROOM envelope.
    #[must_use]
    pub fn join(room_id: impl Into<RoomId>) -> Self {
        Self::new(Action::JoinRoom, room_id)
    }

    /// Create a LEAVE_ROOM envelope.
    #[must_use]
    pub fn leave(room_id: impl Into<RoomId>) -> Self {
        Self::new(Action::LeaveRoom, room_id)
    }

    /// Create a CHAT_MESSAGE envelope carrying `data`.
    #[must_use]
    pub fn chat(room_id: impl Into<RoomId>, data: Box<RawValue>) -> Self {
        Self {
            data: Some(data),
            ..Self::new(Action::ChatMessage, room_id)
        }
    }

    /// Set the sender.
    #[must_use]
    pub fn with_sender(mut self, sender_id: impl Into<String>) -> Self {
        self.sender_id = sender_id.into();
        self
    }

    /// Raw JSON text of the payload, if any.
    #[must_use]
    pub fn data_json(&self) -> Option<&str> {
        self.data.as_deref().map(RawValue::get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_from_wire_name() {
        assert_eq!(Action::from("JOIN_ROOM".to_string()), Action::JoinRoom);
        assert_eq!(Action::from("LEAVE_ROOM".to_string()), Action::LeaveRoom);
        assert_eq!(Action::from("CHAT_MESSAGE".to_string()), Action::ChatMessage);
        assert_eq!(
            Action::from("join_room".to_string()),
            Action::Unknown("join_room".to_string())
        );
        assert_eq!(String::from(Action::Unknown("PING".into())), "PING");
    }

    #[test]
    fn test_validate_room_id() {
        assert_eq!(validate_room_id("  general "), Ok("general"));
        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("   ").is_err());
        assert!(validate_room_id("bad\nroom").is_err());

        let long_id = "r".repeat(MAX_ROOM_ID_LENGTH + 1);
        assert!(validate_room_id(&long_id).is_err());
    }

    #[test]
    fn test_envelope_builders() {
        let data = RawValue::from_string("\"hi\"".to_string()).unwrap();
        let envelope = Envelope::chat("general", data).with_sender("user-1");

        assert_eq!(envelope.action, Action::ChatMessage);
        assert_eq!(envelope.room_id, "general");
        assert_eq!(envelope.sender_id, "user-1");
        assert_eq!(envelope.data_json(), Some("\"hi\""));
    }
}

//! Stream Events
//!
//! The closed set of payloads that travel through the hub. Every event carries
//! exactly one variant; on the wire the variant name travels in a `type`
//! discriminator next to a `data` payload:
//!
//! ```text
//! {"type": "message",  "data": {"room_id": "lobby", "sender_id": "ana", "text": "hi"}}
//! {"type": "typing",   "data": {"user_id": "ana", "room_id": "lobby", "is_typing": true}}
//! {"type": "presence", "data": {"user_id": "ana", "online": false}}
//! {"type": "control",  "data": {"action": "join", "room_id": "lobby"}}
//! ```
//!
//! Only `Message` carries server-side validation: `room_id` and `sender_id` are
//! required. `id` and `created_at` are assigned by the receiving component when
//! the client leaves them out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RelayError;

/// A chat message
///
/// Immutable once finalized. `id` is empty and `created_at` is `None` until the
/// server fills them in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Opaque message identifier (server-assigned if empty)
    #[serde(default)]
    pub id: String,
    /// Room the message belongs to
    #[serde(default)]
    pub room_id: String,
    /// Author of the message
    #[serde(default)]
    pub sender_id: String,
    /// Message body
    #[serde(default)]
    pub text: String,
    /// Creation time (server-assigned if absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    /// Create a message without id or timestamp
    pub fn new(
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            room_id: room_id.into(),
            sender_id: sender_id.into(),
            text: text.into(),
            created_at: None,
        }
    }

    /// Set an explicit id
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set an explicit creation time
    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Check the required fields
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidArgument` if `room_id` or `sender_id` is
    /// empty or whitespace-only.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.room_id.is_empty() {
            return Err(RelayError::InvalidArgument("room_id is required".into()));
        }
        if self.sender_id.is_empty() {
            return Err(RelayError::InvalidArgument("sender_id is required".into()));
        }
        Ok(())
    }

    /// Validate and fill in the server-assigned fields
    ///
    /// Values that are already present are kept as-is.
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidArgument` if validation fails. Nothing is
    /// assigned in that case.
    pub fn finalize(mut self) -> Result<Self, RelayError> {
        self.validate()?;
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        if self.created_at.is_none() {
            self.created_at = Some(Utc::now());
        }
        Ok(self)
    }

    /// Whether both server-assigned fields are present
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        !self.id.is_empty() && self.created_at.is_some()
    }
}

/// Typing indicator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingSignal {
    /// Who is typing
    pub user_id: String,
    /// Where they are typing
    pub room_id: String,
    /// Started (true) or stopped (false) typing
    pub is_typing: bool,
}

/// Presence change
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSignal {
    /// Whose presence changed
    pub user_id: String,
    /// Online or offline
    pub online: bool,
}

/// Room membership control action
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    /// Enter a room
    Join,
    /// Leave a room
    Leave,
    /// Any action this relay does not know about
    #[serde(other)]
    Unspecified,
}

/// Control signal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlSignal {
    /// What to do
    pub action: ControlAction,
    /// Which room it applies to
    pub room_id: String,
}

/// An event travelling through the stream hub
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A chat message
    Message(ChatMessage),
    /// A typing indicator
    Typing(TypingSignal),
    /// A presence change
    Presence(PresenceSignal),
    /// A control signal (join/leave)
    Control(ControlSignal),
}

impl StreamEvent {
    /// Build a `Typing` event
    pub fn typing(user_id: impl Into<String>, room_id: impl Into<String>, is_typing: bool) -> Self {
        Self::Typing(TypingSignal {
            user_id: user_id.into(),
            room_id: room_id.into(),
            is_typing,
        })
    }

    /// Build a `Presence` event
    pub fn presence(user_id: impl Into<String>, online: bool) -> Self {
        Self::Presence(PresenceSignal {
            user_id: user_id.into(),
            online,
        })
    }

    /// Build a `Control` event
    pub fn control(action: ControlAction, room_id: impl Into<String>) -> Self {
        Self::Control(ControlSignal {
            action,
            room_id: room_id.into(),
        })
    }

    /// Wire discriminator of this event
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Typing(_) => "typing",
            Self::Presence(_) => "presence",
            Self::Control(_) => "control",
        }
    }

    /// Variant-specific validation
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidArgument` for a `Message` with missing
    /// required fields. The other variants always pass.
    pub fn validate(&self) -> Result<(), RelayError> {
        match self {
            Self::Message(msg) => msg.validate(),
            Self::Typing(_) | Self::Presence(_) | Self::Control(_) => Ok(()),
        }
    }

    /// Room this event refers to, if any
    #[must_use]
    pub fn room_id(&self) -> Option<&str> {
        match self {
            Self::Message(msg) => Some(&msg.room_id),
            Self::Typing(t) => Some(&t.room_id),
            Self::Control(c) => Some(&c.room_id),
            Self::Presence(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_validate_requires_room_id() {
        let msg = ChatMessage::new("", "ana", "hi");
        let err = msg.validate().unwrap_err();
        assert!(matches!(err, RelayError::InvalidArgument(ref m) if m.contains("room_id")));
    }

    #[test]
    fn test_validate_requires_sender_id() {
        let msg = ChatMessage::new("lobby", "", "hi");
        let err = msg.validate().unwrap_err();
        assert!(matches!(err, RelayError::InvalidArgument(ref m) if m.contains("sender_id")));
    }

    #[test]
    fn test_validate_accepts_whitespace_ids() {
        assert!(ChatMessage::new(" ", "ana", "hi").validate().is_ok());
        assert!(ChatMessage::new("lobby", "\t", "hi").validate().is_ok());
    }

    #[test]
    fn test_finalize_assigns_missing_fields() {
        let msg = ChatMessage::new("lobby", "ana", "hi").finalize().unwrap();
        assert!(msg.is_finalized());
        assert!(Uuid::parse_str(&msg.id).is_ok());
    }

    #[test]
    fn test_finalize_keeps_explicit_fields() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let msg = ChatMessage::new("lobby", "ana", "hi")
            .with_id("msg-1")
            .with_created_at(at)
            .finalize()
            .unwrap();
        assert_eq!(msg.id, "msg-1");
        assert_eq!(msg.created_at, Some(at));
    }

    #[test]
    fn test_finalize_invalid_assigns_nothing() {
        let result = ChatMessage::new("lobby", "", "hi").finalize();
        assert!(result.is_err());
    }

    #[test]
    fn test_wire_format_is_type_and_data() {
        let event = StreamEvent::typing("ana", "lobby", true);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "typing",
                "data": {"user_id": "ana", "room_id": "lobby", "is_typing": true}
            })
        );
    }

    #[test]
    fn test_message_decodes_without_server_fields() {
        let raw = r#"{"type":"message","data":{"room_id":"lobby","sender_id":"ana","text":"hi"}}"#;
        let event: StreamEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event, StreamEvent::Message(ChatMessage::new("lobby", "ana", "hi")));
    }

    #[test]
    fn test_unknown_control_action_is_unspecified() {
        let raw = r#"{"type":"control","data":{"action":"kick","room_id":"lobby"}}"#;
        let event: StreamEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event, StreamEvent::control(ControlAction::Unspecified, "lobby"));
    }

    #[test]
    fn test_unknown_event_type_fails_to_decode() {
        let raw = r#"{"type":"reaction","data":{"emoji":"+1"}}"#;
        assert!(serde_json::from_str::<StreamEvent>(raw).is_err());
    }

    #[test]
    fn test_only_messages_are_validated() {
        assert!(StreamEvent::presence("", false).validate().is_ok());
        assert!(StreamEvent::typing("", "", true).validate().is_ok());
        assert!(StreamEvent::Message(ChatMessage::new("", "", "")).validate().is_err());
    }

    #[test]
    fn test_kind_and_room() {
        let event = StreamEvent::control(ControlAction::Join, "lobby");
        assert_eq!(event.kind(), "control");
        assert_eq!(event.room_id(), Some("lobby"));
        assert_eq!(StreamEvent::presence("ana", true).room_id(), None);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Message, ReadMarker, TypingSignal};

/// Frames sent FROM client TO the realtime broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    /// Authenticate the connection. Must be the first frame.
    Identify { token: String },

    /// Start receiving events for a conversation channel
    Join { conversation_id: String },

    /// Stop receiving events for a conversation channel
    Leave { conversation_id: String },

    /// Post a message; the broker persists it and fans it out to every member,
    /// the sender included.
    Message {
        conversation_id: String,
        text: String,
        timestamp: DateTime<Utc>,
    },

    /// Typing presence for the sending user
    Typing {
        conversation_id: String,
        is_typing: bool,
    },

    /// Read marker for the sending user
    Read {
        conversation_id: String,
        at: DateTime<Utc>,
    },
}

impl ClientCommand {
    /// Returns the conversation this command is scoped to, if any.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::Identify { .. } => None,
            Self::Join { conversation_id }
            | Self::Leave { conversation_id }
            | Self::Message { conversation_id, .. }
            | Self::Typing { conversation_id, .. }
            | Self::Read { conversation_id, .. } => Some(conversation_id),
        }
    }
}

/// Frames sent FROM the broker TO the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Broker accepted the `identify` frame
    Ready { user_id: String },

    /// A message was posted in a conversation channel
    Message(Message),

    /// A participant started or stopped typing
    Typing(TypingSignal),

    /// A participant advanced their read marker
    Read(ReadMarker),

    /// Broker-side error (bad frame, rejected token, ...)
    Error { message: String },
}

impl ServerEvent {
    /// Returns the conversation this event is scoped to, if any.
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::Message(message) => Some(&message.conversation_id),
            Self::Typing(signal) => Some(&signal.conversation_id),
            Self::Read(marker) => Some(&marker.conversation_id),
            Self::Ready { .. } | Self::Error { .. } => None,
        }
    }
}

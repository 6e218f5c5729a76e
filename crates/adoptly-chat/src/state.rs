use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use adoptly_types::models::{Conversation, Message, ReadMarker, UserProfile};

/// What the front end renders for one open conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSnapshot {
    pub conversation_id: String,
    pub me: String,
    pub messages: Vec<Message>,
    pub self_conversation: bool,
    pub counterpart: Option<UserProfile>,
    /// Metadata endpoint failed or does not exist; history still loaded.
    pub metadata_unavailable: bool,
    pub peer_typing: bool,
    /// Newest own message the other side has read up to.
    pub seen_message_id: Option<String>,
    pub connected: bool,
}

/// Pure per-conversation state of a loaded conversation. All timing and I/O
/// live in the view.
#[derive(Debug, Clone)]
pub struct ConversationState {
    conversation_id: String,
    me: String,
    messages: Vec<Message>,
    metadata: Option<Conversation>,
    metadata_unavailable: bool,
    peer_typing: Option<String>,
    peer_read_at: Option<DateTime<Utc>>,
    last_read_sent: Option<DateTime<Utc>>,
    last_read_persisted: Option<DateTime<Utc>>,
    connected: bool,
}

impl ConversationState {
    pub fn new(conversation_id: impl Into<String>, me: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            me: me.into(),
            messages: Vec::new(),
            metadata: None,
            metadata_unavailable: false,
            peer_typing: None,
            peer_read_at: None,
            last_read_sent: None,
            last_read_persisted: None,
            connected: false,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// History arrived. Messages keep the order the server returned them in.
    pub fn loaded(&mut self, history: Vec<Message>, metadata: Option<Conversation>) {
        self.metadata_unavailable = metadata.is_none();
        self.metadata = metadata;
        self.messages.clear();
        for message in history {
            self.append(message);
        }
    }

    /// Appends in arrival order. Messages for other conversations and repeated
    /// ids are ignored.
    pub fn append(&mut self, message: Message) -> bool {
        if message.conversation_id != self.conversation_id {
            return false;
        }
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Keeps a peer's read marker only if it moves forward.
    pub fn apply_read(&mut self, marker: &ReadMarker) -> bool {
        if marker.conversation_id != self.conversation_id || marker.user_id == self.me {
            return false;
        }
        if self.peer_read_at.is_some_and(|at| marker.at <= at) {
            return false;
        }
        self.peer_read_at = Some(marker.at);
        true
    }

    pub fn set_peer_typing(&mut self, user_id: Option<String>) {
        self.peer_typing = user_id;
    }

    pub fn peer_typing(&self) -> Option<&str> {
        self.peer_typing.as_deref()
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Metadata participants decide when present; otherwise every sender and
    /// recipient seen in history must be the current user.
    pub fn is_self_conversation(&self) -> bool {
        if let Some(answer) = self
            .metadata
            .as_ref()
            .and_then(|c| c.is_self_conversation(&self.me))
        {
            return answer;
        }

        let ids: BTreeSet<&str> = self
            .messages
            .iter()
            .flat_map(|m| std::iter::once(m.sender_id.as_str()).chain(m.recipient_id.as_deref()))
            .collect();
        !ids.is_empty() && ids.iter().all(|id| *id == self.me)
    }

    /// The other participant: from metadata, else the other side of the last
    /// message.
    pub fn counterpart(&self) -> Option<UserProfile> {
        if let Some(profile) = self.metadata.as_ref().and_then(|c| c.counterpart(&self.me)) {
            return Some(profile);
        }
        let last = self.messages.last()?;
        let other = if last.sender_id != self.me {
            Some(last.sender_id.as_str())
        } else {
            last.recipient_id.as_deref().filter(|id| *id != self.me)
        };
        other.map(|id| UserProfile {
            id: id.to_string(),
            username: None,
        })
    }

    /// Creation time of the newest message, when someone else wrote it.
    fn unread_marker(&self) -> Option<DateTime<Utc>> {
        let newest = self.messages.last()?;
        (newest.sender_id != self.me).then_some(newest.created_at)
    }

    /// Marker still to broadcast: newer than the last one that actually went
    /// out on the channel.
    pub fn pending_read_broadcast(&self) -> Option<DateTime<Utc>> {
        let at = self.unread_marker()?;
        (!self.last_read_sent.is_some_and(|sent| at <= sent)).then_some(at)
    }

    pub fn read_broadcast_sent(&mut self, at: DateTime<Utc>) {
        if !self.last_read_sent.is_some_and(|sent| at <= sent) {
            self.last_read_sent = Some(at);
        }
    }

    /// Marker to store on the server, recorded as handed off. Storage is
    /// independent of the channel being up.
    pub fn take_read_to_persist(&mut self) -> Option<DateTime<Utc>> {
        let at = self.unread_marker()?;
        if self.last_read_persisted.is_some_and(|done| at <= done) {
            return None;
        }
        self.last_read_persisted = Some(at);
        Some(at)
    }

    /// Newest own message, if the peer has read up to it.
    pub fn seen_message_id(&self) -> Option<&str> {
        let seen_at = self.peer_read_at?;
        let own = self.messages.iter().rev().find(|m| m.sender_id == self.me)?;
        (own.created_at <= seen_at).then_some(own.id.as_str())
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            conversation_id: self.conversation_id.clone(),
            me: self.me.clone(),
            messages: self.messages.clone(),
            self_conversation: self.is_self_conversation(),
            counterpart: self.counterpart(),
            metadata_unavailable: self.metadata_unavailable,
            peer_typing: self.peer_typing.is_some(),
            seen_message_id: self.seen_message_id().map(str::to_string),
            connected: self.connected,
        }
    }
}

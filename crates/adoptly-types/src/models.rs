use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Access/refresh token pair persisted by the credential store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl CredentialPair {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
        }
    }

    /// An empty access token counts as "no credential".
    pub fn is_authenticated(&self) -> bool {
        !self.access_token.is_empty()
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }
}

/// Public profile fields of a user, as embedded in conversations and messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// A user reference on the wire: either a bare id or a populated profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserRef {
    Id(String),
    Profile(UserProfile),
}

impl UserRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Profile(profile) => &profile.id,
        }
    }

    pub fn to_profile(&self) -> UserProfile {
        match self {
            Self::Id(id) => UserProfile {
                id: id.clone(),
                username: None,
            },
            Self::Profile(profile) => profile.clone(),
        }
    }
}

fn user_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    UserRef::deserialize(deserializer).map(|r| r.id().to_string())
}

fn optional_user_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<UserRef>::deserialize(deserializer).map(|r| r.map(|r| r.id().to_string()))
}

/// Conversation metadata. Created server-side, read-only on the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default, alias = "participantIds")]
    pub participants: Vec<UserRef>,
}

impl Conversation {
    pub fn participant_ids(&self) -> BTreeSet<&str> {
        self.participants.iter().map(UserRef::id).collect()
    }

    /// `None` when the participant list is empty and nothing can be concluded.
    pub fn is_self_conversation(&self, me: &str) -> Option<bool> {
        let ids = self.participant_ids();
        if ids.is_empty() {
            return None;
        }
        Some(ids.len() == 1 && ids.contains(me))
    }

    /// First participant that is not `me`.
    pub fn counterpart(&self, me: &str) -> Option<UserProfile> {
        self.participants
            .iter()
            .find(|p| p.id() != me)
            .map(UserRef::to_profile)
    }
}

/// A chat message. Local history keeps these in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(alias = "conversation")]
    pub conversation_id: String,
    #[serde(alias = "sender", deserialize_with = "user_id")]
    pub sender_id: String,
    #[serde(
        default,
        alias = "recipient",
        deserialize_with = "optional_user_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub recipient_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(alias = "timestamp")]
    pub created_at: DateTime<Utc>,
}

/// Transient typing presence. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub conversation_id: String,
    pub user_id: String,
    pub is_typing: bool,
}

/// Latest timestamp up to which `user_id` has viewed the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadMarker {
    pub conversation_id: String,
    pub user_id: String,
    pub at: DateTime<Utc>,
}

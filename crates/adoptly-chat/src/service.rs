use std::time::Duration;

use tracing::{debug, info, warn};

use adoptly_realtime::ChannelClient;
use adoptly_session::claims::token_subject;
use adoptly_session::ApiClient;
use adoptly_types::api::ApiPayload;
use adoptly_types::models::{Conversation, Message};

use crate::error::ChatError;
use crate::state::ConversationState;
use crate::view::ConversationView;

#[derive(Debug, Clone, Copy)]
pub struct ChatConfig {
    /// Quiet period after the last keystroke before `isTyping:false` is sent.
    pub typing_idle: Duration,
    /// How long a peer's typing indicator stays up without a refresh.
    pub peer_typing_ttl: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            typing_idle: Duration::from_millis(1000),
            peer_typing_ttl: Duration::from_millis(1500),
        }
    }
}

/// Opens conversations on top of the shared request and channel clients.
#[derive(Clone)]
pub struct ChatService {
    api: ApiClient,
    channel: ChannelClient,
    config: ChatConfig,
}

/// Ids are path segments; anything else is rejected before a request is made.
pub fn is_valid_conversation_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Sign-in location that brings the user back to `conversation_id`.
pub fn login_redirect(conversation_id: &str) -> String {
    let target = format!("/chat/{}", conversation_id);
    let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
    format!("/login?redirect={}", encoded)
}

impl ChatService {
    pub fn new(api: ApiClient, channel: ChannelClient, config: ChatConfig) -> Self {
        Self {
            api,
            channel,
            config,
        }
    }

    pub fn channel(&self) -> &ChannelClient {
        &self.channel
    }

    /// Loads a conversation and starts following it.
    ///
    /// History is required, metadata is best effort. Dropping the returned
    /// future abandons both fetches.
    pub async fn open(&self, conversation_id: &str) -> Result<ConversationView, ChatError> {
        if !is_valid_conversation_id(conversation_id) {
            return Err(ChatError::InvalidConversation(conversation_id.to_string()));
        }

        let pair = self.api.session().ensure_credential().await.map_err(|e| {
            info!("Cannot open {} without a session: {}", conversation_id, e);
            ChatError::Unauthenticated {
                redirect: login_redirect(conversation_id),
            }
        })?;
        let me = token_subject(&pair.access_token).ok_or(ChatError::UnknownUser)?;

        let (history, metadata) = tokio::join!(
            self.fetch_history(conversation_id),
            self.fetch_metadata(conversation_id)
        );
        let history = history?;

        let mut state = ConversationState::new(conversation_id, me);
        state.loaded(history, metadata);
        info!(
            "Opened conversation {} ({} messages)",
            conversation_id,
            state.messages().len()
        );

        // Subscribe before joining so nothing published after the join is missed.
        let events = self.channel.subscribe();
        self.channel.join(conversation_id);
        self.channel.connect();

        Ok(ConversationView::start(
            state,
            events,
            self.channel.clone(),
            self.api.clone(),
            self.config,
        ))
    }

    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<Message>, ChatError> {
        let path = format!("/conversations/{}/messages", conversation_id);
        let payload = self
            .api
            .get_json::<ApiPayload<Vec<Message>>>(&path)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    return ChatError::NotFound;
                }
                warn!("History for {} failed to load: {}", conversation_id, e);
                ChatError::HistoryLoadFailed(e.to_string())
            })?;

        if !payload.succeeded() {
            return Err(ChatError::HistoryLoadFailed("server reported failure".into()));
        }
        Ok(payload.into_data().unwrap_or_default())
    }

    async fn fetch_metadata(&self, conversation_id: &str) -> Option<Conversation> {
        let path = format!("/conversations/{}", conversation_id);
        match self.api.get_json::<ApiPayload<Conversation>>(&path).await {
            Ok(payload) if payload.succeeded() => payload.into_data(),
            Ok(_) => {
                debug!("Metadata for {} unavailable: server reported failure", conversation_id);
                None
            }
            Err(e) => {
                debug!("Metadata for {} unavailable: {}", conversation_id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_validation() {
        assert!(is_valid_conversation_id("64f0c1a2b3"));
        assert!(is_valid_conversation_id("dm_alice-bob"));
        assert!(!is_valid_conversation_id(""));
        assert!(!is_valid_conversation_id("../etc"));
        assert!(!is_valid_conversation_id("a b"));
        assert!(!is_valid_conversation_id("c1?x=1"));
    }

    #[test]
    fn redirect_preserves_destination() {
        assert_eq!(login_redirect("c1"), "/login?redirect=%2Fchat%2Fc1");
    }
}

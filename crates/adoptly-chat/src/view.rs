use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use adoptly_realtime::{ChannelClient, ChannelEvent};
use adoptly_session::ApiClient;
use adoptly_types::api::MarkReadRequest;
use adoptly_types::events::ClientCommand;
use adoptly_types::models::TypingSignal;

use crate::error::ChatError;
use crate::service::ChatConfig;
use crate::state::{ConversationSnapshot, ConversationState};
use crate::timer::ScheduledTask;

/// A live, open conversation.
///
/// Inbound events are handled by one pump task, so they apply in the order
/// the channel client delivered them. Dropping the view (or `close`) stops
/// the pump, cancels its timers and leaves the channel.
pub struct ConversationView {
    shared: Arc<ViewShared>,
    pump: AbortHandle,
}

struct ViewShared {
    conversation_id: String,
    config: ChatConfig,
    channel: ChannelClient,
    api: ApiClient,
    inner: Mutex<ViewInner>,
    snapshots: watch::Sender<ConversationSnapshot>,
}

struct ViewInner {
    state: ConversationState,
    /// A local typing burst is in progress (`isTyping:true` was sent).
    typing: bool,
    typing_generation: u64,
    idle_timer: Option<ScheduledTask>,
    peer_generation: u64,
    peer_timer: Option<ScheduledTask>,
    closed: bool,
}

impl ConversationView {
    pub(crate) fn start(
        state: ConversationState,
        events: broadcast::Receiver<ChannelEvent>,
        channel: ChannelClient,
        api: ApiClient,
        config: ChatConfig,
    ) -> Self {
        let (snapshots, _) = watch::channel(state.snapshot());
        let shared = Arc::new(ViewShared {
            conversation_id: state.conversation_id().to_string(),
            config,
            channel,
            api,
            inner: Mutex::new(ViewInner {
                state,
                typing: false,
                typing_generation: 0,
                idle_timer: None,
                peer_generation: 0,
                peer_timer: None,
                closed: false,
            }),
            snapshots,
        });

        {
            let mut inner = shared.lock();
            let connected = shared.channel.is_connected();
            inner.state.set_connected(connected);
            shared.mark_read(&mut inner);
            shared.publish(&inner);
        }

        let pump = tokio::spawn(shared.clone().pump(events)).abort_handle();
        Self { shared, pump }
    }

    pub fn conversation_id(&self) -> &str {
        &self.shared.conversation_id
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.shared.snapshots.borrow().clone()
    }

    /// Snapshots published after every state change.
    pub fn watch(&self) -> watch::Receiver<ConversationSnapshot> {
        self.shared.snapshots.subscribe()
    }

    /// Sends `text` through the broker. The message is not appended locally;
    /// it arrives back like any other.
    pub fn send(&self, text: &str) -> Result<(), ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let mut inner = self.shared.lock();
        if inner.state.is_self_conversation() {
            return Err(ChatError::SelfConversation);
        }
        if inner.closed || !self.shared.channel.is_connected() {
            return Err(ChatError::TransportDisconnected);
        }

        self.shared
            .channel
            .send(ClientCommand::Message {
                conversation_id: self.shared.conversation_id.clone(),
                text: text.to_string(),
                timestamp: Utc::now(),
            })
            .map_err(|_| ChatError::TransportDisconnected)?;

        self.shared.stop_typing(&mut inner);
        Ok(())
    }

    /// The compose input changed.
    pub fn input_changed(&self) {
        let mut inner = self.shared.lock();
        if inner.closed || inner.state.is_self_conversation() || !self.shared.channel.is_connected() {
            return;
        }

        if !inner.typing {
            inner.typing = true;
            self.shared.send_typing(true);
        }

        inner.typing_generation += 1;
        let generation = inner.typing_generation;
        let shared = self.shared.clone();
        // Replacing the handle cancels the previous timer.
        inner.idle_timer = Some(ScheduledTask::after(self.shared.config.typing_idle, move || {
            shared.typing_idle_expired(generation);
        }));
    }

    /// The compose input lost focus.
    pub fn blur(&self) {
        let mut inner = self.shared.lock();
        self.shared.stop_typing(&mut inner);
    }

    /// Same as dropping the view.
    pub fn close(self) {}

    fn teardown(&self) {
        self.pump.abort();
        let mut inner = self.shared.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        self.shared.stop_typing(&mut inner);
        inner.peer_timer = None;
        drop(inner);

        self.shared.channel.leave(&self.shared.conversation_id);
        debug!("Closed conversation {}", self.shared.conversation_id);
    }
}

impl Drop for ConversationView {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl ViewShared {
    fn lock(&self) -> MutexGuard<'_, ViewInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, inner: &ViewInner) {
        self.snapshots.send_replace(inner.state.snapshot());
    }

    async fn pump(self: Arc<Self>, mut events: broadcast::Receiver<ChannelEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Conversation {} missed {} realtime events", self.conversation_id, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn handle(self: &Arc<Self>, event: ChannelEvent) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }

        match event {
            ChannelEvent::Message(message) => {
                if !inner.state.append(message) {
                    return;
                }
                self.mark_read(&mut inner);
            }
            ChannelEvent::Typing(signal) => {
                if !self.apply_peer_typing(&mut inner, signal) {
                    return;
                }
            }
            ChannelEvent::Read(marker) => {
                if !inner.state.apply_read(&marker) {
                    return;
                }
                trace!("Peer read {} up to {}", marker.conversation_id, marker.at);
            }
            ChannelEvent::Connected | ChannelEvent::Reconnected => {
                inner.state.set_connected(true);
                self.mark_read(&mut inner);
            }
            ChannelEvent::Disconnected { .. } => {
                inner.state.set_connected(false);
                // Nothing can be sent; the burst is over.
                inner.typing = false;
                inner.idle_timer = None;
            }
            ChannelEvent::Error { message } => {
                debug!("Realtime error while in {}: {}", self.conversation_id, message);
                return;
            }
        }

        self.publish(&inner);
    }

    /// Returns whether anything visible changed.
    fn apply_peer_typing(self: &Arc<Self>, inner: &mut ViewInner, signal: TypingSignal) -> bool {
        if signal.conversation_id != self.conversation_id || signal.user_id == inner.state.me() {
            return false;
        }

        inner.peer_generation += 1;
        if signal.is_typing {
            let generation = inner.peer_generation;
            let shared = self.clone();
            inner.peer_timer = Some(ScheduledTask::after(self.config.peer_typing_ttl, move || {
                shared.peer_typing_expired(generation);
            }));
            inner.state.set_peer_typing(Some(signal.user_id));
        } else {
            inner.peer_timer = None;
            inner.state.set_peer_typing(None);
        }
        true
    }

    fn peer_typing_expired(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.closed || inner.peer_generation != generation {
            return;
        }
        if let Some(timer) = inner.peer_timer.take() {
            timer.disarm();
        }
        inner.state.set_peer_typing(None);
        self.publish(&inner);
    }

    fn typing_idle_expired(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.closed || inner.typing_generation != generation || !inner.typing {
            return;
        }
        if let Some(timer) = inner.idle_timer.take() {
            timer.disarm();
        }
        inner.typing = false;
        self.send_typing(false);
    }

    fn stop_typing(&self, inner: &mut ViewInner) {
        inner.typing_generation += 1;
        inner.idle_timer = None;
        if inner.typing {
            inner.typing = false;
            self.send_typing(false);
        }
    }

    fn send_typing(&self, is_typing: bool) {
        let command = ClientCommand::Typing {
            conversation_id: self.conversation_id.clone(),
            is_typing,
        };
        if let Err(e) = self.channel.send(command) {
            trace!("Typing signal dropped: {}", e);
        }
    }

    /// Advance our read marker if the newest message is someone else's.
    /// The broadcast counts only once the channel took it; until then it is
    /// retried on the next connect.
    fn mark_read(&self, inner: &mut ViewInner) {
        if let Some(at) = inner.state.pending_read_broadcast() {
            let sent = self.channel.send(ClientCommand::Read {
                conversation_id: self.conversation_id.clone(),
                at,
            });
            match sent {
                Ok(()) => inner.state.read_broadcast_sent(at),
                Err(e) => trace!("Read broadcast deferred: {}", e),
            }
        }

        if let Some(at) = inner.state.take_read_to_persist() {
            self.persist_read(at);
        }
    }

    fn persist_read(&self, at: DateTime<Utc>) {
        let api = self.api.clone();
        let path = format!("/conversations/{}/read", self.conversation_id);
        tokio::spawn(async move {
            if let Err(e) = api.post_json(&path, &MarkReadRequest { at }).await {
                debug!("Failed to persist read marker: {}", e);
            }
        });
    }
}


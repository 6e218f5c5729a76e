use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use adoptly_session::claims::token_subject;

use adoptly_types::events::{ClientCommand, ServerEvent};
use adoptly_types::models::{Message, ReadMarker, TypingSignal};

use crate::error::RealtimeError;
use crate::transport::{AuthPayload, Link, Transport};

/// Commands kept for inspection; older ones are discarded.
pub const COMMAND_LOG_LIMIT: usize = 1024;

/// In-process broker speaking the same protocol as the WebSocket server.
///
/// Used for offline runs and tests. Messages fan out to every member of the
/// conversation channel, the sender included; typing and read signals go to
/// everyone else.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    /// token -> user id
    tokens: HashMap<String, String>,
    links: HashMap<u64, LinkState>,
    next_link: u64,
    next_message: u64,
    refuse_connects: usize,
    connect_count: usize,
    commands: VecDeque<(String, ClientCommand)>,
    trust_claims: bool,
}

struct LinkState {
    user_id: String,
    tx: mpsc::UnboundedSender<ServerEvent>,
    channels: BTreeSet<String>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept `token` as the credential of `user_id`.
    pub fn authorize(&self, token: impl Into<String>, user_id: impl Into<String>) {
        self.state().tokens.insert(token.into(), user_id.into());
    }

    pub fn revoke(&self, token: &str) {
        self.state().tokens.remove(token);
    }

    /// Fail the next `n` connect attempts as if the broker were unreachable.
    pub fn refuse_next_connects(&self, n: usize) {
        self.state().refuse_connects = n;
    }

    /// Close every live link, as a broker restart would.
    pub fn drop_all(&self) {
        let dropped = std::mem::take(&mut self.state().links);
        debug!("Memory broker dropped {} links", dropped.len());
    }

    /// Connect attempts seen so far, refused ones included.
    pub fn connect_count(&self) -> usize {
        self.state().connect_count
    }

    pub fn live_links(&self) -> usize {
        self.state().links.len()
    }

    /// The most recent commands received (up to `COMMAND_LOG_LIMIT`), with
    /// the id of the user that sent each.
    pub fn commands(&self) -> Vec<(String, ClientCommand)> {
        self.state().commands.iter().cloned().collect()
    }

    /// Accept any token whose claims name a user, as the server would after
    /// checking the signature. Keeps offline runs signed in across rotations.
    pub fn trust_token_claims(&self) {
        self.state().trust_claims = true;
    }

    /// Users with at least one live link joined to `conversation_id`.
    pub fn members(&self, conversation_id: &str) -> BTreeSet<String> {
        self.state()
            .links
            .values()
            .filter(|link| link.channels.contains(conversation_id))
            .map(|link| link.user_id.clone())
            .collect()
    }

    /// Push an event to the members of its conversation channel.
    pub fn publish(&self, event: ServerEvent) {
        let state = self.state();
        let Some(conversation_id) = event.conversation_id() else {
            return;
        };
        for link in state.links.values() {
            if link.channels.contains(conversation_id) {
                let _ = link.tx.send(event.clone());
            }
        }
    }

    /// Push an event to every live link, joined or not.
    pub fn deliver_to_all(&self, event: ServerEvent) {
        for link in self.state().links.values() {
            let _ = link.tx.send(event.clone());
        }
    }

    fn handle(&self, link_id: u64, command: ClientCommand) {
        let mut state = self.state();
        let Some(user_id) = state.links.get(&link_id).map(|l| l.user_id.clone()) else {
            return;
        };
        trace!("Memory broker <- {}: {:?}", user_id, command);
        if state.commands.len() == COMMAND_LOG_LIMIT {
            state.commands.pop_front();
        }
        state.commands.push_back((user_id.clone(), command.clone()));

        match command {
            ClientCommand::Identify { .. } => {}
            ClientCommand::Join { conversation_id } => {
                if let Some(link) = state.links.get_mut(&link_id) {
                    link.channels.insert(conversation_id);
                }
            }
            ClientCommand::Leave { conversation_id } => {
                if let Some(link) = state.links.get_mut(&link_id) {
                    link.channels.remove(&conversation_id);
                }
            }
            ClientCommand::Message {
                conversation_id,
                text,
                timestamp,
            } => {
                state.next_message += 1;
                let event = ServerEvent::Message(Message {
                    id: format!("m{}", state.next_message),
                    conversation_id: conversation_id.clone(),
                    sender_id: user_id,
                    recipient_id: None,
                    text,
                    created_at: timestamp,
                });
                state.fan_out(&conversation_id, None, &event);
            }
            ClientCommand::Typing {
                conversation_id,
                is_typing,
            } => {
                let event = ServerEvent::Typing(TypingSignal {
                    conversation_id: conversation_id.clone(),
                    user_id,
                    is_typing,
                });
                state.fan_out(&conversation_id, Some(link_id), &event);
            }
            ClientCommand::Read { conversation_id, at } => {
                let event = ServerEvent::Read(ReadMarker {
                    conversation_id: conversation_id.clone(),
                    user_id,
                    at,
                });
                state.fan_out(&conversation_id, Some(link_id), &event);
            }
        }
    }
}

impl BrokerState {
    fn fan_out(&self, conversation_id: &str, except: Option<u64>, event: &ServerEvent) {
        for (id, link) in &self.links {
            if Some(*id) != except && link.channels.contains(conversation_id) {
                let _ = link.tx.send(event.clone());
            }
        }
    }
}

impl Transport for MemoryBroker {
    fn connect(&self, auth: AuthPayload) -> BoxFuture<'static, Result<Link, RealtimeError>> {
        let broker = self.clone();
        async move {
            let (link_id, user_id, in_rx) = {
                let mut state = broker.state();
                state.connect_count += 1;
                if state.refuse_connects > 0 {
                    state.refuse_connects -= 1;
                    return Err(RealtimeError::Connect("connection refused".into()));
                }
                let user_id = match state.tokens.get(&auth.token) {
                    Some(user_id) => Some(user_id.clone()),
                    None if state.trust_claims => token_subject(&auth.token),
                    None => None,
                };
                let Some(user_id) = user_id else {
                    return Err(RealtimeError::Rejected("invalid token".into()));
                };

                state.next_link += 1;
                let link_id = state.next_link;
                let (tx, in_rx) = mpsc::unbounded_channel();
                state.links.insert(
                    link_id,
                    LinkState {
                        user_id: user_id.clone(),
                        tx,
                        channels: BTreeSet::new(),
                    },
                );
                (link_id, user_id, in_rx)
            };

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientCommand>();
            let pump = broker.clone();
            tokio::spawn(async move {
                while let Some(command) = out_rx.recv().await {
                    pump.handle(link_id, command);
                }
                pump.state().links.remove(&link_id);
                trace!("Memory broker link {} closed", link_id);
            });

            debug!("Memory broker accepted {} on link {}", user_id, link_id);
            Ok(Link {
                user_id,
                outbound: out_tx,
                inbound: in_rx,
            })
        }
        .boxed()
    }
}

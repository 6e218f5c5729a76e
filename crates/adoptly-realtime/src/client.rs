use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, trace, warn};

use adoptly_session::{SessionCoordinator, SessionEvent};
use adoptly_types::events::{ClientCommand, ServerEvent};
use adoptly_types::models::{Message, ReadMarker, TypingSignal};

use crate::backoff::ReconnectPolicy;
use crate::error::RealtimeError;
use crate::transport::{AuthPayload, Link, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// What subscribers of the channel client see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message(Message),
    Typing(TypingSignal),
    Read(ReadMarker),
    Connected,
    Reconnected,
    Disconnected { reason: String },
    Error { message: String },
}

enum Control {
    Connect,
    Disconnect,
    Shutdown,
}

/// Everything the driver can be woken by besides the link itself.
enum Signal {
    Connect,
    Disconnect,
    Shutdown,
    Rotated,
    SignedOut,
}

#[derive(PartialEq, Eq)]
enum Exit {
    Idle,
    Shutdown,
}

enum Attempt {
    Linked(Link),
    Failed(RealtimeError),
    Restart,
    Exit(Exit),
}

enum PumpEnd {
    Lost(String),
    Rotated,
    Exit(Exit, String),
}

struct Shared {
    /// Conversations the caller wants to be in, replayed on every connect.
    joined: Mutex<BTreeSet<String>>,
    /// Outbound half of the live link, if any. Lock order: `joined`, then `link`.
    link: Mutex<Option<mpsc::UnboundedSender<ClientCommand>>>,
    wanted: AtomicBool,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ChannelEvent>,
}

impl Shared {
    fn joined(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.joined.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn link(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<ClientCommand>>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!("Realtime state -> {:?}", next);
        }
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn deliver(&self, event: ServerEvent) {
        match event {
            ServerEvent::Message(message) => {
                if self.joined().contains(&message.conversation_id) {
                    self.emit(ChannelEvent::Message(message));
                } else {
                    trace!("Discarding message for unjoined conversation {}", message.conversation_id);
                }
            }
            ServerEvent::Typing(signal) => self.emit(ChannelEvent::Typing(signal)),
            ServerEvent::Read(marker) => self.emit(ChannelEvent::Read(marker)),
            ServerEvent::Error { message } => {
                warn!("Broker error: {}", message);
                self.emit(ChannelEvent::Error { message });
            }
            ServerEvent::Ready { .. } => trace!("Ignoring repeated ready"),
        }
    }
}

/// The single realtime connection of the process.
///
/// Cheap to clone. The connection is owned by a driver task that
/// authenticates with the session's current credential on every (re)connect,
/// replays joins, and reconnects when the credential rotates. Dropping the
/// last clone stops the driver.
#[derive(Clone)]
pub struct ChannelClient {
    shared: Arc<Shared>,
    control: mpsc::UnboundedSender<Control>,
}

impl ChannelClient {
    /// Must be called inside a tokio runtime.
    pub fn new(
        session: SessionCoordinator,
        transport: Arc<dyn Transport>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(256);
        let (control, control_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            joined: Mutex::new(BTreeSet::new()),
            link: Mutex::new(None),
            wanted: AtomicBool::new(false),
            state,
            events,
        });

        let driver = Driver {
            shared: shared.clone(),
            session_events: session.subscribe(),
            session,
            transport,
            policy,
            control: control_rx,
        };
        tokio::spawn(driver.run());

        Self { shared, control }
    }

    /// Ask for a live connection. Idempotent.
    pub fn connect(&self) {
        if !self.shared.wanted.swap(true, Ordering::SeqCst) {
            let _ = self.control.send(Control::Connect);
        }
    }

    /// Close the connection and stop reconnecting. Idempotent.
    pub fn disconnect(&self) {
        if self.shared.wanted.swap(false, Ordering::SeqCst) {
            let _ = self.control.send(Control::Disconnect);
        }
    }

    /// Stops the driver for good.
    pub fn shutdown(&self) {
        self.shared.wanted.store(false, Ordering::SeqCst);
        let _ = self.control.send(Control::Shutdown);
    }

    /// Track `conversation_id`; sends `join` now if live, otherwise on the
    /// next connect.
    pub fn join(&self, conversation_id: &str) {
        let mut joined = self.shared.joined();
        if !joined.insert(conversation_id.to_string()) {
            return;
        }
        if let Some(link) = self.shared.link().as_ref() {
            let _ = link.send(ClientCommand::Join {
                conversation_id: conversation_id.to_string(),
            });
        }
        debug!("Joined conversation {}", conversation_id);
    }

    pub fn leave(&self, conversation_id: &str) {
        let mut joined = self.shared.joined();
        if !joined.remove(conversation_id) {
            return;
        }
        if let Some(link) = self.shared.link().as_ref() {
            let _ = link.send(ClientCommand::Leave {
                conversation_id: conversation_id.to_string(),
            });
        }
        debug!("Left conversation {}", conversation_id);
    }

    pub fn joined(&self) -> Vec<String> {
        self.shared.joined().iter().cloned().collect()
    }

    /// Fire-and-forget. Nothing is queued while disconnected.
    pub fn send(&self, command: ClientCommand) -> Result<(), RealtimeError> {
        let link = self.shared.link();
        let Some(link) = link.as_ref() else {
            return Err(RealtimeError::Disconnected);
        };
        link.send(command).map_err(|_| RealtimeError::Disconnected)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

struct Driver {
    shared: Arc<Shared>,
    session: SessionCoordinator,
    session_events: broadcast::Receiver<SessionEvent>,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    control: mpsc::UnboundedReceiver<Control>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            if !self.wait_for_connect().await {
                break;
            }
            let exit = self.run_session().await;
            self.shared.set_state(ConnectionState::Disconnected);
            if exit == Exit::Shutdown {
                break;
            }
        }
        self.shared.link().take();
        self.shared.set_state(ConnectionState::Disconnected);
        debug!("Realtime driver stopped");
    }

    async fn wait_for_connect(&mut self) -> bool {
        loop {
            match self.next_signal().await {
                Signal::Connect => return true,
                Signal::Shutdown => return false,
                Signal::Disconnect | Signal::Rotated | Signal::SignedOut => {}
            }
        }
    }

    /// Keeps a link up until asked to stop.
    async fn run_session(&mut self) -> Exit {
        let mut failures: u32 = 0;
        let mut was_live = false;

        loop {
            let Some(pair) = self.session.current() else {
                info!("No credential for realtime connection, staying disconnected");
                self.shared.wanted.store(false, Ordering::SeqCst);
                return Exit::Idle;
            };

            self.shared.set_state(if was_live {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });

            let link = match self.attempt(pair.access_token).await {
                Attempt::Linked(link) => link,
                Attempt::Restart => continue,
                Attempt::Exit(exit) => return exit,
                Attempt::Failed(e) => {
                    warn!("Realtime connect failed: {}", e);
                    self.shared.emit(ChannelEvent::Error {
                        message: e.to_string(),
                    });
                    if matches!(e, RealtimeError::Rejected(_)) {
                        // The broker refused the token; rotation wakes us early.
                        drop(self.session.force_refresh());
                    }
                    let delay = self.policy.delay(failures);
                    failures = failures.saturating_add(1);
                    match self.pause(delay).await {
                        Some(exit) => return exit,
                        None => continue,
                    }
                }
            };

            failures = 0;
            info!(
                "Realtime connected as {}{}",
                link.user_id,
                if was_live { " (reconnect)" } else { "" }
            );
            let end = self.pump(link, was_live).await;
            was_live = true;

            match end {
                PumpEnd::Rotated => {
                    info!("Credential rotated, re-establishing realtime connection");
                    self.shared.emit(ChannelEvent::Disconnected {
                        reason: "credential rotated".into(),
                    });
                }
                PumpEnd::Lost(reason) => {
                    warn!("Realtime connection lost: {}", reason);
                    self.shared.set_state(ConnectionState::Reconnecting);
                    self.shared.emit(ChannelEvent::Disconnected { reason });
                    let delay = self.policy.delay(0);
                    if let Some(exit) = self.pause(delay).await {
                        return exit;
                    }
                }
                PumpEnd::Exit(exit, reason) => {
                    info!("Realtime disconnected: {}", reason);
                    self.shared.emit(ChannelEvent::Disconnected { reason });
                    return exit;
                }
            }
        }
    }

    async fn attempt(&mut self, token: String) -> Attempt {
        let mut connect = self.transport.connect(AuthPayload { token });
        loop {
            tokio::select! {
                result = &mut connect => {
                    return match result {
                        Ok(link) => Attempt::Linked(link),
                        Err(e) => Attempt::Failed(e),
                    };
                }
                signal = self.next_signal() => {
                    if let Some(attempt) = self.interrupt(signal) {
                        return attempt;
                    }
                }
            }
        }
    }

    /// Sleeps out a backoff delay. `None` means try again now.
    async fn pause(&mut self, delay: Duration) -> Option<Exit> {
        trace!("Reconnecting in {:?}", delay);
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                signal = self.next_signal() => match self.interrupt(signal) {
                    Some(Attempt::Exit(exit)) => return Some(exit),
                    Some(_) => return None,
                    None => {}
                },
            }
        }
    }

    fn interrupt(&self, signal: Signal) -> Option<Attempt> {
        match signal {
            Signal::Connect => None,
            Signal::Rotated => Some(Attempt::Restart),
            Signal::Disconnect => Some(Attempt::Exit(Exit::Idle)),
            Signal::Shutdown => Some(Attempt::Exit(Exit::Shutdown)),
            Signal::SignedOut => {
                self.shared.wanted.store(false, Ordering::SeqCst);
                Some(Attempt::Exit(Exit::Idle))
            }
        }
    }

    async fn pump(&mut self, link: Link, reconnect: bool) -> PumpEnd {
        let Link {
            outbound, mut inbound, ..
        } = link;

        {
            let joined = self.shared.joined();
            *self.shared.link() = Some(outbound.clone());
            for conversation_id in joined.iter() {
                let _ = outbound.send(ClientCommand::Join {
                    conversation_id: conversation_id.clone(),
                });
            }
            if !joined.is_empty() {
                debug!("Rejoined {} conversations", joined.len());
            }
        }

        self.shared.set_state(ConnectionState::Connected);
        self.shared.emit(if reconnect {
            ChannelEvent::Reconnected
        } else {
            ChannelEvent::Connected
        });

        let end = loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(event) => self.shared.deliver(event),
                    None => break PumpEnd::Lost("broker closed the connection".into()),
                },
                signal = self.next_signal() => match signal {
                    Signal::Connect => {}
                    Signal::Rotated => break PumpEnd::Rotated,
                    Signal::Disconnect => break PumpEnd::Exit(Exit::Idle, "disconnect requested".into()),
                    Signal::Shutdown => break PumpEnd::Exit(Exit::Shutdown, "shutdown".into()),
                    Signal::SignedOut => {
                        self.shared.wanted.store(false, Ordering::SeqCst);
                        break PumpEnd::Exit(Exit::Idle, "signed out".into());
                    }
                },
            }
        };

        self.shared.link().take();
        end
    }

    async fn next_signal(&mut self) -> Signal {
        tokio::select! {
            control = self.control.recv() => match control {
                Some(Control::Connect) => Signal::Connect,
                Some(Control::Disconnect) => Signal::Disconnect,
                Some(Control::Shutdown) | None => Signal::Shutdown,
            },
            event = self.session_events.recv() => match event {
                Ok(SessionEvent::Rotated(_)) => Signal::Rotated,
                Ok(SessionEvent::SignedOut) => Signal::SignedOut,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} session events, assuming rotation", n);
                    Signal::Rotated
                }
                Err(broadcast::error::RecvError::Closed) => Signal::Shutdown,
            },
        }
    }
}

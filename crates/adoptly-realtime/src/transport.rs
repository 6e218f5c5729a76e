use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use adoptly_types::events::{ClientCommand, ServerEvent};

use crate::error::RealtimeError;

/// How long the broker has to answer `identify` with `ready`.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Authentication presented on connect. Sent as the `identify` frame, never
/// as an HTTP header.
#[derive(Clone)]
pub struct AuthPayload {
    pub token: String,
}

impl std::fmt::Debug for AuthPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthPayload").field("token", &"<redacted>").finish()
    }
}

/// One authenticated broker connection.
///
/// Dropping `outbound` closes the connection; `inbound` ends when the broker
/// goes away.
#[derive(Debug)]
pub struct Link {
    pub user_id: String,
    pub outbound: mpsc::UnboundedSender<ClientCommand>,
    pub inbound: mpsc::UnboundedReceiver<ServerEvent>,
}

pub trait Transport: Send + Sync + 'static {
    fn connect(&self, auth: AuthPayload) -> BoxFuture<'static, Result<Link, RealtimeError>>;
}

/// JSON-over-WebSocket transport.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    handshake_timeout: Duration,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

impl Transport for WsTransport {
    fn connect(&self, auth: AuthPayload) -> BoxFuture<'static, Result<Link, RealtimeError>> {
        let url = self.url.clone();
        let handshake_timeout = self.handshake_timeout;
        async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| RealtimeError::Connect(e.to_string()))?;
            let (mut ws_tx, mut ws_rx) = ws_stream.split();

            let identify = serde_json::to_string(&ClientCommand::Identify { token: auth.token })?;
            ws_tx
                .send(Message::Text(identify))
                .await
                .map_err(|e| RealtimeError::Connect(e.to_string()))?;

            // Wait for Ready
            let user_id = tokio::time::timeout(handshake_timeout, async {
                loop {
                    match ws_rx.next().await {
                        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(ServerEvent::Ready { user_id }) => return Ok(user_id),
                            Ok(ServerEvent::Error { message }) => return Err(RealtimeError::Rejected(message)),
                            Ok(other) => trace!("Ignoring {:?} before ready", other),
                            Err(e) => warn!("Unparseable frame during handshake: {}", e),
                        },
                        // Only an explicit `error` frame is a rejection; a bare close is transient.
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(RealtimeError::Connect("connection closed during identify".into()));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(RealtimeError::Connect(e.to_string())),
                    }
                }
            })
            .await
            .map_err(|_| RealtimeError::HandshakeTimeout)??;

            debug!("Realtime link identified as {}", user_id);

            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientCommand>();
            let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerEvent>();

            // Outbound pump: ends when the client drops its sender.
            tokio::spawn(async move {
                while let Some(command) = out_rx.recv().await {
                    let json = match serde_json::to_string(&command) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to encode command: {}", e);
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_tx.close().await;
            });

            // Inbound pump: ends when the socket closes or the client stops listening.
            tokio::spawn(async move {
                while let Some(frame) = ws_rx.next().await {
                    match frame {
                        Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                if in_tx.send(event).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Dropping unparseable broker frame: {}", e),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!("Realtime socket error: {}", e);
                            break;
                        }
                    }
                }
            });

            Ok(Link {
                user_id,
                outbound: out_tx,
                inbound: in_rx,
            })
        }
        .boxed()
    }
}

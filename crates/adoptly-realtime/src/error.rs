#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RealtimeError {
    #[error("not connected to the realtime broker")]
    Disconnected,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("broker rejected the connection: {0}")]
    Rejected(String),

    #[error("broker did not acknowledge identify in time")]
    HandshakeTimeout,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for RealtimeError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

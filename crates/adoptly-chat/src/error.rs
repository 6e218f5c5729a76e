#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    #[error("invalid conversation id: {0:?}")]
    InvalidConversation(String),

    /// No credential and no way to get one; the front end should send the
    /// user to `redirect`.
    #[error("sign-in required")]
    Unauthenticated { redirect: String },

    #[error("conversation not found")]
    NotFound,

    #[error("could not load conversation history: {0}")]
    HistoryLoadFailed(String),

    #[error("cannot send messages to yourself")]
    SelfConversation,

    #[error("not connected to the realtime broker")]
    TransportDisconnected,

    #[error("message is empty")]
    EmptyMessage,

    #[error("current user could not be determined")]
    UnknownUser,
}

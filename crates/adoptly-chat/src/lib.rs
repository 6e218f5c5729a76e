//! Per-conversation chat state machine: history, typing presence and read
//! receipts over the shared realtime channel.

pub mod error;
pub mod service;
pub mod state;
pub mod timer;
pub mod view;

pub use error::ChatError;
pub use service::{ChatConfig, ChatService};
pub use state::{ConversationSnapshot, ConversationState};
pub use view::ConversationView;

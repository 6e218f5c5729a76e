//! Realtime channel client: one authenticated broker connection shared by
//! every open conversation.

pub mod backoff;
pub mod client;
pub mod error;
pub mod memory;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use client::{ChannelClient, ChannelEvent, ConnectionState};
pub use error::RealtimeError;
pub use memory::MemoryBroker;
pub use transport::{AuthPayload, Link, Transport, WsTransport};

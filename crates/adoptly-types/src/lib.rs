//! Wire and domain types shared by the session, realtime and chat crates.

pub mod api;
pub mod events;
pub mod models;

//! # wabridge-store
//!
//! SQLite-backed persistence for the bridge: the `messages` and `chats`
//! tables behind narrow repository contracts.

mod store;

pub use store::{ChatRepo, MessageRepo, Store};

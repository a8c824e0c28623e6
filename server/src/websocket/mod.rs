//! WebSocket support: session tracking and the push notifier.
//!
//! Clients connect via WebSocket, receive `sync_completed`,
//! `offline_operation_queued` and `presence_update` pushes, and may trigger
//! sync sessions over the same socket.

mod manager;
mod notifier;
mod protocol;

pub use manager::{Connection, ConnectionManager, MessageSender};
pub use notifier::Notifier;
pub use protocol::*;

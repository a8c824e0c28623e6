//! Push notifier seam between the orchestrator and live sessions.

use tether_engine::UserId;

use super::{ConnectionManager, Envelope, ServerMessage};

/// Best-effort delivery of pushes. A lost push never affects durable state.
pub trait Notifier: Send + Sync + 'static {
    /// Deliver to every live session of `user_id`. Returns the number of
    /// sessions that accepted the message.
    fn send_to_user(&self, user_id: UserId, message: ServerMessage) -> usize;

    /// Deliver to every live session.
    fn broadcast(&self, message: ServerMessage) -> usize;

    /// Number of live sessions of `user_id`.
    fn live_sessions(&self, user_id: UserId) -> usize;
}

impl Notifier for ConnectionManager {
    fn send_to_user(&self, user_id: UserId, message: ServerMessage) -> usize {
        self.deliver_to_user(user_id, Envelope::for_user(user_id, message))
    }

    fn broadcast(&self, message: ServerMessage) -> usize {
        self.broadcast_all(Envelope::new(message))
    }

    fn live_sessions(&self, user_id: UserId) -> usize {
        self.session_count(user_id)
    }
}

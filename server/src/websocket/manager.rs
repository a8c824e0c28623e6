//! WebSocket connection manager.
//!
//! Tracks live sessions per user and fans pushes out to them.

use std::sync::Arc;

use dashmap::DashMap;
use tether_engine::UserId;
use tokio::sync::mpsc;

use super::Envelope;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<Envelope>;

/// A single WebSocket session.
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub user_id: UserId,
    pub sender: MessageSender,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// Index of connection IDs by user.
    by_user: DashMap<UserId, Vec<String>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a session for `user_id`.
    ///
    /// Returns the connection ID and the user's session count including it.
    pub fn register(&self, user_id: UserId, sender: MessageSender) -> (String, usize) {
        let conn_id = uuid::Uuid::new_v4().to_string();

        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id.clone(),
                user_id,
                sender,
            },
        );

        let sessions = {
            let mut ids = self.by_user.entry(user_id).or_default();
            ids.push(conn_id.clone());
            ids.len()
        };

        tracing::info!(conn_id = %conn_id, user_id, sessions, "WebSocket connection registered");
        (conn_id, sessions)
    }

    /// Unregister a session. Returns the user's remaining session count.
    pub fn unregister(&self, conn_id: &str) -> usize {
        let Some((_, conn)) = self.connections.remove(conn_id) else {
            return 0;
        };

        let remaining = match self.by_user.get_mut(&conn.user_id) {
            Some(mut ids) => {
                ids.retain(|id| id != conn_id);
                ids.len()
            }
            None => 0,
        };
        if remaining == 0 {
            self.by_user.remove_if(&conn.user_id, |_, ids| ids.is_empty());
        }

        tracing::info!(
            conn_id = %conn_id,
            user_id = conn.user_id,
            remaining,
            "WebSocket connection unregistered"
        );
        remaining
    }

    /// Send to every session of one user. Returns how many accepted it.
    pub fn deliver_to_user(&self, user_id: UserId, message: Envelope) -> usize {
        let conn_ids = match self.by_user.get(&user_id) {
            Some(ids) => ids.value().clone(),
            None => return 0,
        };

        conn_ids
            .iter()
            .filter(|id| self.send_to(id, message.clone()))
            .count()
    }

    /// Send to every live session.
    pub fn broadcast_all(&self, message: Envelope) -> usize {
        let mut sent_count = 0;

        for entry in self.connections.iter() {
            if entry.value().sender.send(message.clone()).is_ok() {
                sent_count += 1;
            }
        }

        tracing::debug!(recipients = sent_count, "Broadcast message to connections");
        sent_count
    }

    /// Send a message to a specific connection.
    pub fn send_to(&self, conn_id: &str, message: Envelope) -> bool {
        self.connections
            .get(conn_id)
            .is_some_and(|conn| conn.sender.send(message).is_ok())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn session_count(&self, user_id: UserId) -> usize {
        self.by_user.get(&user_id).map_or(0, |ids| ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::ServerMessage;

    #[test]
    fn test_register_unregister() {
        let manager = ConnectionManager::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        let (first, count) = manager.register(1, tx1);
        assert_eq!(count, 1);
        let (_second, count) = manager.register(1, tx2);
        assert_eq!(count, 2);
        assert_eq!(manager.session_count(1), 2);

        assert_eq!(manager.unregister(&first), 1);
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(manager.unregister("unknown"), 0);
    }

    #[test]
    fn send_to_user_reaches_every_session_of_that_user_only() {
        let manager = ConnectionManager::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        manager.register(1, tx1);
        manager.register(1, tx2);
        manager.register(2, tx3);

        let sent = manager.deliver_to_user(1, Envelope::for_user(1, ServerMessage::Pong));
        assert_eq!(sent, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn closed_receivers_are_not_counted() {
        let manager = ConnectionManager::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        manager.register(1, tx1);
        manager.register(2, tx2);
        drop(rx1);

        assert_eq!(manager.broadcast_all(Envelope::new(ServerMessage::Pong)), 1);
        assert!(rx2.try_recv().is_ok());
    }
}

//! WebSocket message protocol definitions.
//!
//! All messages are JSON-encoded and use snake_case for field names. Pushes
//! from the server travel inside an [`Envelope`]:
//!
//! ```json
//! {"type": "sync_completed", "data": {...}, "timestamp": "...", "user_id": 7}
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tether_engine::{
    OperationKind, Operation, SyncStatus, SyncSummary, Timestamp, UserId,
};

/// Messages sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Keep-alive ping.
    Ping,

    /// Run a sync session for the connected user.
    Sync {
        /// Run a selective session from this point. `null` falls back to
        /// the stored hint or the last sync time.
        #[serde(default)]
        since: Option<Timestamp>,
        /// Selective even without `since`.
        #[serde(default)]
        selective: bool,
        /// Request ID for correlating responses
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Ask for the current sync status.
    Status {
        #[serde(default)]
        request_id: Option<String>,
    },
}

/// Presence state carried by `presence_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
}

impl Presence {
    pub fn from_online(online: bool) -> Self {
        if online {
            Presence::Online
        } else {
            Presence::Offline
        }
    }
}

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A sync session for the user finished.
    SyncCompleted(SyncSummary),

    /// An operation was accepted into the user's queue.
    OfflineOperationQueued {
        operation_id: String,
        operation_type: OperationKind,
        table_name: String,
        record_id: String,
    },

    /// A user went online or offline.
    PresenceUpdate { user_id: UserId, status: Presence },

    /// Reply to a `status` request.
    SyncStatus(SyncStatus),

    /// Response to ping.
    Pong,

    /// Error message.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }

    pub fn operation_queued(op: &Operation) -> Self {
        ServerMessage::OfflineOperationQueued {
            operation_id: op.operation_id.clone(),
            operation_type: op.operation_type,
            table_name: op.table_name.clone(),
            record_id: op.record_id.clone(),
        }
    }

    pub fn presence(user_id: UserId, online: bool) -> Self {
        ServerMessage::PresenceUpdate {
            user_id,
            status: Presence::from_online(online),
        }
    }
}

/// A server message stamped for delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: ServerMessage,
    pub timestamp: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl Envelope {
    pub fn new(message: ServerMessage) -> Self {
        Self {
            message,
            timestamp: Utc::now(),
            user_id: None,
        }
    }

    pub fn for_user(user_id: UserId, message: ServerMessage) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::new(message)
        }
    }
}

//! WebSocket handler for real-time sync.
//!
//! A connection is a push channel for one user plus a small command surface
//! (ping, sync, status). A user is online while any of their sessions is
//! open; presence is recomputed from the session count on every connect
//! and disconnect.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tether_engine::UserId;
use tokio::sync::mpsc;

use crate::websocket::{ClientMessage, Envelope, ServerMessage};
use crate::AppState;

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Registers the connection and recomputes presence
/// 2. Spawns a task to forward outgoing envelopes
/// 3. Processes incoming messages until close or shutdown
/// 4. Unregisters and recomputes presence
pub async fn handle_websocket_connection(socket: WebSocket, state: AppState, user_id: UserId) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    let (conn_id, sessions) = state.conn_manager.register(user_id, tx);
    tracing::info!(conn_id = %conn_id, user_id, sessions, "WebSocket client connected");

    if let Err(e) = state.engine.sync_presence(user_id).await {
        tracing::warn!(user_id, "Failed to mark user online: {}", e);
    }

    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            match serde_json::to_string(&envelope) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    loop {
        let next = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            next = ws_receiver.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                if let Some(reply) = process_message(&text, &state, user_id).await {
                    state
                        .conn_manager
                        .send_to(&conn_id, Envelope::for_user(user_id, reply));
                }
            }
            Some(Ok(Message::Binary(_))) => {
                tracing::warn!("Binary messages not supported");
            }
            Some(Ok(Message::Ping(data))) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Some(Ok(Message::Pong(_))) => {
                tracing::trace!("Received pong");
            }
            Some(Ok(Message::Close(_))) | None => {
                tracing::info!(conn_id = %conn_id, "WebSocket closed");
                break;
            }
            Some(Err(e)) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    let remaining = state.conn_manager.unregister(&conn_id);
    send_task.abort();

    if let Err(e) = state.engine.sync_presence(user_id).await {
        tracing::warn!(user_id, "Failed to update presence: {}", e);
    }

    tracing::info!(
        conn_id = %conn_id,
        user_id,
        remaining,
        active_connections = state.conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Run a client command. Successful syncs answer through the
/// `sync_completed` push, so only failures produce a direct reply.
async fn process_message(text: &str, state: &AppState, user_id: UserId) -> Option<ServerMessage> {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return Some(ServerMessage::error(
                format!("Invalid message format: {}", e),
                None,
            ));
        }
    };

    match client_msg {
        ClientMessage::Ping => Some(ServerMessage::Pong),

        ClientMessage::Sync {
            since,
            selective,
            request_id,
        } => {
            let deadline = state.request_deadline();
            let result = if since.is_some() || selective {
                state
                    .engine
                    .sync_selective(user_id, since, deadline.token())
                    .await
            } else {
                state.engine.sync_all(user_id, deadline.token()).await
            };
            result
                .err()
                .map(|e| ServerMessage::error(e.to_string(), request_id))
        }

        ClientMessage::Status { request_id } => match state.engine.get_sync_status(user_id).await {
            Ok(status) => Some(ServerMessage::SyncStatus(status)),
            Err(e) => Some(ServerMessage::error(e.to_string(), request_id)),
        },
    }
}

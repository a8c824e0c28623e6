//! Tether Server - sync service for offline-first clients.
//!
//! Clients queue create/update/delete operations while offline and replay
//! them through the HTTP and WebSocket endpoints exposed here. The
//! [`sync::SyncEngine`] applies them against the storage backend, resolves
//! conflicts with `tether-engine`, and pushes the outcome to every live
//! session of the user.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod kv;
pub mod routes;
pub mod storage;
pub mod sync;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use tokio_util::sync::{CancellationToken, DropGuard};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::kv::KvStore;
use crate::storage::SyncBackend;
use crate::sync::{EngineSettings, SyncEngine};
use crate::websocket::ConnectionManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
    /// Root token; cancelling it stops the retry loop and in-flight sessions.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire the engine to `backend`, with live WebSocket sessions as the
    /// push channel.
    pub fn new(config: Config, backend: Arc<dyn SyncBackend>) -> Self {
        let conn_manager = ConnectionManager::new_shared();
        let engine = SyncEngine::new(
            backend,
            conn_manager.clone(),
            Arc::new(KvStore::new()),
            EngineSettings::from_config(&config),
        );
        Self {
            engine: Arc::new(engine),
            config: Arc::new(config),
            conn_manager,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancellation for one request. It fires on shutdown or once
    /// `request_timeout` has passed, whichever comes first.
    pub fn request_deadline(&self) -> RequestDeadline {
        let token = self.shutdown.child_token();
        let timer = token.clone();
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => timer.cancel(),
                _ = timer.cancelled() => {}
            }
        });
        RequestDeadline {
            _guard: token.clone().drop_guard(),
            token,
        }
    }
}

/// A request-scoped cancellation token. Dropping it cancels the token,
/// which also stops its timer.
pub struct RequestDeadline {
    token: CancellationToken,
    _guard: DropGuard,
}

impl RequestDeadline {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Build the router with tracing and CORS layers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

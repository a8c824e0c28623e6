//! WebSocket upgrade endpoint.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::auth::{authenticate, authenticate_headers, AuthUser};
use crate::handlers::handle_websocket_connection;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    /// Browsers cannot set headers on an upgrade request.
    #[serde(default)]
    pub token: Option<String>,
}

/// GET /ws - Upgrade to a push channel for the caller.
async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let secret = state.config.auth_secret.as_deref();
    let auth = match query.token.as_deref() {
        Some(token) => {
            authenticate(secret, token).map_err(|reason| (StatusCode::UNAUTHORIZED, reason))
        }
        None => authenticate_headers(secret, &headers),
    };

    match auth {
        Ok(AuthUser { user_id }) => ws
            .on_upgrade(move |socket| handle_websocket_connection(socket, state, user_id))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

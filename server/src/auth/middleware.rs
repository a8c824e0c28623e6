//! Authentication middleware.
//!
//! Bearer tokens identify the calling user. In development mode (no
//! `AUTH_SECRET`) the token is the numeric user ID itself; otherwise it must
//! be `{secret}:{user_id}`.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
};
use tether_engine::UserId;

use crate::AppState;

/// Authenticated user extracted from request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: UserId,
}

/// Resolve a bearer token to a user.
pub fn authenticate(auth_secret: Option<&str>, token: &str) -> Result<AuthUser, &'static str> {
    if token.is_empty() {
        return Err("Empty bearer token");
    }

    let user_part = match auth_secret {
        None => token,
        Some(secret) => match token.rsplit_once(':') {
            Some((given, user_part)) if given == secret => user_part,
            _ => return Err("Invalid bearer token"),
        },
    };

    user_part
        .parse::<UserId>()
        .map(|user_id| AuthUser { user_id })
        .map_err(|_| "Bearer token does not name a user")
}

/// Resolve the `Authorization: Bearer` header to a user.
pub fn authenticate_headers(
    auth_secret: Option<&str>,
    headers: &HeaderMap,
) -> Result<AuthUser, (StatusCode, &'static str)> {
    let auth_header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match auth_header {
        Some(header) => match header.strip_prefix("Bearer ") {
            Some(token) => authenticate(auth_secret, token.trim())
                .map_err(|reason| (StatusCode::UNAUTHORIZED, reason)),
            None => Err((
                StatusCode::UNAUTHORIZED,
                "Invalid authorization header format",
            )),
        },
        None => Err((StatusCode::UNAUTHORIZED, "Missing authorization header")),
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        authenticate_headers(state.config.auth_secret.as_deref(), &parts.headers)
    }
}

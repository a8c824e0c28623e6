//! Unified error handling for the server.
//!
//! [`SyncError`] is what the engine surfaces; [`AppError`] is what an HTTP
//! handler returns, with the mapping to status codes in one place.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Error kinds surfaced by the sync engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Malformed operation or conflict request. Nothing was persisted.
    #[error("{message}")]
    BadInput { code: &'static str, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// The store refused a read or write.
    #[error("Store error: {0}")]
    Store(String),

    /// The conflict needs a manual decision before its operation can finish.
    #[error("Conflict {conflict_id} awaits manual resolution")]
    ConflictUnresolved { conflict_id: i64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn bad_input(code: &'static str, message: impl Into<String>) -> Self {
        SyncError::BadInput {
            code,
            message: message.into(),
        }
    }

    /// Stable machine-readable code of the error.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::BadInput { code, .. } => code,
            SyncError::NotFound(_) => "not_found",
            SyncError::Store(_) => "store_error",
            SyncError::ConflictUnresolved { .. } => "conflict_unresolved",
            SyncError::Cancelled => "cancelled",
            SyncError::Internal(_) => "internal",
        }
    }
}

impl From<tether_engine::Error> for SyncError {
    fn from(err: tether_engine::Error) -> Self {
        use tether_engine::Error;
        match &err {
            Error::BadKind(_)
            | Error::BadPayload(_)
            | Error::BadRecordId(_)
            | Error::BadStrategy(_) => SyncError::bad_input(err.code(), err.to_string()),
            Error::RecordNotFound { .. }
            | Error::OperationNotFound(_)
            | Error::ConflictNotFound(_) => SyncError::NotFound(err.to_string()),
            Error::RecordAlreadyExists { .. } => SyncError::Store(err.to_string()),
            Error::InvalidTransition { .. } => SyncError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => SyncError::NotFound("row not found".to_string()),
            other => SyncError::Store(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Internal(err.to_string())
    }
}

/// Result type alias for engine calls.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl From<tether_engine::Error> for AppError {
    fn from(err: tether_engine::Error) -> Self {
        AppError::Sync(err.into())
    }
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, code, details) = match &self {
            AppError::Sync(err) => match err {
                SyncError::BadInput { message, .. } => {
                    (StatusCode::BAD_REQUEST, message.clone(), err.code(), None)
                }
                SyncError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), err.code(), None),
                SyncError::Store(msg) => {
                    tracing::error!("Store error: {}", msg);
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Store error".to_string(),
                        err.code(),
                        None,
                    )
                }
                SyncError::ConflictUnresolved { .. } => {
                    (StatusCode::CONFLICT, err.to_string(), err.code(), None)
                }
                SyncError::Cancelled => (
                    StatusCode::GATEWAY_TIMEOUT,
                    "Request deadline exceeded".to_string(),
                    err.code(),
                    None,
                ),
                SyncError::Internal(msg) => {
                    tracing::error!("Internal error: {}", msg);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error".to_string(),
                        err.code(),
                        Some(msg.clone()),
                    )
                }
            },
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "bad_input", None),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            code,
            details,
        });

        (status, body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_kinds() {
        let err: SyncError = tether_engine::Error::BadKind("Bad Kind".into()).into();
        assert_eq!(err.code(), "bad_kind");

        let err: SyncError = tether_engine::Error::ConflictNotFound(9).into();
        assert!(matches!(err, SyncError::NotFound(_)));

        let err: SyncError = tether_engine::Error::RecordAlreadyExists {
            kind: "products".into(),
            id: "1".into(),
        }
        .into();
        assert_eq!(err.code(), "store_error");
    }

    #[test]
    fn status_codes() {
        let response =
            AppError::from(SyncError::bad_input("bad_strategy", "manual")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = AppError::from(SyncError::Cancelled).into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let response = AppError::from(SyncError::NotFound("conflict 3".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

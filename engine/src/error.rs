//! Error types for the Tether engine.

use crate::{OperationId, RecordId};
use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Input validation
    #[error("invalid record kind: {0}")]
    BadKind(String),

    #[error("invalid payload: {0}")]
    BadPayload(String),

    #[error("invalid record id '{0}': expected an unsigned integer")]
    BadRecordId(RecordId),

    #[error("invalid strategy: {0}")]
    BadStrategy(String),

    // Store errors
    #[error("record not found: {kind}/{id}")]
    RecordNotFound { kind: String, id: RecordId },

    #[error("record already exists: {kind}/{id}")]
    RecordAlreadyExists { kind: String, id: RecordId },

    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("conflict not found: {0}")]
    ConflictNotFound(i64),

    // State machine
    #[error("invalid status transition for {op_id}: {from} -> {to}")]
    InvalidTransition {
        op_id: OperationId,
        from: String,
        to: String,
    },
}

impl Error {
    /// Whether the error means the addressed entity does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::RecordNotFound { .. } | Error::OperationNotFound(_) | Error::ConflictNotFound(_)
        )
    }

    /// Stable machine-readable code of the error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::BadKind(_) => "bad_kind",
            Error::BadPayload(_) => "bad_payload",
            Error::BadRecordId(_) => "bad_record_id",
            Error::BadStrategy(_) => "bad_strategy",
            Error::RecordNotFound { .. }
            | Error::OperationNotFound(_)
            | Error::ConflictNotFound(_) => "not_found",
            Error::RecordAlreadyExists { .. } => "store_error",
            Error::InvalidTransition { .. } => "internal",
        }
    }

    /// Whether the error was caused by caller input rather than store state.
    pub fn is_bad_input(&self) -> bool {
        matches!(
            self,
            Error::BadKind(_) | Error::BadPayload(_) | Error::BadRecordId(_) | Error::BadStrategy(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

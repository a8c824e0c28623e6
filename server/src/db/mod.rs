//! Database module for PostgreSQL persistence.
//!
//! One submodule per table group; [`PgBackend`] composes them into a
//! [`crate::storage::SyncBackend`] with explicit transactions.

mod backend;
mod conflicts;
mod operations;
mod pool;
mod records;
mod status;
mod versions;

pub use backend::PgBackend;
pub use pool::*;

use crate::error::{SyncError, SyncResult};

/// Convert an unsigned engine counter into a BIGINT column value.
fn to_i64(value: u64, what: &str) -> SyncResult<i64> {
    i64::try_from(value).map_err(|_| SyncError::Internal(format!("{what} out of range: {value}")))
}

/// Convert a BIGINT column value into an unsigned engine counter.
fn to_u64(value: i64, what: &str) -> SyncResult<u64> {
    u64::try_from(value).map_err(|_| SyncError::Internal(format!("negative {what}: {value}")))
}

/// Convert an unsigned engine counter into an INTEGER column value.
fn to_i32(value: u32, what: &str) -> SyncResult<i32> {
    i32::try_from(value).map_err(|_| SyncError::Internal(format!("{what} out of range: {value}")))
}

fn to_u32(value: i32, what: &str) -> SyncResult<u32> {
    u32::try_from(value).map_err(|_| SyncError::Internal(format!("negative {what}: {value}")))
}

/// Read a JSONB column that must hold an object.
fn to_payload(value: serde_json::Value, what: &str) -> SyncResult<tether_engine::Payload> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        serde_json::Value::Null => Ok(tether_engine::Payload::new()),
        other => Err(SyncError::Internal(format!(
            "{what} is not a JSON object: {other}"
        ))),
    }
}

//! Per-user sync status and the append-only sync journal.

use crate::{error::Result, Error, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Kind of sync session recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Incremental,
    Selective,
    Full,
}

impl SyncKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Incremental => "incremental",
            SyncKind::Selective => "selective",
            SyncKind::Full => "full",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "incremental" => Ok(SyncKind::Incremental),
            "selective" => Ok(SyncKind::Selective),
            "full" => Ok(SyncKind::Full),
            other => Err(Error::BadPayload(format!("unknown sync type: {other}"))),
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync state of one user. Counters are maintained incrementally by the
/// queue and the orchestrator, never recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub user_id: UserId,
    pub pending_operations_count: i64,
    pub conflicts_count: i64,
    pub is_online: bool,
    pub last_online_at: Option<Timestamp>,
    pub last_sync_token: Option<String>,
    pub last_sync_at: Option<Timestamp>,
    pub last_sync_ok: Option<bool>,
    pub last_sync_error: Option<String>,
}

impl SyncStatus {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            pending_operations_count: 0,
            conflicts_count: 0,
            is_online: false,
            last_online_at: None,
            last_sync_token: None,
            last_sync_at: None,
            last_sync_ok: None,
            last_sync_error: None,
        }
    }

    /// Set the presence bit. Returns whether anything changed.
    pub fn set_presence(&mut self, online: bool, at: Timestamp) -> bool {
        if self.is_online == online {
            return false;
        }
        self.is_online = online;
        if online {
            self.last_online_at = Some(at);
        }
        true
    }

    /// Fold a finished session into the status.
    pub fn record_sync(&mut self, entry: &SyncJournalEntry) {
        self.last_sync_at = Some(entry.created_at);
        self.last_sync_token = Some(entry.sync_token.clone());
        self.last_sync_ok = Some(entry.success);
        self.last_sync_error = entry.error.clone();
    }
}

/// One journal row per finished sync session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJournalEntry {
    pub user_id: UserId,
    pub sync_type: SyncKind,
    pub operations_processed: u32,
    pub conflicts_resolved: u32,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub sync_token: String,
    pub created_at: Timestamp,
}

/// Records changed since a client's `since`, keyed by kind name.
pub type SelectiveData = BTreeMap<String, Vec<Value>>;

/// What a sync session returns to its caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub ops_processed: u32,
    pub conflicts_resolved: u32,
    pub duration_ms: u64,
    pub sync_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selective_data: Option<SelectiveData>,
}

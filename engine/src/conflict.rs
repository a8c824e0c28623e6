//! Conflict records and divergence detection.
//!
//! A conflict is first-class state, not an error: it is persisted, resolved by
//! a [`Strategy`], and reported back to the client.

use crate::{
    checksum, error::Result, operation::OperationKind, version::VersionEntry, Error, Operation,
    OperationId, Payload, RecordId, Timestamp, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// How a queued payload diverged from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// The payload does not match the last committed checksum.
    VersionMismatch,
    /// Two updates to the same record with different content in one session.
    ConcurrentEdit,
    /// The record is gone, or was modified after the client last saw it.
    DeletedModified,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::VersionMismatch => "version_mismatch",
            ConflictKind::ConcurrentEdit => "concurrent_edit",
            ConflictKind::DeletedModified => "deleted_modified",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "version_mismatch" => Ok(ConflictKind::VersionMismatch),
            "concurrent_edit" => Ok(ConflictKind::ConcurrentEdit),
            "deleted_modified" => Ok(ConflictKind::DeletedModified),
            other => Err(Error::BadPayload(format!("unknown conflict type: {other}"))),
        }
    }

    /// Strategy used when neither the operation nor the caller picked one.
    pub fn default_strategy(&self) -> Strategy {
        match self {
            ConflictKind::VersionMismatch => Strategy::ServerWins,
            ConflictKind::ConcurrentEdit => Strategy::Merge,
            ConflictKind::DeletedModified => Strategy::ServerWins,
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    ServerWins,
    ClientWins,
    Merge,
    /// Leave the conflict pending for an out-of-band decision.
    Manual,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::ServerWins => "server_wins",
            Strategy::ClientWins => "client_wins",
            Strategy::Merge => "merge",
            Strategy::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "server_wins" => Ok(Strategy::ServerWins),
            "client_wins" => Ok(Strategy::ClientWins),
            "merge" => Ok(Strategy::Merge),
            "manual" => Ok(Strategy::Manual),
            other => Err(Error::BadStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conflict lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Ignored,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Pending => "pending",
            ConflictStatus::Resolved => "resolved",
            ConflictStatus::Ignored => "ignored",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(ConflictStatus::Pending),
            "resolved" => Ok(ConflictStatus::Resolved),
            "ignored" => Ok(ConflictStatus::Ignored),
            other => Err(Error::BadPayload(format!("unknown conflict status: {other}"))),
        }
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A conflict about to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewConflict {
    pub user_id: UserId,
    pub operation_id: Option<OperationId>,
    pub table_name: String,
    pub record_id: RecordId,
    pub local_data: Payload,
    pub server_data: Payload,
    pub conflict_type: ConflictKind,
    pub resolution_strategy: Option<Strategy>,
}

impl NewConflict {
    /// Build the conflict an operation triggered.
    pub fn for_operation(op: &Operation, kind: ConflictKind, server_data: Payload) -> Self {
        Self {
            user_id: op.user_id,
            operation_id: Some(op.operation_id.clone()),
            table_name: op.table_name.clone(),
            record_id: op.record_id.clone(),
            local_data: op.payload(),
            server_data,
            conflict_type: kind,
            resolution_strategy: op.strategy,
        }
    }

    pub fn into_conflict(self, id: i64, now: Timestamp) -> Conflict {
        Conflict {
            id,
            user_id: self.user_id,
            operation_id: self.operation_id,
            table_name: self.table_name,
            record_id: self.record_id,
            local_data: self.local_data,
            server_data: self.server_data,
            conflict_type: self.conflict_type,
            resolution_strategy: self.resolution_strategy,
            status: ConflictStatus::Pending,
            resolved_data: None,
            created_at: now,
            resolved_at: None,
        }
    }
}

/// A persisted conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: i64,
    pub user_id: UserId,
    /// The operation that triggered this conflict.
    pub operation_id: Option<OperationId>,
    pub table_name: String,
    pub record_id: RecordId,
    pub local_data: Payload,
    pub server_data: Payload,
    pub conflict_type: ConflictKind,
    pub resolution_strategy: Option<Strategy>,
    pub status: ConflictStatus,
    pub resolved_data: Option<Payload>,
    pub created_at: Timestamp,
    pub resolved_at: Option<Timestamp>,
}

impl Conflict {
    /// The chosen strategy, or the default for this conflict kind.
    pub fn effective_strategy(&self) -> Strategy {
        self.resolution_strategy
            .unwrap_or_else(|| self.conflict_type.default_strategy())
    }

    pub fn is_pending(&self) -> bool {
        self.status == ConflictStatus::Pending
    }

    /// Record a resolution. Only pending conflicts can be resolved.
    pub fn mark_resolved(
        &mut self,
        strategy: Strategy,
        data: Payload,
        at: Timestamp,
    ) -> Result<()> {
        if !self.is_pending() {
            return Err(Error::BadPayload(format!(
                "conflict {} is already {}",
                self.id, self.status
            )));
        }
        self.resolution_strategy = Some(strategy);
        self.resolved_data = Some(data);
        self.status = ConflictStatus::Resolved;
        self.resolved_at = Some(at);
        Ok(())
    }
}

/// Content digests of the updates applied so far in one sync session.
///
/// A second update to the same record with different content inside the
/// window is a concurrent edit.
#[derive(Debug, Clone, Default)]
pub struct SessionEdits {
    digests: HashMap<(String, RecordId), String>,
}

impl SessionEdits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the content committed for a record in this session.
    pub fn record(&mut self, table_name: &str, record_id: &str, payload: &Payload) {
        self.digests.insert(
            (table_name.to_string(), record_id.to_string()),
            checksum::content_digest(payload),
        );
    }

    pub fn previous(&self, table_name: &str, record_id: &str) -> Option<&str> {
        self.digests
            .get(&(table_name.to_string(), record_id.to_string()))
            .map(String::as_str)
    }
}

/// Classify how `op` diverges from the current server state, if it does.
///
/// `server` is the current record payload (`None` when the record does not
/// exist) and `version` the registry entry for the record.
pub fn detect(
    op: &Operation,
    server: Option<&Payload>,
    version: Option<&VersionEntry>,
    session: &SessionEdits,
) -> Option<ConflictKind> {
    let payload = op.payload();

    match op.operation_type {
        OperationKind::Create => {
            let current = server?;
            (checksum::content_digest(current) != checksum::content_digest(&payload))
                .then_some(ConflictKind::VersionMismatch)
        }
        OperationKind::Update => {
            if server.is_none() {
                return Some(ConflictKind::DeletedModified);
            }
            if let Some(previous) = session.previous(&op.table_name, &op.record_id) {
                if previous != checksum::content_digest(&payload) {
                    return Some(ConflictKind::ConcurrentEdit);
                }
            }
            match version {
                Some(entry) if !entry.matches(&payload) => Some(ConflictKind::VersionMismatch),
                _ => None,
            }
        }
        OperationKind::Delete => {
            if server.is_none() {
                return Some(ConflictKind::DeletedModified);
            }
            match (version, op.base_version) {
                (Some(entry), Some(seen)) if entry.version > seen => {
                    Some(ConflictKind::DeletedModified)
                }
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{NewOperation, DEFAULT_MAX_RETRIES};
    use crate::version::ModifiedBy;
    use chrono::Utc;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn op(kind: OperationKind, data: Option<serde_json::Value>) -> Operation {
        NewOperation::new(kind, "products", "5", data.map(payload)).into_operation(
            1,
            "op-1".into(),
            DEFAULT_MAX_RETRIES,
            Utc::now(),
        )
    }

    fn entry_for(data: &Payload) -> VersionEntry {
        VersionEntry::bump(None, 1, "products", "5", data, ModifiedBy::Server, Utc::now())
    }

    #[test]
    fn default_strategies() {
        assert_eq!(
            ConflictKind::VersionMismatch.default_strategy(),
            Strategy::ServerWins
        );
        assert_eq!(ConflictKind::ConcurrentEdit.default_strategy(), Strategy::Merge);
        assert_eq!(
            ConflictKind::DeletedModified.default_strategy(),
            Strategy::ServerWins
        );
    }

    #[test]
    fn strategy_parse_rejects_unknown() {
        assert_eq!(Strategy::parse("merge").unwrap(), Strategy::Merge);
        assert_eq!(
            Strategy::parse("last_write_wins"),
            Err(Error::BadStrategy("last_write_wins".into()))
        );
    }

    #[test]
    fn update_with_diverging_checksum_is_version_mismatch() {
        let server = payload(json!({"name": "Srv", "price": 9}));
        let entry = entry_for(&server);
        let update = op(OperationKind::Update, Some(json!({"name": "Cli", "price": 11})));

        assert_eq!(
            detect(&update, Some(&server), Some(&entry), &SessionEdits::new()),
            Some(ConflictKind::VersionMismatch)
        );
    }

    #[test]
    fn update_matching_committed_content_is_clean() {
        let server = payload(json!({"name": "Srv", "price": 9}));
        let entry = entry_for(&server);
        let update = op(OperationKind::Update, Some(json!({"price": 9, "name": "Srv"})));

        assert_eq!(
            detect(&update, Some(&server), Some(&entry), &SessionEdits::new()),
            None
        );
        assert_eq!(detect(&update, Some(&server), None, &SessionEdits::new()), None);
    }

    #[test]
    fn update_of_missing_record_is_deleted_modified() {
        let update = op(OperationKind::Update, Some(json!({"name": "Cli"})));
        assert_eq!(
            detect(&update, None, None, &SessionEdits::new()),
            Some(ConflictKind::DeletedModified)
        );
    }

    #[test]
    fn second_differing_update_in_session_is_concurrent_edit() {
        let server = payload(json!({"name": "Srv", "price": 9}));
        let mut session = SessionEdits::new();
        session.record("products", "5", &payload(json!({"name": "First"})));

        let update = op(OperationKind::Update, Some(json!({"name": "Second"})));
        assert_eq!(
            detect(&update, Some(&server), Some(&entry_for(&server)), &session),
            Some(ConflictKind::ConcurrentEdit)
        );
    }

    #[test]
    fn delete_after_newer_version_is_deleted_modified() {
        let server = payload(json!({"name": "Srv", "price": 9}));
        let first = entry_for(&server);
        let second = VersionEntry::bump(
            Some(&first),
            1,
            "products",
            "5",
            &server,
            ModifiedBy::Server,
            Utc::now(),
        );

        let mut delete = op(OperationKind::Delete, None);
        delete.base_version = Some(1);
        assert_eq!(
            detect(&delete, Some(&server), Some(&second), &SessionEdits::new()),
            Some(ConflictKind::DeletedModified)
        );

        delete.base_version = Some(2);
        assert_eq!(
            detect(&delete, Some(&server), Some(&second), &SessionEdits::new()),
            None
        );
    }

    #[test]
    fn create_over_existing_record_with_other_content_conflicts() {
        let server = payload(json!({"name": "Srv", "price": 9}));
        let create = op(OperationKind::Create, Some(json!({"name": "Cli", "price": 9})));
        assert_eq!(
            detect(&create, Some(&server), None, &SessionEdits::new()),
            Some(ConflictKind::VersionMismatch)
        );
        assert_eq!(detect(&create, None, None, &SessionEdits::new()), None);
    }

    #[test]
    fn resolving_twice_is_rejected() {
        let update = op(OperationKind::Update, Some(json!({"name": "Cli"})));
        let mut conflict = NewConflict::for_operation(
            &update,
            ConflictKind::VersionMismatch,
            payload(json!({"name": "Srv"})),
        )
        .into_conflict(1, Utc::now());

        assert_eq!(conflict.effective_strategy(), Strategy::ServerWins);
        conflict
            .mark_resolved(Strategy::ServerWins, payload(json!({"name": "Srv"})), Utc::now())
            .unwrap();
        assert_eq!(conflict.status, ConflictStatus::Resolved);
        assert!(conflict
            .mark_resolved(Strategy::ClientWins, Payload::new(), Utc::now())
            .is_err());
    }
}

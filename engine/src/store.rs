//! Store - the in-memory reference implementation of the persisted layout.
//!
//! Holds records, version entries, the operation queue, conflicts, sync
//! status and the sync journal. It has no IO and no interior mutability; a
//! caller that shares it across tasks wraps it in a lock.
//!
//! Multi-step writes (see [`Store::commit_operation`]) check every
//! precondition before mutating anything, so a failed call leaves the store
//! untouched.

use crate::{
    conflict::{Conflict, ConflictStatus, NewConflict, Strategy},
    error::Result,
    record::{RecordKind, RowChange, StoredRecord, WriteIntent},
    sync::{SyncJournalEntry, SyncStatus},
    version::{ModifiedBy, VersionEntry},
    Error, Operation, OperationId, OperationStatus, Payload, RecordId, Timestamp, UserId,
};
use std::collections::BTreeMap;

type VersionKey = (UserId, String, RecordId);

/// The main store holding all engine state.
#[derive(Debug, Clone, Default)]
pub struct Store {
    /// Records by kind name, then record ID
    records: BTreeMap<String, BTreeMap<RecordId, StoredRecord>>,
    versions: BTreeMap<VersionKey, VersionEntry>,
    operations: BTreeMap<(UserId, OperationId), Operation>,
    conflicts: BTreeMap<i64, Conflict>,
    next_conflict_id: i64,
    statuses: BTreeMap<UserId, SyncStatus>,
    journal: Vec<SyncJournalEntry>,
}

impl Store {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn status_mut(&mut self, user_id: UserId) -> &mut SyncStatus {
        self.statuses
            .entry(user_id)
            .or_insert_with(|| SyncStatus::new(user_id))
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// Get a record by kind and ID.
    pub fn get_record(&self, kind: &RecordKind, record_id: &str) -> Option<&StoredRecord> {
        self.records
            .get(kind.as_str())
            .and_then(|table| table.get(record_id))
    }

    /// Insert or overwrite a record as-is, bypassing the write pipeline.
    ///
    /// Used to load server-side state that did not come through the queue.
    pub fn put_record(&mut self, record: StoredRecord) {
        self.records
            .entry(record.kind.as_str().to_string())
            .or_default()
            .insert(record.record_id.clone(), record);
    }

    /// Records of `kind` updated strictly after `since`, oldest first.
    pub fn records_updated_since(&self, kind: &RecordKind, since: Timestamp) -> Vec<&StoredRecord> {
        let mut records: Vec<_> = self
            .records
            .get(kind.as_str())
            .into_iter()
            .flat_map(|table| table.values())
            .filter(|record| record.updated_at > since)
            .collect();
        records.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        records
    }

    fn apply_change(
        &mut self,
        kind: &RecordKind,
        record_id: &str,
        change: RowChange,
        at: Timestamp,
    ) {
        let table = self.records.entry(kind.as_str().to_string()).or_default();
        match change {
            RowChange::Insert(payload) => {
                table.insert(
                    record_id.to_string(),
                    StoredRecord {
                        kind: kind.clone(),
                        record_id: record_id.to_string(),
                        data: payload.to_payload(),
                        created_at: at,
                        updated_at: at,
                    },
                );
            }
            RowChange::Replace(payload) => {
                if let Some(record) = table.get_mut(record_id) {
                    record.data = payload.to_payload();
                    record.updated_at = at;
                }
            }
            RowChange::Delete => {
                table.remove(record_id);
            }
            RowChange::Unchanged => {}
        }
    }

    // ------------------------------------------------------------------
    // Version registry
    // ------------------------------------------------------------------

    /// Get the version entry of a record, if one was ever committed.
    pub fn version(
        &self,
        user_id: UserId,
        table_name: &str,
        record_id: &str,
    ) -> Option<&VersionEntry> {
        self.versions
            .get(&(user_id, table_name.to_string(), record_id.to_string()))
    }

    /// Insert a version entry as-is, bypassing [`Store::commit_operation`].
    pub fn put_version(&mut self, entry: VersionEntry) {
        self.versions.insert(
            (entry.user_id, entry.table_name.clone(), entry.record_id.clone()),
            entry,
        );
    }

    // ------------------------------------------------------------------
    // Operation queue
    // ------------------------------------------------------------------

    /// Append an operation to its user's queue.
    ///
    /// Returns the stored operation and whether it was newly inserted. An
    /// operation ID that is already queued for the user is not inserted again.
    pub fn enqueue(&mut self, op: Operation) -> (Operation, bool) {
        let key = (op.user_id, op.operation_id.clone());
        if let Some(existing) = self.operations.get(&key) {
            return (existing.clone(), false);
        }
        self.status_mut(op.user_id).pending_operations_count += 1;
        self.operations.insert(key, op.clone());
        (op, true)
    }

    /// Get a queued operation.
    pub fn operation(&self, user_id: UserId, operation_id: &str) -> Option<&Operation> {
        self.operations.get(&(user_id, operation_id.to_string()))
    }

    fn operation_mut(&mut self, user_id: UserId, operation_id: &str) -> Result<&mut Operation> {
        self.operations
            .get_mut(&(user_id, operation_id.to_string()))
            .ok_or_else(|| Error::OperationNotFound(operation_id.to_string()))
    }

    /// Pending operations of a user in queue order.
    pub fn pending_operations(&self, user_id: UserId, limit: Option<usize>) -> Vec<Operation> {
        let mut pending: Vec<_> = self
            .operations
            .range((user_id, String::new())..)
            .take_while(|((owner, _), _)| *owner == user_id)
            .map(|(_, op)| op)
            .filter(|op| op.status == OperationStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.queue_order(b));
        pending.truncate(limit.unwrap_or(usize::MAX));
        pending
    }

    /// Operations of any user in `status`, in queue order.
    pub fn operations_with_status(&self, status: OperationStatus) -> Vec<Operation> {
        let mut ops: Vec<_> = self
            .operations
            .values()
            .filter(|op| op.status == status)
            .cloned()
            .collect();
        ops.sort_by(|a, b| a.user_id.cmp(&b.user_id).then_with(|| a.queue_order(b)));
        ops
    }

    /// Take a pending operation for processing.
    pub fn mark_processing(
        &mut self,
        user_id: UserId,
        operation_id: &str,
        at: Timestamp,
    ) -> Result<Operation> {
        let op = self.operation_mut(user_id, operation_id)?;
        op.mark_processing(at)?;
        let op = op.clone();
        self.status_mut(user_id).pending_operations_count -= 1;
        Ok(op)
    }

    pub fn mark_failed(
        &mut self,
        user_id: UserId,
        operation_id: &str,
        error: &str,
        at: Timestamp,
    ) -> Result<Operation> {
        let op = self.operation_mut(user_id, operation_id)?;
        op.mark_failed(error, at)?;
        Ok(op.clone())
    }

    /// Put a failed operation back in the queue, consuming one retry.
    pub fn reset_for_retry(
        &mut self,
        user_id: UserId,
        operation_id: &str,
        at: Timestamp,
    ) -> Result<Operation> {
        let op = self.operation_mut(user_id, operation_id)?;
        op.reset_for_retry(at)?;
        let op = op.clone();
        self.status_mut(user_id).pending_operations_count += 1;
        Ok(op)
    }

    /// Overwrite the payload of a queued operation (after conflict resolution).
    pub fn set_operation_payload(
        &mut self,
        user_id: UserId,
        operation_id: &str,
        payload: Payload,
        at: Timestamp,
    ) -> Result<Operation> {
        let op = self.operation_mut(user_id, operation_id)?;
        op.data = Some(payload);
        op.updated_at = at;
        Ok(op.clone())
    }

    /// Apply an operation's write, bump its record version, and complete it.
    ///
    /// The three steps land together or not at all. The version checksum
    /// covers the operation's (possibly resolved) payload.
    pub fn commit_operation(
        &mut self,
        user_id: UserId,
        operation_id: &str,
        intent: &WriteIntent,
        modified_by: ModifiedBy,
        at: Timestamp,
    ) -> Result<VersionEntry> {
        let op = self
            .operation(user_id, operation_id)
            .ok_or_else(|| Error::OperationNotFound(operation_id.to_string()))?;
        if !op.status.can_transition_to(OperationStatus::Completed) {
            return Err(Error::InvalidTransition {
                op_id: op.operation_id.clone(),
                from: op.status.to_string(),
                to: OperationStatus::Completed.to_string(),
            });
        }

        let kind = op.record_kind()?;
        let record_id = op.record_id.clone();
        let table_name = op.table_name.clone();
        let payload = op.payload();

        let existing = self.get_record(&kind, &record_id).map(|r| &r.data);
        let change = kind.plan_write(&record_id, intent, existing)?;

        // Nothing below can fail.
        self.apply_change(&kind, &record_id, change, at);

        let key = (user_id, table_name.clone(), record_id.clone());
        let entry = VersionEntry::bump(
            self.versions.get(&key),
            user_id,
            &table_name,
            &record_id,
            &payload,
            modified_by,
            at,
        );
        self.versions.insert(key, entry.clone());

        self.operation_mut(user_id, operation_id)?.mark_completed(at)?;
        Ok(entry)
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Persist a new pending conflict.
    pub fn insert_conflict(&mut self, conflict: NewConflict, at: Timestamp) -> Conflict {
        self.next_conflict_id += 1;
        let conflict = conflict.into_conflict(self.next_conflict_id, at);
        self.status_mut(conflict.user_id).conflicts_count += 1;
        self.conflicts.insert(conflict.id, conflict.clone());
        conflict
    }

    pub fn conflict(&self, user_id: UserId, conflict_id: i64) -> Option<&Conflict> {
        self.conflicts
            .get(&conflict_id)
            .filter(|conflict| conflict.user_id == user_id)
    }

    /// Conflicts of a user, oldest first, optionally filtered by status.
    pub fn conflicts(
        &self,
        user_id: UserId,
        status: Option<ConflictStatus>,
        limit: Option<usize>,
    ) -> Vec<Conflict> {
        self.conflicts
            .values()
            .filter(|c| c.user_id == user_id)
            .filter(|c| status.map_or(true, |s| c.status == s))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Mark a pending conflict resolved with `data`.
    pub fn resolve_conflict(
        &mut self,
        user_id: UserId,
        conflict_id: i64,
        strategy: Strategy,
        data: Payload,
        at: Timestamp,
    ) -> Result<Conflict> {
        let conflict = self
            .conflicts
            .get_mut(&conflict_id)
            .filter(|conflict| conflict.user_id == user_id)
            .ok_or(Error::ConflictNotFound(conflict_id))?;
        conflict.mark_resolved(strategy, data, at)?;
        let conflict = conflict.clone();
        self.status_mut(user_id).conflicts_count -= 1;
        Ok(conflict)
    }

    // ------------------------------------------------------------------
    // Sync status and journal
    // ------------------------------------------------------------------

    /// Sync status of a user; a fresh status when nothing was recorded yet.
    pub fn status(&self, user_id: UserId) -> SyncStatus {
        self.statuses
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| SyncStatus::new(user_id))
    }

    /// Set the presence bit. Returns the status and whether it changed.
    pub fn set_presence(
        &mut self,
        user_id: UserId,
        online: bool,
        at: Timestamp,
    ) -> (SyncStatus, bool) {
        let status = self.status_mut(user_id);
        let changed = status.set_presence(online, at);
        (status.clone(), changed)
    }

    /// Append a journal entry and fold it into the user's status.
    pub fn record_sync(&mut self, entry: SyncJournalEntry) {
        self.status_mut(entry.user_id).record_sync(&entry);
        self.journal.push(entry);
    }

    /// Journal entries of a user, newest first.
    pub fn history(&self, user_id: UserId, limit: Option<usize>) -> Vec<SyncJournalEntry> {
        self.journal
            .iter()
            .rev()
            .filter(|entry| entry.user_id == user_id)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

//! Storage backends for the sync engine.
//!
//! [`SyncBackend`] is the seam between the orchestrator and durable state.
//! Two implementations ship: [`crate::db::PgBackend`] over PostgreSQL and
//! [`MemoryBackend`] over the engine's in-memory `Store`.

mod memory;

pub use memory::MemoryBackend;

use async_trait::async_trait;
use tether_engine::{
    Conflict, ConflictStatus, ModifiedBy, NewConflict, Operation, Payload, RecordKind,
    StoredRecord, Strategy, SyncJournalEntry, SyncStatus, Timestamp, UserId, VersionEntry,
    WriteIntent,
};

use crate::error::SyncResult;

/// Outcome of an enqueue.
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub operation: Operation,
    /// `false` when the operation ID was already queued for the user.
    pub created: bool,
}

/// Durable state the orchestrator works against.
///
/// Every method is a single atomic step. Counter maintenance on
/// [`SyncStatus`] happens inside the same step as the change that causes it.
#[async_trait]
pub trait SyncBackend: Send + Sync + 'static {
    // Operation queue

    /// Append an operation; a duplicate operation ID is returned as-is.
    async fn enqueue(&self, op: Operation) -> SyncResult<Enqueued>;

    /// Pending operations of a user in queue order.
    async fn pending_operations(
        &self,
        user_id: UserId,
        limit: Option<usize>,
    ) -> SyncResult<Vec<Operation>>;

    async fn get_operation(
        &self,
        user_id: UserId,
        operation_id: &str,
    ) -> SyncResult<Option<Operation>>;

    async fn mark_processing(
        &self,
        user_id: UserId,
        operation_id: &str,
        at: Timestamp,
    ) -> SyncResult<Operation>;

    async fn mark_failed(
        &self,
        user_id: UserId,
        operation_id: &str,
        error: &str,
        at: Timestamp,
    ) -> SyncResult<Operation>;

    async fn reset_for_retry(
        &self,
        user_id: UserId,
        operation_id: &str,
        at: Timestamp,
    ) -> SyncResult<Operation>;

    async fn update_operation_payload(
        &self,
        user_id: UserId,
        operation_id: &str,
        payload: Payload,
        at: Timestamp,
    ) -> SyncResult<Operation>;

    /// Apply the write, bump the record version and complete the operation
    /// as one unit.
    async fn commit_operation(
        &self,
        user_id: UserId,
        operation_id: &str,
        intent: &WriteIntent,
        modified_by: ModifiedBy,
        at: Timestamp,
    ) -> SyncResult<VersionEntry>;

    /// Failed operations of every user, in queue order per user.
    async fn failed_operations(&self) -> SyncResult<Vec<Operation>>;

    /// Operations of every user left in `processing`.
    async fn processing_operations(&self) -> SyncResult<Vec<Operation>>;

    // Record store gateway

    async fn fetch_record(
        &self,
        kind: &RecordKind,
        record_id: &str,
    ) -> SyncResult<Option<StoredRecord>>;

    /// Records of `kind` whose store-level `updated_at` is after `since`.
    async fn records_updated_since(
        &self,
        kind: &RecordKind,
        since: Timestamp,
    ) -> SyncResult<Vec<StoredRecord>>;

    // Version registry

    async fn get_version(
        &self,
        user_id: UserId,
        table_name: &str,
        record_id: &str,
    ) -> SyncResult<Option<VersionEntry>>;

    // Conflicts

    async fn insert_conflict(&self, conflict: NewConflict, at: Timestamp) -> SyncResult<Conflict>;

    async fn get_conflict(&self, user_id: UserId, conflict_id: i64) -> SyncResult<Option<Conflict>>;

    async fn list_conflicts(
        &self,
        user_id: UserId,
        status: Option<ConflictStatus>,
        limit: Option<usize>,
    ) -> SyncResult<Vec<Conflict>>;

    async fn resolve_conflict(
        &self,
        user_id: UserId,
        conflict_id: i64,
        strategy: Strategy,
        data: Payload,
        at: Timestamp,
    ) -> SyncResult<Conflict>;

    // Sync status and journal

    async fn sync_status(&self, user_id: UserId) -> SyncResult<SyncStatus>;

    /// Set the presence bit. Returns the new status and whether it changed.
    async fn set_presence(
        &self,
        user_id: UserId,
        online: bool,
        at: Timestamp,
    ) -> SyncResult<(SyncStatus, bool)>;

    /// Append a journal entry and fold it into the user's status.
    async fn record_sync(&self, entry: SyncJournalEntry) -> SyncResult<()>;

    /// Journal entries of a user, newest first.
    async fn sync_history(
        &self,
        user_id: UserId,
        limit: Option<usize>,
    ) -> SyncResult<Vec<SyncJournalEntry>>;
}

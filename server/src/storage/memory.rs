//! In-memory backend over the engine's reference `Store`.
//!
//! Used when no `DATABASE_URL` is configured and by the test suite. All
//! state is lost on restart.

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_engine::{
    Conflict, ConflictStatus, ModifiedBy, NewConflict, Operation, OperationStatus, Payload,
    RecordKind, Store, StoredRecord, Strategy, SyncJournalEntry, SyncStatus, Timestamp, UserId,
    VersionEntry, WriteIntent,
};

use super::{Enqueued, SyncBackend};
use crate::error::{SyncError, SyncResult};

/// Backend keeping everything in one mutex-guarded [`Store`].
///
/// The lock is never held across an await point.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    store: Mutex<Store>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a record that did not come through the queue.
    pub fn seed_record(&self, record: StoredRecord) {
        self.store.lock().put_record(record);
    }

    /// Load a version entry that did not come through the queue.
    pub fn seed_version(&self, entry: VersionEntry) {
        self.store.lock().put_version(entry);
    }

    /// Read the underlying store.
    pub fn inspect<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        f(&self.store.lock())
    }
}

#[async_trait]
impl SyncBackend for MemoryBackend {
    async fn enqueue(&self, op: Operation) -> SyncResult<Enqueued> {
        let (operation, created) = self.store.lock().enqueue(op);
        Ok(Enqueued { operation, created })
    }

    async fn pending_operations(
        &self,
        user_id: UserId,
        limit: Option<usize>,
    ) -> SyncResult<Vec<Operation>> {
        Ok(self.store.lock().pending_operations(user_id, limit))
    }

    async fn get_operation(
        &self,
        user_id: UserId,
        operation_id: &str,
    ) -> SyncResult<Option<Operation>> {
        Ok(self.store.lock().operation(user_id, operation_id).cloned())
    }

    async fn mark_processing(
        &self,
        user_id: UserId,
        operation_id: &str,
        at: Timestamp,
    ) -> SyncResult<Operation> {
        Ok(self.store.lock().mark_processing(user_id, operation_id, at)?)
    }

    async fn mark_failed(
        &self,
        user_id: UserId,
        operation_id: &str,
        error: &str,
        at: Timestamp,
    ) -> SyncResult<Operation> {
        Ok(self
            .store
            .lock()
            .mark_failed(user_id, operation_id, error, at)?)
    }

    async fn reset_for_retry(
        &self,
        user_id: UserId,
        operation_id: &str,
        at: Timestamp,
    ) -> SyncResult<Operation> {
        Ok(self.store.lock().reset_for_retry(user_id, operation_id, at)?)
    }

    async fn update_operation_payload(
        &self,
        user_id: UserId,
        operation_id: &str,
        payload: Payload,
        at: Timestamp,
    ) -> SyncResult<Operation> {
        Ok(self
            .store
            .lock()
            .set_operation_payload(user_id, operation_id, payload, at)?)
    }

    async fn commit_operation(
        &self,
        user_id: UserId,
        operation_id: &str,
        intent: &WriteIntent,
        modified_by: ModifiedBy,
        at: Timestamp,
    ) -> SyncResult<VersionEntry> {
        Ok(self
            .store
            .lock()
            .commit_operation(user_id, operation_id, intent, modified_by, at)?)
    }

    async fn failed_operations(&self) -> SyncResult<Vec<Operation>> {
        Ok(self
            .store
            .lock()
            .operations_with_status(OperationStatus::Failed))
    }

    async fn processing_operations(&self) -> SyncResult<Vec<Operation>> {
        Ok(self
            .store
            .lock()
            .operations_with_status(OperationStatus::Processing))
    }

    async fn fetch_record(
        &self,
        kind: &RecordKind,
        record_id: &str,
    ) -> SyncResult<Option<StoredRecord>> {
        kind.parse_record_id(record_id)?;
        Ok(self.store.lock().get_record(kind, record_id).cloned())
    }

    async fn records_updated_since(
        &self,
        kind: &RecordKind,
        since: Timestamp,
    ) -> SyncResult<Vec<StoredRecord>> {
        Ok(self
            .store
            .lock()
            .records_updated_since(kind, since)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn get_version(
        &self,
        user_id: UserId,
        table_name: &str,
        record_id: &str,
    ) -> SyncResult<Option<VersionEntry>> {
        Ok(self
            .store
            .lock()
            .version(user_id, table_name, record_id)
            .cloned())
    }

    async fn insert_conflict(&self, conflict: NewConflict, at: Timestamp) -> SyncResult<Conflict> {
        Ok(self.store.lock().insert_conflict(conflict, at))
    }

    async fn get_conflict(
        &self,
        user_id: UserId,
        conflict_id: i64,
    ) -> SyncResult<Option<Conflict>> {
        Ok(self.store.lock().conflict(user_id, conflict_id).cloned())
    }

    async fn list_conflicts(
        &self,
        user_id: UserId,
        status: Option<ConflictStatus>,
        limit: Option<usize>,
    ) -> SyncResult<Vec<Conflict>> {
        Ok(self.store.lock().conflicts(user_id, status, limit))
    }

    async fn resolve_conflict(
        &self,
        user_id: UserId,
        conflict_id: i64,
        strategy: Strategy,
        data: Payload,
        at: Timestamp,
    ) -> SyncResult<Conflict> {
        let mut store = self.store.lock();
        let terminal = store
            .conflict(user_id, conflict_id)
            .filter(|conflict| !conflict.is_pending())
            .map(|conflict| conflict.status);
        if let Some(status) = terminal {
            return Err(SyncError::bad_input(
                "bad_input",
                format!("conflict {conflict_id} is already {status}"),
            ));
        }
        Ok(store.resolve_conflict(user_id, conflict_id, strategy, data, at)?)
    }

    async fn sync_status(&self, user_id: UserId) -> SyncResult<SyncStatus> {
        Ok(self.store.lock().status(user_id))
    }

    async fn set_presence(
        &self,
        user_id: UserId,
        online: bool,
        at: Timestamp,
    ) -> SyncResult<(SyncStatus, bool)> {
        Ok(self.store.lock().set_presence(user_id, online, at))
    }

    async fn record_sync(&self, entry: SyncJournalEntry) -> SyncResult<()> {
        self.store.lock().record_sync(entry);
        Ok(())
    }

    async fn sync_history(
        &self,
        user_id: UserId,
        limit: Option<usize>,
    ) -> SyncResult<Vec<SyncJournalEntry>> {
        Ok(self.store.lock().history(user_id, limit))
    }
}

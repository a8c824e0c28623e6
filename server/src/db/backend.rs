//! [`SyncBackend`] over PostgreSQL.

use async_trait::async_trait;
use tether_engine::{
    Conflict, ConflictStatus, Error as EngineError, ModifiedBy, NewConflict, Operation,
    OperationStatus, Payload, RecordKind, StoredRecord, Strategy, SyncJournalEntry, SyncStatus,
    Timestamp, UserId, VersionEntry, WriteIntent,
};

use super::{conflicts, operations, records, status, versions, Pool};
use crate::error::{SyncError, SyncResult};
use crate::storage::{Enqueued, SyncBackend};

/// Backend persisting everything in PostgreSQL.
///
/// Every trait method that changes more than one row runs in its own
/// transaction and locks the rows it reads before writing them back.
#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: Pool,
}

impl PgBackend {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Lock an operation, apply `change` to it and write it back together
    /// with the pending counter shift that change implies.
    async fn transition<F>(
        &self,
        user_id: UserId,
        operation_id: &str,
        change: F,
    ) -> SyncResult<Operation>
    where
        F: FnOnce(&mut Operation) -> Result<(), EngineError> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut op = operations::lock_operation(&mut tx, user_id, operation_id).await?;
        let was_pending = op.status == OperationStatus::Pending;
        change(&mut op)?;
        let is_pending = op.status == OperationStatus::Pending;

        operations::save_operation(&mut tx, &op).await?;
        let delta = i64::from(is_pending) - i64::from(was_pending);
        status::adjust_counters(&mut tx, user_id, delta, 0).await?;
        tx.commit().await?;
        Ok(op)
    }
}

fn limit_param(limit: Option<usize>) -> Option<i64> {
    limit.map(|n| i64::try_from(n).unwrap_or(i64::MAX))
}

#[async_trait]
impl SyncBackend for PgBackend {
    async fn enqueue(&self, op: Operation) -> SyncResult<Enqueued> {
        let mut tx = self.pool.begin().await?;
        let created = operations::insert_operation(&mut tx, &op).await?;
        let operation = if created {
            status::adjust_counters(&mut tx, op.user_id, 1, 0).await?;
            op
        } else {
            operations::get_operation(&mut tx, op.user_id, &op.operation_id, false)
                .await?
                .ok_or_else(|| SyncError::NotFound(format!("operation {}", op.operation_id)))?
        };
        tx.commit().await?;
        Ok(Enqueued { operation, created })
    }

    async fn pending_operations(
        &self,
        user_id: UserId,
        limit: Option<usize>,
    ) -> SyncResult<Vec<Operation>> {
        let mut conn = self.pool.acquire().await?;
        operations::pending_for_user(&mut conn, user_id, limit_param(limit)).await
    }

    async fn get_operation(
        &self,
        user_id: UserId,
        operation_id: &str,
    ) -> SyncResult<Option<Operation>> {
        let mut conn = self.pool.acquire().await?;
        operations::get_operation(&mut conn, user_id, operation_id, false).await
    }

    async fn mark_processing(
        &self,
        user_id: UserId,
        operation_id: &str,
        at: Timestamp,
    ) -> SyncResult<Operation> {
        self.transition(user_id, operation_id, |op| op.mark_processing(at))
            .await
    }

    async fn mark_failed(
        &self,
        user_id: UserId,
        operation_id: &str,
        error: &str,
        at: Timestamp,
    ) -> SyncResult<Operation> {
        let error = error.to_string();
        self.transition(user_id, operation_id, move |op| op.mark_failed(error, at))
            .await
    }

    async fn reset_for_retry(
        &self,
        user_id: UserId,
        operation_id: &str,
        at: Timestamp,
    ) -> SyncResult<Operation> {
        self.transition(user_id, operation_id, |op| op.reset_for_retry(at))
            .await
    }

    async fn update_operation_payload(
        &self,
        user_id: UserId,
        operation_id: &str,
        payload: Payload,
        at: Timestamp,
    ) -> SyncResult<Operation> {
        self.transition(user_id, operation_id, move |op| {
            op.data = Some(payload);
            op.updated_at = at;
            Ok(())
        })
        .await
    }

    async fn commit_operation(
        &self,
        user_id: UserId,
        operation_id: &str,
        intent: &WriteIntent,
        modified_by: ModifiedBy,
        at: Timestamp,
    ) -> SyncResult<VersionEntry> {
        let mut tx = self.pool.begin().await?;

        let mut op = operations::lock_operation(&mut tx, user_id, operation_id).await?;
        if !op.status.can_transition_to(OperationStatus::Completed) {
            return Err(SyncError::Internal(format!(
                "operation {operation_id} cannot complete from {}",
                op.status
            )));
        }

        let kind = op.record_kind()?;
        let existing = records::fetch_record(&mut tx, &kind, &op.record_id, true).await?;
        let change = kind.plan_write(&op.record_id, intent, existing.as_ref().map(|r| &r.data))?;
        records::apply_change(&mut tx, &kind, &op.record_id, change, at).await?;

        let previous =
            versions::get_version(&mut tx, user_id, &op.table_name, &op.record_id, true).await?;
        let entry = VersionEntry::bump(
            previous.as_ref(),
            user_id,
            &op.table_name,
            &op.record_id,
            &op.payload(),
            modified_by,
            at,
        );
        versions::upsert_version(&mut tx, &entry).await?;

        op.mark_completed(at)?;
        operations::save_operation(&mut tx, &op).await?;

        tx.commit().await?;
        Ok(entry)
    }

    async fn failed_operations(&self) -> SyncResult<Vec<Operation>> {
        let mut conn = self.pool.acquire().await?;
        operations::with_status(&mut conn, OperationStatus::Failed).await
    }

    async fn processing_operations(&self) -> SyncResult<Vec<Operation>> {
        let mut conn = self.pool.acquire().await?;
        operations::with_status(&mut conn, OperationStatus::Processing).await
    }

    async fn fetch_record(
        &self,
        kind: &RecordKind,
        record_id: &str,
    ) -> SyncResult<Option<StoredRecord>> {
        let mut conn = self.pool.acquire().await?;
        records::fetch_record(&mut conn, kind, record_id, false).await
    }

    async fn records_updated_since(
        &self,
        kind: &RecordKind,
        since: Timestamp,
    ) -> SyncResult<Vec<StoredRecord>> {
        let mut conn = self.pool.acquire().await?;
        records::records_updated_since(&mut conn, kind, since).await
    }

    async fn get_version(
        &self,
        user_id: UserId,
        table_name: &str,
        record_id: &str,
    ) -> SyncResult<Option<VersionEntry>> {
        let mut conn = self.pool.acquire().await?;
        versions::get_version(&mut conn, user_id, table_name, record_id, false).await
    }

    async fn insert_conflict(&self, conflict: NewConflict, at: Timestamp) -> SyncResult<Conflict> {
        let mut tx = self.pool.begin().await?;
        let user_id = conflict.user_id;
        let conflict = conflicts::insert_conflict(&mut tx, conflict, at).await?;
        status::adjust_counters(&mut tx, user_id, 0, 1).await?;
        tx.commit().await?;
        Ok(conflict)
    }

    async fn get_conflict(
        &self,
        user_id: UserId,
        conflict_id: i64,
    ) -> SyncResult<Option<Conflict>> {
        let mut conn = self.pool.acquire().await?;
        conflicts::get_conflict(&mut conn, user_id, conflict_id, false).await
    }

    async fn list_conflicts(
        &self,
        user_id: UserId,
        status: Option<ConflictStatus>,
        limit: Option<usize>,
    ) -> SyncResult<Vec<Conflict>> {
        let mut conn = self.pool.acquire().await?;
        conflicts::list_conflicts(&mut conn, user_id, status, limit_param(limit)).await
    }

    async fn resolve_conflict(
        &self,
        user_id: UserId,
        conflict_id: i64,
        strategy: Strategy,
        data: Payload,
        at: Timestamp,
    ) -> SyncResult<Conflict> {
        let mut tx = self.pool.begin().await?;
        let mut conflict = conflicts::get_conflict(&mut tx, user_id, conflict_id, true)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("conflict {conflict_id}")))?;
        if !conflict.is_pending() {
            return Err(SyncError::bad_input(
                "bad_input",
                format!("conflict {conflict_id} is already {}", conflict.status),
            ));
        }

        conflict.mark_resolved(strategy, data, at)?;
        conflicts::save_resolution(&mut tx, &conflict).await?;
        status::adjust_counters(&mut tx, user_id, 0, -1).await?;
        tx.commit().await?;
        Ok(conflict)
    }

    async fn sync_status(&self, user_id: UserId) -> SyncResult<SyncStatus> {
        let mut conn = self.pool.acquire().await?;
        status::get_status(&mut conn, user_id, false).await
    }

    async fn set_presence(
        &self,
        user_id: UserId,
        online: bool,
        at: Timestamp,
    ) -> SyncResult<(SyncStatus, bool)> {
        let mut tx = self.pool.begin().await?;
        let mut current = status::get_status(&mut tx, user_id, true).await?;
        let changed = current.set_presence(online, at);
        if changed {
            status::save_status(&mut tx, &current).await?;
        }
        tx.commit().await?;
        Ok((current, changed))
    }

    async fn record_sync(&self, entry: SyncJournalEntry) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;
        status::insert_history(&mut tx, &entry).await?;
        let mut current = status::get_status(&mut tx, entry.user_id, true).await?;
        current.record_sync(&entry);
        status::save_status(&mut tx, &current).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn sync_history(
        &self,
        user_id: UserId,
        limit: Option<usize>,
    ) -> SyncResult<Vec<SyncJournalEntry>> {
        let mut conn = self.pool.acquire().await?;
        status::history(&mut conn, user_id, limit_param(limit)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_saturate_into_bigint() {
        assert_eq!(limit_param(None), None);
        assert_eq!(limit_param(Some(20)), Some(20));
        assert_eq!(limit_param(Some(usize::MAX)), Some(i64::MAX));
    }
}

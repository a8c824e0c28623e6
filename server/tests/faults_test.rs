//! Sessions and retry passes over a backend that misbehaves on cue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use tether_engine::{
    Conflict, ConflictStatus, ModifiedBy, NewConflict, NewOperation, Operation, OperationKind,
    OperationStatus, Payload, RecordKind, RetryPolicy, StoredRecord, Strategy, SyncJournalEntry,
    SyncStatus, Timestamp, UserId, VersionEntry, WriteIntent,
};
use tether_server::error::{SyncError, SyncResult};
use tether_server::kv::KvStore;
use tether_server::storage::{Enqueued, MemoryBackend, SyncBackend};
use tether_server::sync::{EngineSettings, SyncEngine};
use tether_server::websocket::ConnectionManager;
use tokio_util::sync::CancellationToken;

/// Delegates to a [`MemoryBackend`], cancelling `cancel_on_commit` after the
/// first commit and failing status lookups for `broken_user`.
struct FaultyBackend {
    inner: MemoryBackend,
    cancel_on_commit: Option<CancellationToken>,
    broken_user: Option<UserId>,
}

impl FaultyBackend {
    fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            cancel_on_commit: None,
            broken_user: None,
        }
    }
}

#[async_trait]
impl SyncBackend for FaultyBackend {
    async fn enqueue(&self, op: Operation) -> SyncResult<Enqueued> {
        self.inner.enqueue(op).await
    }

    async fn pending_operations(
        &self,
        user_id: UserId,
        limit: Option<usize>,
    ) -> SyncResult<Vec<Operation>> {
        self.inner.pending_operations(user_id, limit).await
    }

    async fn get_operation(
        &self,
        user_id: UserId,
        operation_id: &str,
    ) -> SyncResult<Option<Operation>> {
        self.inner.get_operation(user_id, operation_id).await
    }

    async fn mark_processing(
        &self,
        user_id: UserId,
        operation_id: &str,
        at: Timestamp,
    ) -> SyncResult<Operation> {
        self.inner.mark_processing(user_id, operation_id, at).await
    }

    async fn mark_failed(
        &self,
        user_id: UserId,
        operation_id: &str,
        error: &str,
        at: Timestamp,
    ) -> SyncResult<Operation> {
        self.inner.mark_failed(user_id, operation_id, error, at).await
    }

    async fn reset_for_retry(
        &self,
        user_id: UserId,
        operation_id: &str,
        at: Timestamp,
    ) -> SyncResult<Operation> {
        self.inner.reset_for_retry(user_id, operation_id, at).await
    }

    async fn update_operation_payload(
        &self,
        user_id: UserId,
        operation_id: &str,
        payload: Payload,
        at: Timestamp,
    ) -> SyncResult<Operation> {
        self.inner
            .update_operation_payload(user_id, operation_id, payload, at)
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
        let entry = self
            .inner
            .commit_operation(user_id, operation_id, intent, modified_by, at)
            .await?;
        if let Some(cancel) = &self.cancel_on_commit {
            cancel.cancel();
        }
        Ok(entry)
    }

    async fn failed_operations(&self) -> SyncResult<Vec<Operation>> {
        self.inner.failed_operations().await
    }

    async fn processing_operations(&self) -> SyncResult<Vec<Operation>> {
        self.inner.processing_operations().await
    }

    async fn fetch_record(
        &self,
        kind: &RecordKind,
        record_id: &str,
    ) -> SyncResult<Option<StoredRecord>> {
        self.inner.fetch_record(kind, record_id).await
    }

    async fn records_updated_since(
        &self,
        kind: &RecordKind,
        since: Timestamp,
    ) -> SyncResult<Vec<StoredRecord>> {
        self.inner.records_updated_since(kind, since).await
    }

    async fn get_version(
        &self,
        user_id: UserId,
        table_name: &str,
        record_id: &str,
    ) -> SyncResult<Option<VersionEntry>> {
        self.inner.get_version(user_id, table_name, record_id).await
    }

    async fn insert_conflict(&self, conflict: NewConflict, at: Timestamp) -> SyncResult<Conflict> {
        self.inner.insert_conflict(conflict, at).await
    }

    async fn get_conflict(
        &self,
        user_id: UserId,
        conflict_id: i64,
    ) -> SyncResult<Option<Conflict>> {
        self.inner.get_conflict(user_id, conflict_id).await
    }

    async fn list_conflicts(
        &self,
        user_id: UserId,
        status: Option<ConflictStatus>,
        limit: Option<usize>,
    ) -> SyncResult<Vec<Conflict>> {
        self.inner.list_conflicts(user_id, status, limit).await
    }

    async fn resolve_conflict(
        &self,
        user_id: UserId,
        conflict_id: i64,
        strategy: Strategy,
        data: Payload,
        at: Timestamp,
    ) -> SyncResult<Conflict> {
        self.inner
            .resolve_conflict(user_id, conflict_id, strategy, data, at)
            .await
    }

    async fn sync_status(&self, user_id: UserId) -> SyncResult<SyncStatus> {
        if self.broken_user == Some(user_id) {
            return Err(SyncError::Internal("status row unreadable".into()));
        }
        self.inner.sync_status(user_id).await
    }

    async fn set_presence(
        &self,
        user_id: UserId,
        online: bool,
        at: Timestamp,
    ) -> SyncResult<(SyncStatus, bool)> {
        self.inner.set_presence(user_id, online, at).await
    }

    async fn record_sync(&self, entry: SyncJournalEntry) -> SyncResult<()> {
        self.inner.record_sync(entry).await
    }

    async fn sync_history(
        &self,
        user_id: UserId,
        limit: Option<usize>,
    ) -> SyncResult<Vec<SyncJournalEntry>> {
        self.inner.sync_history(user_id, limit).await
    }
}

fn engine_over(backend: Arc<FaultyBackend>, settings: EngineSettings) -> SyncEngine {
    SyncEngine::new(
        backend,
        ConnectionManager::new_shared(),
        Arc::new(KvStore::new()),
        settings,
    )
}

fn create(id: &str, op_id: &str) -> NewOperation {
    let data = json!({"name": format!("P{id}"), "price": 1});
    NewOperation::new(
        OperationKind::Create,
        "products",
        id,
        data.as_object().cloned(),
    )
    .with_id(op_id)
}

fn status_of(backend: &FaultyBackend, user_id: UserId, operation_id: &str) -> OperationStatus {
    backend
        .inner
        .inspect(|store| store.operation(user_id, operation_id).map(|op| op.status))
        .unwrap()
}

#[tokio::test]
async fn cancel_between_operations_keeps_committed_work() {
    let cancel = CancellationToken::new();
    let backend = Arc::new(FaultyBackend {
        cancel_on_commit: Some(cancel.clone()),
        ..FaultyBackend::new()
    });
    let engine = engine_over(backend.clone(), EngineSettings::default());

    for (id, op_id) in [("1", "op-1"), ("2", "op-2"), ("3", "op-3")] {
        engine.enqueue(7, create(id, op_id)).await.unwrap();
    }

    let err = engine.sync_all(7, &cancel).await.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));

    assert_eq!(status_of(&backend, 7, "op-1"), OperationStatus::Completed);
    assert_eq!(status_of(&backend, 7, "op-2"), OperationStatus::Pending);
    assert_eq!(status_of(&backend, 7, "op-3"), OperationStatus::Pending);
    assert!(backend
        .inner
        .inspect(|store| store.get_record(&RecordKind::Products, "2").is_none()));

    let history = engine.list_sync_history(7, None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(!history[0].success);
    assert_eq!(history[0].operations_processed, 1);
    assert!(history[0].error.is_some());

    let status = engine.get_sync_status(7).await.unwrap();
    assert_eq!(status.pending_operations_count, 2);

    // The rest drains on the next session.
    let summary = engine.sync_all(7, &CancellationToken::new()).await.unwrap();
    assert_eq!(summary.ops_processed, 2);
    assert_eq!(status_of(&backend, 7, "op-3"), OperationStatus::Completed);
}

#[tokio::test]
async fn presence_lookup_failure_skips_only_that_user() {
    let backend = Arc::new(FaultyBackend {
        broken_user: Some(8),
        ..FaultyBackend::new()
    });
    let settings = EngineSettings {
        retry_policy: RetryPolicy::new(Duration::zero()),
        ..EngineSettings::default()
    };
    let engine = engine_over(backend.clone(), settings);
    let cancel = CancellationToken::new();

    for user_id in [7, 8] {
        engine.set_online(user_id).await.unwrap();
        engine.enqueue(user_id, create("1", "op-1")).await.unwrap();
        backend
            .mark_processing(user_id, "op-1", Utc::now())
            .await
            .unwrap();
        backend
            .mark_failed(user_id, "op-1", "store unavailable", Utc::now())
            .await
            .unwrap();
    }

    let report = engine
        .retry_failed(Utc::now() + Duration::minutes(1), &cancel)
        .await
        .unwrap();
    assert_eq!(report.reset, 1);
    assert_eq!(report.skipped_offline, 1);
    assert_eq!(status_of(&backend, 7, "op-1"), OperationStatus::Completed);
    assert_eq!(status_of(&backend, 8, "op-1"), OperationStatus::Failed);
}

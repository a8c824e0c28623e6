//! End-to-end sync sessions against the in-memory backend.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tether_engine::checksum::record_checksum;
use tether_engine::{
    ConflictKind, ConflictStatus, ModifiedBy, NewOperation, OperationKind, OperationStatus,
    Payload, RecordKind, RetryPolicy, StoredRecord, Strategy, SyncKind, Timestamp, VersionEntry,
};
use tether_server::error::SyncError;
use tether_server::kv::{sessions_key, KvStore};
use tether_server::storage::{MemoryBackend, SyncBackend};
use tether_server::sync::{EngineSettings, SyncEngine};
use tether_server::websocket::ConnectionManager;
use tokio_util::sync::CancellationToken;

const USER: i64 = 7;

fn payload(value: Value) -> Payload {
    value.as_object().cloned().unwrap()
}

struct Harness {
    backend: Arc<MemoryBackend>,
    engine: SyncEngine,
    cancel: CancellationToken,
}

impl Harness {
    fn new() -> Self {
        Self::with_settings(EngineSettings::default())
    }

    fn with_settings(settings: EngineSettings) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let engine = SyncEngine::new(
            backend.clone(),
            ConnectionManager::new_shared(),
            Arc::new(KvStore::new()),
            settings,
        );
        Self {
            backend,
            engine,
            cancel: CancellationToken::new(),
        }
    }

    fn seed_product(&self, id: &str, data: Value, updated_at: Timestamp) {
        self.backend.seed_record(StoredRecord {
            kind: RecordKind::Products,
            record_id: id.to_string(),
            data: payload(data),
            created_at: updated_at,
            updated_at,
        });
    }

    fn seed_version(&self, id: &str, data: Value) {
        self.backend.seed_version(VersionEntry::bump(
            None,
            USER,
            "products",
            id,
            &payload(data),
            ModifiedBy::Server,
            Utc::now(),
        ));
    }

    fn product(&self, id: &str) -> Option<Payload> {
        self.backend
            .inspect(|store| store.get_record(&RecordKind::Products, id).map(|r| r.data.clone()))
    }

    fn version(&self, id: &str) -> Option<VersionEntry> {
        self.backend
            .inspect(|store| store.version(USER, "products", id).cloned())
    }

    fn op_status(&self, operation_id: &str) -> OperationStatus {
        self.backend
            .inspect(|store| store.operation(USER, operation_id).map(|op| op.status))
            .unwrap()
    }
}

fn update(id: &str, op_id: &str, data: Value) -> NewOperation {
    NewOperation::new(OperationKind::Update, "products", id, Some(payload(data))).with_id(op_id)
}

#[tokio::test]
async fn clean_create_is_applied() {
    let h = Harness::new();
    h.engine
        .enqueue(
            USER,
            NewOperation::new(
                OperationKind::Create,
                "products",
                "42",
                Some(payload(json!({"name": "A", "price": 100}))),
            ),
        )
        .await
        .unwrap();

    let summary = h.engine.sync_all(USER, &h.cancel).await.unwrap();
    assert_eq!(summary.ops_processed, 1);
    assert_eq!(summary.conflicts_resolved, 0);
    assert!(summary.selective_data.is_none());

    let product = h.product("42").unwrap();
    assert_eq!(product["name"], json!("A"));
    assert_eq!(product["price"], json!(100));

    let committed = payload(json!({"name": "A", "price": 100}));
    let entry = h.version("42").unwrap();
    assert_eq!(entry.version, 1);
    assert_eq!(
        entry.checksum,
        record_checksum("products", "42", 1, "server", &committed)
    );
    assert!(entry.matches(&committed));

    let history = h.engine.list_sync_history(USER, None).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].success);
    assert_eq!(history[0].sync_type, SyncKind::Incremental);
    assert_eq!(history[0].sync_token, summary.sync_token);

    let status = h.engine.get_sync_status(USER).await.unwrap();
    assert_eq!(status.pending_operations_count, 0);
    assert_eq!(status.last_sync_token.as_deref(), Some(summary.sync_token.as_str()));
    assert_eq!(status.last_sync_ok, Some(true));
}

#[tokio::test]
async fn version_mismatch_keeps_server_data() {
    let h = Harness::new();
    let server = json!({"name": "Srv", "price": 9});
    h.seed_product("5", server.clone(), Utc::now());
    h.seed_version("5", server);

    h.engine
        .enqueue(USER, update("5", "op-upd", json!({"name": "Cli", "price": 11})))
        .await
        .unwrap();
    let summary = h.engine.sync_all(USER, &h.cancel).await.unwrap();
    assert_eq!(summary.ops_processed, 1);
    assert_eq!(summary.conflicts_resolved, 1);

    let conflicts = h
        .engine
        .list_conflicts(USER, Some(ConflictStatus::Resolved), None)
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictKind::VersionMismatch);
    assert_eq!(conflicts[0].resolution_strategy, Some(Strategy::ServerWins));

    let op = h
        .backend
        .inspect(|store| store.operation(USER, "op-upd").cloned())
        .unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.payload()["name"], json!("Srv"));

    let product = h.product("5").unwrap();
    assert_eq!(product["name"], json!("Srv"));
    assert_eq!(product["price"], json!(9));

    let entry = h.version("5").unwrap();
    assert_eq!(entry.version, 2);
    assert_eq!(
        entry.checksum,
        record_checksum("products", "5", 2, "server", &op.payload())
    );
    assert!(entry.matches(&op.payload()));
    assert!(!entry.matches(&payload(json!({"name": "Cli", "price": 11}))));
    assert_eq!(h.engine.get_sync_status(USER).await.unwrap().conflicts_count, 0);
}

#[tokio::test]
async fn second_edit_in_session_is_merged() {
    let h = Harness::new();
    h.seed_product("5", json!({"name": "Srv", "price": 9}), Utc::now());

    h.engine
        .enqueue(USER, update("5", "op-a", json!({"name": "Srv", "price": 9})))
        .await
        .unwrap();
    h.engine
        .enqueue(USER, update("5", "op-b", json!({"name": "Cli", "color": "red"})))
        .await
        .unwrap();

    let summary = h.engine.sync_all(USER, &h.cancel).await.unwrap();
    assert_eq!(summary.ops_processed, 2);
    assert_eq!(summary.conflicts_resolved, 1);

    let conflict = h
        .engine
        .list_conflicts(USER, None, None)
        .await
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(conflict.conflict_type, ConflictKind::ConcurrentEdit);
    assert_eq!(conflict.resolution_strategy, Some(Strategy::Merge));

    let resolved = conflict.resolved_data.unwrap();
    assert_eq!(resolved["name"], json!("Srv"));
    assert_eq!(resolved["price"], json!(9));
    assert_eq!(resolved["color"], json!("red"));
}

#[tokio::test]
async fn update_of_deleted_record_is_recorded() {
    let h = Harness::new();
    h.engine
        .enqueue(USER, update("9", "op-gone", json!({"name": "Cli", "price": 1})))
        .await
        .unwrap();

    let summary = h.engine.sync_all(USER, &h.cancel).await.unwrap();
    assert_eq!(summary.conflicts_resolved, 1);

    let conflicts = h.engine.list_conflicts(USER, None, None).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictKind::DeletedModified);
    assert_eq!(conflicts[0].resolved_data, Some(Payload::new()));

    assert_eq!(h.op_status("op-gone"), OperationStatus::Completed);
    assert!(h.product("9").is_none());
}

#[tokio::test]
async fn retries_stop_when_budget_is_spent() {
    let settings = EngineSettings {
        retry_policy: RetryPolicy::new(Duration::zero()),
        ..EngineSettings::default()
    };
    let h = Harness::with_settings(settings);
    h.seed_product("5", json!({"name": "Srv", "price": 9}), Utc::now());
    h.engine.set_online(USER).await.unwrap();

    h.engine
        .enqueue(USER, update("5", "op-bad", json!({"price": -5})))
        .await
        .unwrap();
    h.engine.sync_all(USER, &h.cancel).await.unwrap();
    assert_eq!(h.op_status("op-bad"), OperationStatus::Failed);

    for attempt in 1..=5 {
        let report = h.engine.retry_failed(Utc::now(), &h.cancel).await.unwrap();
        assert_eq!(report.reset, 1, "attempt {attempt}");
        assert_eq!(report.failed, 1, "attempt {attempt}");
    }

    let report = h.engine.retry_failed(Utc::now(), &h.cancel).await.unwrap();
    assert_eq!(report.reset, 0);

    let op = h
        .backend
        .inspect(|store| store.operation(USER, "op-bad").cloned())
        .unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.retry_count, 5);
    assert!(h.engine.list_pending(USER, None).await.unwrap().is_empty());
    assert_eq!(
        h.engine.get_sync_status(USER).await.unwrap().pending_operations_count,
        0
    );
}

#[tokio::test]
async fn retries_skip_offline_users() {
    let settings = EngineSettings {
        retry_policy: RetryPolicy::new(Duration::zero()),
        ..EngineSettings::default()
    };
    let h = Harness::with_settings(settings);
    h.seed_product("5", json!({"name": "Srv", "price": 9}), Utc::now());
    h.engine
        .enqueue(USER, update("5", "op-bad", json!({"price": -5})))
        .await
        .unwrap();
    h.engine.sync_all(USER, &h.cancel).await.unwrap();

    let report = h.engine.retry_failed(Utc::now(), &h.cancel).await.unwrap();
    assert_eq!(report.reset, 0);
    assert_eq!(report.skipped_offline, 1);
}

#[tokio::test]
async fn selective_sync_returns_changes_after_since() {
    let h = Harness::new();
    let t0 = Utc::now() - Duration::minutes(5);
    h.seed_product("3", json!({"name": "New", "price": 1}), t0 + Duration::seconds(10));
    h.seed_product("4", json!({"name": "Old", "price": 1}), t0 - Duration::seconds(10));

    let summary = h
        .engine
        .sync_selective(USER, Some(t0), &h.cancel)
        .await
        .unwrap();
    let data = summary.selective_data.unwrap();
    let products = &data["products"];
    assert_eq!(products.len(), 1);
    assert_eq!(products[0]["id"], json!(3));
    assert!(data["users"].is_empty());
    assert!(data["orders"].is_empty());

    // The next selective sync starts where this one did.
    let hint = h.engine.selective_since(USER).await.unwrap();
    assert!(hint > t0);
}

#[tokio::test]
async fn selective_since_falls_back_to_epoch() {
    let h = Harness::new();
    let since = h.engine.selective_since(USER).await.unwrap();
    assert_eq!(since, Timestamp::default());
}

#[tokio::test]
async fn enqueue_is_idempotent() {
    let h = Harness::new();
    let request = NewOperation::new(OperationKind::Delete, "products", "1", None).with_id("dup");

    let first = h.engine.enqueue(USER, request.clone()).await.unwrap();
    let second = h.engine.enqueue(USER, request).await.unwrap();
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(h.engine.list_pending(USER, None).await.unwrap().len(), 1);
    assert_eq!(
        h.engine.get_sync_status(USER).await.unwrap().pending_operations_count,
        1
    );
}

#[tokio::test]
async fn enqueue_rejects_bad_input() {
    let h = Harness::new();

    let err = h
        .engine
        .enqueue(USER, NewOperation::new(OperationKind::Update, "products", "1", None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "bad_payload");

    let err = h
        .engine
        .enqueue(USER, NewOperation::new(OperationKind::Delete, "Bad Kind", "1", None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "bad_kind");

    let err = h
        .engine
        .enqueue(
            USER,
            NewOperation::new(OperationKind::Delete, "products", "9223372036854775808", None),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "bad_record_id");
    assert!(h.engine.list_pending(USER, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn manual_conflict_waits_for_resolution() {
    let h = Harness::new();
    let server = json!({"name": "Srv", "price": 9});
    h.seed_product("5", server.clone(), Utc::now());
    h.seed_version("5", server);

    h.engine
        .enqueue(
            USER,
            update("5", "op-man", json!({"name": "Cli", "price": 11}))
                .with_strategy(Strategy::Manual),
        )
        .await
        .unwrap();
    let summary = h.engine.sync_all(USER, &h.cancel).await.unwrap();
    assert_eq!(summary.ops_processed, 0);
    assert_eq!(h.op_status("op-man"), OperationStatus::Processing);

    let pending = h
        .engine
        .list_conflicts(USER, Some(ConflictStatus::Pending), None)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    let conflict_id = pending[0].id;

    let analysis = h.engine.analyze_conflict(USER, conflict_id).await.unwrap();
    assert_eq!(analysis.conflicting_fields, vec!["name", "price"]);

    let err = h
        .engine
        .resolve_conflict(USER, conflict_id, Strategy::Manual, &h.cancel)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "bad_strategy");

    let resolved = h
        .engine
        .resolve_conflict(USER, conflict_id, Strategy::ClientWins, &h.cancel)
        .await
        .unwrap();
    assert_eq!(resolved.status, ConflictStatus::Resolved);
    assert_eq!(h.op_status("op-man"), OperationStatus::Completed);
    assert_eq!(h.product("5").unwrap()["name"], json!("Cli"));

    let err = h
        .engine
        .resolve_conflict(USER, conflict_id, Strategy::ServerWins, &h.cancel)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "bad_input");
}

#[tokio::test]
async fn unknown_conflict_is_not_found() {
    let h = Harness::new();
    let err = h.engine.analyze_conflict(USER, 404).await.unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
}

#[tokio::test]
async fn cancelled_session_does_nothing() {
    let h = Harness::new();
    h.engine
        .enqueue(USER, NewOperation::new(OperationKind::Delete, "products", "1", None))
        .await
        .unwrap();

    h.cancel.cancel();
    let err = h.engine.sync_all(USER, &h.cancel).await.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));
    assert_eq!(h.engine.list_pending(USER, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn force_sync_marks_user_online() {
    let h = Harness::new();
    h.engine.force_sync(USER, &h.cancel).await.unwrap();

    assert!(h.engine.get_sync_status(USER).await.unwrap().is_online);
    let history = h.engine.list_sync_history(USER, Some(1)).await.unwrap();
    assert_eq!(history[0].sync_type, SyncKind::Full);
}

#[tokio::test]
async fn history_is_newest_first() {
    let h = Harness::new();
    h.engine.sync_all(USER, &h.cancel).await.unwrap();
    h.engine
        .sync_selective(USER, None, &h.cancel)
        .await
        .unwrap();

    let history = h.engine.list_sync_history(USER, None).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].sync_type, SyncKind::Selective);
    assert_eq!(history[1].sync_type, SyncKind::Incremental);
    assert_eq!(h.engine.kv().get(&sessions_key(USER)).as_deref(), Some("2"));
}

#[tokio::test]
async fn recovery_fails_interrupted_operations() {
    let h = Harness::new();
    h.engine
        .enqueue(
            USER,
            NewOperation::new(OperationKind::Delete, "products", "1", None).with_id("stuck"),
        )
        .await
        .unwrap();
    h.engine
        .backend()
        .mark_processing(USER, "stuck", Utc::now())
        .await
        .unwrap();

    assert_eq!(h.engine.recover_interrupted().await.unwrap(), 1);
    let op = h
        .backend
        .inspect(|store| store.operation(USER, "stuck").cloned())
        .unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.error_message.as_deref(), Some("interrupted"));
}

#[tokio::test]
async fn recovery_keeps_operations_awaiting_resolution() {
    let h = Harness::new();
    let server = json!({"name": "Srv", "price": 9});
    h.seed_product("5", server.clone(), Utc::now());
    h.seed_version("5", server);
    h.engine
        .enqueue(
            USER,
            update("5", "op-man", json!({"name": "Cli", "price": 11}))
                .with_strategy(Strategy::Manual),
        )
        .await
        .unwrap();
    h.engine.sync_all(USER, &h.cancel).await.unwrap();

    assert_eq!(h.engine.recover_interrupted().await.unwrap(), 0);
    assert_eq!(h.op_status("op-man"), OperationStatus::Processing);
}

#[tokio::test]
async fn retry_pass_reclaims_stale_processing_operations() {
    let settings = EngineSettings {
        retry_policy: RetryPolicy::new(Duration::zero()),
        ..EngineSettings::default()
    };
    let h = Harness::with_settings(settings);
    h.engine.set_online(USER).await.unwrap();
    h.engine
        .enqueue(
            USER,
            NewOperation::new(
                OperationKind::Create,
                "products",
                "42",
                Some(payload(json!({"name": "A", "price": 100}))),
            )
            .with_id("op-mid"),
        )
        .await
        .unwrap();
    // A session dropped right after taking the operation.
    h.engine
        .backend()
        .mark_processing(USER, "op-mid", Utc::now())
        .await
        .unwrap();

    let report = h.engine.retry_failed(Utc::now(), &h.cancel).await.unwrap();
    assert_eq!(report.reclaimed, 0);
    assert_eq!(h.op_status("op-mid"), OperationStatus::Processing);

    let later = Utc::now() + Duration::hours(1);
    let report = h.engine.retry_failed(later, &h.cancel).await.unwrap();
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.reset, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(h.op_status("op-mid"), OperationStatus::Completed);
    assert_eq!(h.product("42").unwrap()["name"], json!("A"));
}

#[tokio::test]
async fn retry_pass_leaves_operations_awaiting_resolution() {
    let h = Harness::new();
    let server = json!({"name": "Srv", "price": 9});
    h.seed_product("5", server.clone(), Utc::now());
    h.seed_version("5", server);
    h.engine.set_online(USER).await.unwrap();
    h.engine
        .enqueue(
            USER,
            update("5", "op-man", json!({"name": "Cli", "price": 11}))
                .with_strategy(Strategy::Manual),
        )
        .await
        .unwrap();
    h.engine.sync_all(USER, &h.cancel).await.unwrap();

    let later = Utc::now() + Duration::hours(1);
    let report = h.engine.retry_failed(later, &h.cancel).await.unwrap();
    assert_eq!(report.reclaimed, 0);
    assert_eq!(h.op_status("op-man"), OperationStatus::Processing);
}

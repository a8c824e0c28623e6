//! The sync orchestrator.
//!
//! A session drains the user's pending operations in queue order, runs each
//! through conflict detection and resolution, commits it, then sweeps
//! leftover conflicts, journals the session and pushes `sync_completed`.
//!
//! Sessions and retry attempts of one user are serialized by [`UserLocks`].
//! Cancellation is honoured between operations only, never inside a commit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tether_engine::{
    analyze, detect, id, plan_resolved_write, resolve, resolve::resolve_conflict as settle,
    Analysis, Conflict, ConflictStatus, ModifiedBy, NewConflict, NewOperation, Operation,
    OperationKind, OperationStatus, Payload, RecordKind, RetryPolicy, SelectiveData,
    SessionEdits, StoredRecord, Strategy, SyncJournalEntry, SyncKind, SyncStatus, SyncSummary,
    Timestamp, UserId, WriteIntent,
};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::UserLocks;
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::kv::{selective_since_key, sessions_key, KvStore};
use crate::storage::{Enqueued, SyncBackend};
use crate::websocket::{Notifier, ServerMessage};

/// Tunables of the orchestrator.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Retry budget of newly enqueued operations.
    pub max_retries: u32,
    pub retry_policy: RetryPolicy,
    /// Lifetime of the selective-sync hint.
    pub hint_ttl: Duration,
    /// Age after which a `processing` operation with no session and no
    /// pending conflict is failed by the retry loop.
    pub stale_after: chrono::Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        let base_delay = chrono::Duration::from_std(config.retry_base_delay)
            .unwrap_or_else(|_| RetryPolicy::default().base_delay);
        Self {
            max_retries: config.max_retries,
            retry_policy: RetryPolicy::new(base_delay),
            hint_ttl: config.kv_hint_ttl,
            stale_after: chrono::Duration::from_std(config.processing_stale_after)
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
        }
    }
}

/// What one retry pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    /// Orphaned `processing` operations failed before the pass.
    pub reclaimed: usize,
    /// Operations reset to pending.
    pub reset: usize,
    /// Reset operations that then completed.
    pub completed: usize,
    /// Reset operations that failed again.
    pub failed: usize,
    /// Due operations skipped because their user is offline.
    pub skipped_offline: usize,
    /// Due operations skipped because their user had a session running.
    pub skipped_busy: usize,
}

enum OpOutcome {
    Completed { resolved: bool },
    AwaitingResolution { conflict_id: i64 },
}

/// Per-session bookkeeping.
struct Session {
    user_id: UserId,
    edits: SessionEdits,
    processed: u32,
    resolved: u32,
}

impl Session {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            edits: SessionEdits::new(),
            processed: 0,
            resolved: 0,
        }
    }
}

/// The sync engine: every public operation of the service goes through here.
pub struct SyncEngine {
    backend: Arc<dyn SyncBackend>,
    notifier: Arc<dyn Notifier>,
    kv: Arc<KvStore>,
    locks: UserLocks,
    presence_locks: UserLocks,
    settings: EngineSettings,
}

impl SyncEngine {
    pub fn new(
        backend: Arc<dyn SyncBackend>,
        notifier: Arc<dyn Notifier>,
        kv: Arc<KvStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            backend,
            notifier,
            kv,
            locks: UserLocks::new(),
            presence_locks: UserLocks::new(),
            settings,
        }
    }

    pub fn backend(&self) -> &Arc<dyn SyncBackend> {
        &self.backend
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // Queue

    /// Validate and queue an operation. Re-sending a known operation ID
    /// returns the stored operation without queuing it again.
    pub async fn enqueue(&self, user_id: UserId, request: NewOperation) -> SyncResult<Enqueued> {
        request.validate()?;

        let now = Utc::now();
        let operation_id = request
            .operation_id
            .clone()
            .unwrap_or_else(|| id::operation_id(now));
        let op = request.into_operation(user_id, operation_id, self.settings.max_retries, now);

        let enqueued = self.backend.enqueue(op).await?;
        let op = &enqueued.operation;
        if enqueued.created {
            info!(
                user_id,
                operation_id = %op.operation_id,
                operation_type = %op.operation_type,
                table_name = %op.table_name,
                record_id = %op.record_id,
                "Operation queued"
            );
            self.notifier
                .send_to_user(user_id, ServerMessage::operation_queued(op));
        } else {
            debug!(user_id, operation_id = %op.operation_id, "Duplicate enqueue ignored");
        }
        Ok(enqueued)
    }

    pub async fn list_pending(
        &self,
        user_id: UserId,
        limit: Option<usize>,
    ) -> SyncResult<Vec<Operation>> {
        self.backend.pending_operations(user_id, limit).await
    }

    // Sessions

    /// Drain the user's queue.
    pub async fn sync_all(
        &self,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> SyncResult<SyncSummary> {
        self.run_session(user_id, SyncKind::Incremental, None, cancel)
            .await
    }

    /// Drain the queue, then return every well-known record changed after
    /// `since`. Without `since` the stored hint, then the last sync time,
    /// then the epoch is used.
    pub async fn sync_selective(
        &self,
        user_id: UserId,
        since: Option<Timestamp>,
        cancel: &CancellationToken,
    ) -> SyncResult<SyncSummary> {
        let since = match since {
            Some(since) => since,
            None => self.selective_since(user_id).await?,
        };
        self.run_session(user_id, SyncKind::Selective, Some(since), cancel)
            .await
    }

    /// The `since` a selective sync without one starts from.
    pub async fn selective_since(&self, user_id: UserId) -> SyncResult<Timestamp> {
        let hint = self
            .kv
            .get(&selective_since_key(user_id))
            .and_then(|value| chrono::DateTime::parse_from_rfc3339(&value).ok())
            .map(|at| at.with_timezone(&Utc));
        if let Some(hint) = hint {
            return Ok(hint);
        }
        let status = self.backend.sync_status(user_id).await?;
        Ok(status.last_sync_at.unwrap_or_default())
    }

    /// Mark the user online, then run a full session.
    pub async fn force_sync(
        &self,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> SyncResult<SyncSummary> {
        self.set_online(user_id).await?;
        self.run_session(user_id, SyncKind::Full, None, cancel).await
    }

    async fn run_session(
        &self,
        user_id: UserId,
        kind: SyncKind,
        since: Option<Timestamp>,
        cancel: &CancellationToken,
    ) -> SyncResult<SyncSummary> {
        let _guard = self.lock_user(user_id, cancel).await?;
        let session_no = self.kv.incr(&sessions_key(user_id), 1);
        let started_at = Utc::now();
        let started = Instant::now();
        debug!(user_id, sync_type = %kind, session_no, "Sync session started");

        let mut session = Session::new(user_id);
        let outcome = self.session_body(&mut session, since, cancel).await;

        let now = Utc::now();
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let sync_token = id::sync_token(now);
        let entry = SyncJournalEntry {
            user_id,
            sync_type: kind,
            operations_processed: session.processed,
            conflicts_resolved: session.resolved,
            duration_ms,
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
            sync_token: sync_token.clone(),
            created_at: now,
        };
        if let Err(err) = self.backend.record_sync(entry).await {
            error!(
                user_id,
                sync_token = %sync_token,
                error = %err,
                "Failed to journal sync session"
            );
            if outcome.is_ok() {
                return Err(err);
            }
        }

        let selective_data = match outcome {
            Ok(data) => data,
            Err(err) => {
                warn!(user_id, sync_type = %kind, error = %err, "Sync session ended early");
                return Err(err);
            }
        };

        if kind == SyncKind::Selective {
            self.kv.set(
                selective_since_key(user_id),
                started_at.to_rfc3339(),
                Some(self.settings.hint_ttl),
            );
        }

        let summary = SyncSummary {
            ops_processed: session.processed,
            conflicts_resolved: session.resolved,
            duration_ms,
            sync_token,
            selective_data,
        };
        let sessions = self
            .notifier
            .send_to_user(user_id, ServerMessage::SyncCompleted(summary.clone()));

        info!(
            user_id,
            sync_type = %kind,
            ops_processed = summary.ops_processed,
            conflicts_resolved = summary.conflicts_resolved,
            duration_ms,
            sync_token = %summary.sync_token,
            notified_sessions = sessions,
            "Sync session completed"
        );
        Ok(summary)
    }

    async fn session_body(
        &self,
        session: &mut Session,
        since: Option<Timestamp>,
        cancel: &CancellationToken,
    ) -> SyncResult<Option<SelectiveData>> {
        self.drain(session, cancel).await?;
        self.sweep_conflicts(session, cancel).await?;
        match since {
            Some(since) => self.collect_selective(since).await.map(Some),
            None => Ok(None),
        }
    }

    async fn lock_user(
        &self,
        user_id: UserId,
        cancel: &CancellationToken,
    ) -> SyncResult<OwnedMutexGuard<()>> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        tokio::select! {
            guard = self.locks.acquire(user_id) => Ok(guard),
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
        }
    }

    async fn drain(&self, session: &mut Session, cancel: &CancellationToken) -> SyncResult<()> {
        let pending = self.backend.pending_operations(session.user_id, None).await?;
        debug!(user_id = session.user_id, count = pending.len(), "Draining queue");

        for op in pending {
            if cancel.is_cancelled() {
                info!(user_id = session.user_id, "Sync session cancelled between operations");
                return Err(SyncError::Cancelled);
            }
            match self.process_operation(&op, &mut session.edits).await {
                Ok(OpOutcome::Completed { resolved }) => {
                    session.processed += 1;
                    if resolved {
                        session.resolved += 1;
                    }
                }
                Ok(OpOutcome::AwaitingResolution { conflict_id }) => {
                    info!(
                        user_id = session.user_id,
                        operation_id = %op.operation_id,
                        conflict_id,
                        "Operation awaits manual resolution"
                    );
                }
                Err(err) => self.fail_operation(&op, &err).await,
            }
        }
        Ok(())
    }

    async fn process_operation(
        &self,
        op: &Operation,
        edits: &mut SessionEdits,
    ) -> SyncResult<OpOutcome> {
        let op = self
            .backend
            .mark_processing(op.user_id, &op.operation_id, Utc::now())
            .await?;

        let kind = op.record_kind()?;
        let server = self.backend.fetch_record(&kind, &op.record_id).await?;
        let version = self
            .backend
            .get_version(op.user_id, &op.table_name, &op.record_id)
            .await?;
        let server_data = server.as_ref().map(|record| &record.data);

        let Some(conflict_kind) = detect(&op, server_data, version.as_ref(), edits) else {
            let payload = op.payload();
            let intent = match op.operation_type {
                OperationKind::Create if server.is_some() => WriteIntent::Upsert(payload),
                OperationKind::Create => WriteIntent::Create(payload),
                OperationKind::Update => WriteIntent::Update(payload),
                OperationKind::Delete => WriteIntent::Delete,
            };
            self.commit(&op, &intent, edits).await?;
            return Ok(OpOutcome::Completed { resolved: false });
        };

        let server_snapshot = server_data.cloned().unwrap_or_default();
        let conflict = self
            .backend
            .insert_conflict(
                NewConflict::for_operation(&op, conflict_kind, server_snapshot),
                Utc::now(),
            )
            .await?;
        info!(
            user_id = op.user_id,
            operation_id = %op.operation_id,
            conflict_id = conflict.id,
            conflict_type = %conflict.conflict_type,
            strategy = %conflict.effective_strategy(),
            "Conflict detected"
        );

        let resolution = settle(&conflict);
        if !resolution.settled {
            return Ok(OpOutcome::AwaitingResolution {
                conflict_id: conflict.id,
            });
        }
        self.commit_resolution(&conflict, Some(&op), resolution.strategy, resolution.data, edits)
            .await?;
        Ok(OpOutcome::Completed { resolved: true })
    }

    /// Rewrite the operation payload, settle the conflict, then commit the
    /// operation with the write the resolution calls for.
    async fn commit_resolution(
        &self,
        conflict: &Conflict,
        op: Option<&Operation>,
        strategy: Strategy,
        data: Payload,
        edits: &mut SessionEdits,
    ) -> SyncResult<Conflict> {
        let op = match op {
            Some(op) => Some(
                self.backend
                    .update_operation_payload(
                        op.user_id,
                        &op.operation_id,
                        data.clone(),
                        Utc::now(),
                    )
                    .await?,
            ),
            None => None,
        };

        let resolved = self
            .backend
            .resolve_conflict(conflict.user_id, conflict.id, strategy, data.clone(), Utc::now())
            .await?;
        debug!(conflict_id = conflict.id, strategy = %strategy, "Conflict resolved");

        if let Some(op) = op {
            let kind = op.record_kind()?;
            let server_exists = self
                .backend
                .fetch_record(&kind, &op.record_id)
                .await?
                .is_some();
            let intent = plan_resolved_write(op.operation_type, strategy, server_exists, &data);
            self.commit(&op, &intent, edits).await?;
        }
        Ok(resolved)
    }

    async fn commit(
        &self,
        op: &Operation,
        intent: &WriteIntent,
        edits: &mut SessionEdits,
    ) -> SyncResult<()> {
        let entry = self
            .backend
            .commit_operation(op.user_id, &op.operation_id, intent, ModifiedBy::Server, Utc::now())
            .await?;
        if op.operation_type == OperationKind::Update {
            edits.record(&op.table_name, &op.record_id, &op.payload());
        }
        debug!(
            user_id = op.user_id,
            operation_id = %op.operation_id,
            version = entry.version,
            "Operation committed"
        );
        Ok(())
    }

    async fn fail_operation(&self, op: &Operation, err: &SyncError) {
        warn!(
            user_id = op.user_id,
            operation_id = %op.operation_id,
            code = err.code(),
            error = %err,
            "Operation failed"
        );
        if let Err(mark_err) = self
            .backend
            .mark_failed(op.user_id, &op.operation_id, &err.to_string(), Utc::now())
            .await
        {
            error!(
                user_id = op.user_id,
                operation_id = %op.operation_id,
                error = %mark_err,
                "Could not mark operation failed"
            );
        }
    }

    /// Settle pending conflicts that have a deterministic strategy.
    async fn sweep_conflicts(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let pending = self
            .backend
            .list_conflicts(session.user_id, Some(ConflictStatus::Pending), None)
            .await?;

        for conflict in pending {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let resolution = settle(&conflict);
            if !resolution.settled {
                continue;
            }

            let op = self.linked_processing_op(&conflict).await?;
            match self
                .commit_resolution(
                    &conflict,
                    op.as_ref(),
                    resolution.strategy,
                    resolution.data,
                    &mut session.edits,
                )
                .await
            {
                Ok(_) => {
                    session.resolved += 1;
                    if op.is_some() {
                        session.processed += 1;
                    }
                }
                Err(err) => {
                    warn!(conflict_id = conflict.id, error = %err, "Conflict sweep failed");
                    if let Some(op) = op {
                        self.fail_operation(&op, &err).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn linked_processing_op(&self, conflict: &Conflict) -> SyncResult<Option<Operation>> {
        let Some(operation_id) = conflict.operation_id.as_deref() else {
            return Ok(None);
        };
        Ok(self
            .backend
            .get_operation(conflict.user_id, operation_id)
            .await?
            .filter(|op| op.status == OperationStatus::Processing))
    }

    async fn collect_selective(&self, since: Timestamp) -> SyncResult<SelectiveData> {
        let mut data = SelectiveData::new();
        for kind in &RecordKind::WELL_KNOWN {
            let records = self.backend.records_updated_since(kind, since).await?;
            data.insert(
                kind.as_str().to_string(),
                records.iter().map(StoredRecord::to_json).collect(),
            );
        }
        Ok(data)
    }

    // Conflicts

    pub async fn list_conflicts(
        &self,
        user_id: UserId,
        status: Option<ConflictStatus>,
        limit: Option<usize>,
    ) -> SyncResult<Vec<Conflict>> {
        self.backend.list_conflicts(user_id, status, limit).await
    }

    pub async fn analyze_conflict(
        &self,
        user_id: UserId,
        conflict_id: i64,
    ) -> SyncResult<Analysis> {
        let conflict = self.conflict(user_id, conflict_id).await?;
        Ok(analyze(&conflict))
    }

    /// Settle a pending conflict with `strategy`. When its operation is
    /// still waiting in `processing`, the operation is committed with the
    /// resolved data.
    pub async fn resolve_conflict(
        &self,
        user_id: UserId,
        conflict_id: i64,
        strategy: Strategy,
        cancel: &CancellationToken,
    ) -> SyncResult<Conflict> {
        if strategy == Strategy::Manual {
            return Err(SyncError::bad_input(
                "bad_strategy",
                "manual does not settle a conflict",
            ));
        }

        let _guard = self.lock_user(user_id, cancel).await?;
        let conflict = self.conflict(user_id, conflict_id).await?;
        if !conflict.is_pending() {
            return Err(SyncError::bad_input(
                "bad_input",
                format!("conflict {conflict_id} is already {}", conflict.status),
            ));
        }

        let resolution = resolve(strategy, &conflict.local_data, &conflict.server_data);
        let op = self.linked_processing_op(&conflict).await?;
        let result = self
            .commit_resolution(
                &conflict,
                op.as_ref(),
                strategy,
                resolution.data,
                &mut SessionEdits::new(),
            )
            .await;

        match result {
            Ok(resolved) => {
                info!(user_id, conflict_id, strategy = %strategy, "Conflict resolved by request");
                Ok(resolved)
            }
            Err(err) => {
                if let Some(op) = op {
                    self.fail_operation(&op, &err).await;
                }
                Err(err)
            }
        }
    }

    async fn conflict(&self, user_id: UserId, conflict_id: i64) -> SyncResult<Conflict> {
        self.backend
            .get_conflict(user_id, conflict_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("conflict {conflict_id}")))
    }

    // Status, journal and presence

    pub async fn get_sync_status(&self, user_id: UserId) -> SyncResult<SyncStatus> {
        self.backend.sync_status(user_id).await
    }

    pub async fn list_sync_history(
        &self,
        user_id: UserId,
        limit: Option<usize>,
    ) -> SyncResult<Vec<SyncJournalEntry>> {
        self.backend.sync_history(user_id, limit).await
    }

    pub async fn set_online(&self, user_id: UserId) -> SyncResult<SyncStatus> {
        self.set_presence(user_id, true).await
    }

    pub async fn set_offline(&self, user_id: UserId) -> SyncResult<SyncStatus> {
        self.set_presence(user_id, false).await
    }

    /// Align stored presence with the user's live sessions: online while
    /// any is open. Calls for one user are serialized, so the last one to
    /// run sees the final session count.
    pub async fn sync_presence(&self, user_id: UserId) -> SyncResult<SyncStatus> {
        let _guard = self.presence_locks.acquire(user_id).await;
        let online = self.notifier.live_sessions(user_id) > 0;
        self.set_presence(user_id, online).await
    }

    async fn set_presence(&self, user_id: UserId, online: bool) -> SyncResult<SyncStatus> {
        let (status, changed) = self
            .backend
            .set_presence(user_id, online, Utc::now())
            .await?;
        if changed {
            let sessions = self
                .notifier
                .broadcast(ServerMessage::presence(user_id, online));
            info!(user_id, online, notified_sessions = sessions, "Presence changed");
        }
        Ok(status)
    }

    // Retry and recovery

    /// Fail stale orphaned `processing` operations, then reset every due
    /// failed operation of an online user and process it right away.
    /// Per-operation errors are logged, never returned.
    pub async fn retry_failed(
        &self,
        now: Timestamp,
        cancel: &CancellationToken,
    ) -> SyncResult<RetryReport> {
        let mut report = RetryReport {
            reclaimed: self.reclaim_stale(now, cancel).await?,
            ..RetryReport::default()
        };

        let failed = self.backend.failed_operations().await?;
        let mut online = std::collections::HashMap::new();

        for op in failed {
            if cancel.is_cancelled() {
                break;
            }
            if !self.settings.retry_policy.is_due(&op, now) {
                continue;
            }

            let is_online = match online.get(&op.user_id) {
                Some(is_online) => *is_online,
                None => {
                    let is_online = match self.backend.sync_status(op.user_id).await {
                        Ok(status) => status.is_online,
                        Err(err) => {
                            warn!(user_id = op.user_id, error = %err, "Presence lookup failed");
                            false
                        }
                    };
                    online.insert(op.user_id, is_online);
                    is_online
                }
            };
            if !is_online {
                report.skipped_offline += 1;
                continue;
            }

            let Some(_guard) = self.locks.try_acquire(op.user_id) else {
                report.skipped_busy += 1;
                continue;
            };
            if let Err(err) = self.retry_operation(&op, &mut report).await {
                warn!(
                    user_id = op.user_id,
                    operation_id = %op.operation_id,
                    error = %err,
                    "Retry attempt failed"
                );
            }
        }

        if report.reset > 0 {
            info!(
                reset = report.reset,
                completed = report.completed,
                failed = report.failed,
                "Retry pass finished"
            );
        }
        Ok(report)
    }

    async fn retry_operation(&self, op: &Operation, report: &mut RetryReport) -> SyncResult<()> {
        let op = self
            .backend
            .reset_for_retry(op.user_id, &op.operation_id, Utc::now())
            .await?;
        report.reset += 1;
        debug!(
            user_id = op.user_id,
            operation_id = %op.operation_id,
            retry_count = op.retry_count,
            "Operation reset for retry"
        );

        match self.process_operation(&op, &mut SessionEdits::new()).await {
            Ok(OpOutcome::Completed { .. }) => report.completed += 1,
            Ok(OpOutcome::AwaitingResolution { .. }) => {}
            Err(err) => {
                report.failed += 1;
                self.fail_operation(&op, &err).await;
            }
        }
        Ok(())
    }

    /// Fail `processing` operations not touched for `stale_after` whose
    /// user has no session running and which wait on no pending conflict.
    async fn reclaim_stale(&self, now: Timestamp, cancel: &CancellationToken) -> SyncResult<usize> {
        let processing = self.backend.processing_operations().await?;
        let mut reclaimed = 0;

        for op in processing {
            if cancel.is_cancelled() {
                break;
            }
            if now - op.updated_at < self.settings.stale_after {
                continue;
            }
            let Some(_guard) = self.locks.try_acquire(op.user_id) else {
                continue;
            };
            match self.fail_if_orphaned(&op).await {
                Ok(true) => reclaimed += 1,
                Ok(false) => {}
                Err(err) => warn!(
                    user_id = op.user_id,
                    operation_id = %op.operation_id,
                    error = %err,
                    "Could not reclaim stale operation"
                ),
            }
        }

        if reclaimed > 0 {
            warn!(reclaimed, "Stale processing operations marked failed");
        }
        Ok(reclaimed)
    }

    /// Fail every operation left in `processing` by a previous run, unless
    /// it is waiting on a pending conflict. Returns how many were failed.
    pub async fn recover_interrupted(&self) -> SyncResult<usize> {
        let processing = self.backend.processing_operations().await?;
        let mut recovered = 0;

        for op in processing {
            if self.fail_if_orphaned(&op).await? {
                recovered += 1;
            }
        }

        if recovered > 0 {
            warn!(recovered, "Interrupted operations marked failed");
        }
        Ok(recovered)
    }

    async fn fail_if_orphaned(&self, op: &Operation) -> SyncResult<bool> {
        let awaiting = self
            .backend
            .list_conflicts(op.user_id, Some(ConflictStatus::Pending), None)
            .await?
            .iter()
            .any(|conflict| conflict.operation_id.as_deref() == Some(op.operation_id.as_str()));
        if awaiting {
            return Ok(false);
        }

        self.backend
            .mark_failed(op.user_id, &op.operation_id, "interrupted", Utc::now())
            .await?;
        Ok(true)
    }
}

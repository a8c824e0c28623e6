//! Sync endpoint routes: queue, sessions, conflicts, journal and presence.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tether_engine::{
    Analysis, Conflict, ConflictStatus, NewOperation, Operation, OperationId, OperationStatus,
    Strategy, SyncJournalEntry, SyncStatus, SyncSummary, Timestamp,
};

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/operations", post(enqueue_handler))
        .route("/operations/pending", get(pending_handler))
        .route("/sync", post(sync_all_handler))
        .route("/sync/selective", post(sync_selective_handler))
        .route("/sync/force", post(force_sync_handler))
        .route("/sync/status", get(status_handler))
        .route("/sync/history", get(history_handler))
        .route("/conflicts", get(conflicts_handler))
        .route("/conflicts/{id}/analysis", get(analysis_handler))
        .route("/conflicts/{id}/resolve", post(resolve_handler))
        .route("/presence/online", post(online_handler))
        .route("/presence/offline", post(offline_handler))
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub operation_id: OperationId,
    pub status: OperationStatus,
    /// `false` when the operation ID had already been queued.
    pub created: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct SelectiveRequest {
    #[serde(default)]
    pub since: Option<Timestamp>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConflictsQuery {
    /// `pending` (default), `resolved`, `ignored` or `all`.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub strategy: String,
}

/// POST /operations - Queue an operation.
async fn enqueue_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<NewOperation>,
) -> Result<(StatusCode, Json<EnqueueResponse>)> {
    let enqueued = state.engine.enqueue(auth.user_id, request).await?;
    let status = if enqueued.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(EnqueueResponse {
            operation_id: enqueued.operation.operation_id,
            status: enqueued.operation.status,
            created: enqueued.created,
        }),
    ))
}

/// GET /operations/pending - Pending operations in queue order.
async fn pending_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<Operation>>> {
    let ops = state.engine.list_pending(auth.user_id, query.limit).await?;
    Ok(Json(ops))
}

/// POST /sync - Run an incremental session.
async fn sync_all_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<SyncSummary>> {
    let deadline = state.request_deadline();
    let summary = state.engine.sync_all(auth.user_id, deadline.token()).await?;
    Ok(Json(summary))
}

/// POST /sync/selective - Run a session and return records changed since.
async fn sync_selective_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<SelectiveRequest>,
) -> Result<Json<SyncSummary>> {
    let deadline = state.request_deadline();
    let summary = state
        .engine
        .sync_selective(auth.user_id, request.since, deadline.token())
        .await?;
    Ok(Json(summary))
}

/// POST /sync/force - Go online and run a full session.
async fn force_sync_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<SyncSummary>> {
    let deadline = state.request_deadline();
    let summary = state.engine.force_sync(auth.user_id, deadline.token()).await?;
    Ok(Json(summary))
}

/// GET /sync/status
async fn status_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<SyncStatus>> {
    Ok(Json(state.engine.get_sync_status(auth.user_id).await?))
}

/// GET /sync/history - Journal, newest first.
async fn history_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<SyncJournalEntry>>> {
    let entries = state
        .engine
        .list_sync_history(auth.user_id, query.limit)
        .await?;
    Ok(Json(entries))
}

/// GET /conflicts
async fn conflicts_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ConflictsQuery>,
) -> Result<Json<Vec<Conflict>>> {
    let status = match query.status.as_deref() {
        None => Some(ConflictStatus::Pending),
        Some("all") => None,
        Some(other) => Some(
            ConflictStatus::parse(other)
                .map_err(|_| AppError::BadRequest(format!("unknown conflict status: {other}")))?,
        ),
    };
    let conflicts = state
        .engine
        .list_conflicts(auth.user_id, status, query.limit)
        .await?;
    Ok(Json(conflicts))
}

/// GET /conflicts/{id}/analysis
async fn analysis_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conflict_id): Path<i64>,
) -> Result<Json<Analysis>> {
    let analysis = state
        .engine
        .analyze_conflict(auth.user_id, conflict_id)
        .await?;
    Ok(Json(analysis))
}

/// POST /conflicts/{id}/resolve - Settle a conflict with a strategy.
async fn resolve_handler(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conflict_id): Path<i64>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<Conflict>> {
    let strategy = Strategy::parse(&request.strategy)?;
    let deadline = state.request_deadline();
    let conflict = state
        .engine
        .resolve_conflict(auth.user_id, conflict_id, strategy, deadline.token())
        .await?;
    Ok(Json(conflict))
}

/// POST /presence/online
async fn online_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<SyncStatus>> {
    Ok(Json(state.engine.set_online(auth.user_id).await?))
}

/// POST /presence/offline
async fn offline_handler(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<SyncStatus>> {
    Ok(Json(state.engine.set_offline(auth.user_id).await?))
}

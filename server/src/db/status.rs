//! Database operations for `sync_status` and the `sync_history` journal.

use sqlx::{PgConnection, Row};
use tether_engine::{SyncJournalEntry, SyncKind, SyncStatus, Timestamp, UserId};

use super::{to_i32, to_i64, to_u32, to_u64};
use crate::error::SyncResult;

#[derive(Debug)]
pub struct StoredStatus {
    pub user_id: i64,
    pub pending_operations_count: i64,
    pub conflicts_count: i64,
    pub is_online: bool,
    pub last_online_at: Option<Timestamp>,
    pub last_sync_token: Option<String>,
    pub last_sync_at: Option<Timestamp>,
    pub last_sync_ok: Option<bool>,
    pub last_sync_error: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredStatus {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredStatus {
            user_id: row.try_get("user_id")?,
            pending_operations_count: row.try_get("pending_operations_count")?,
            conflicts_count: row.try_get("conflicts_count")?,
            is_online: row.try_get("is_online")?,
            last_online_at: row.try_get("last_online_at")?,
            last_sync_token: row.try_get("last_sync_token")?,
            last_sync_at: row.try_get("last_sync_at")?,
            last_sync_ok: row.try_get("last_sync_ok")?,
            last_sync_error: row.try_get("last_sync_error")?,
        })
    }
}

impl From<StoredStatus> for SyncStatus {
    fn from(row: StoredStatus) -> Self {
        SyncStatus {
            user_id: row.user_id,
            pending_operations_count: row.pending_operations_count,
            conflicts_count: row.conflicts_count,
            is_online: row.is_online,
            last_online_at: row.last_online_at,
            last_sync_token: row.last_sync_token,
            last_sync_at: row.last_sync_at,
            last_sync_ok: row.last_sync_ok,
            last_sync_error: row.last_sync_error,
        }
    }
}

/// Shift the counters of a user, creating the status row on first use.
pub async fn adjust_counters(
    conn: &mut PgConnection,
    user_id: UserId,
    pending_delta: i64,
    conflicts_delta: i64,
) -> SyncResult<()> {
    if pending_delta == 0 && conflicts_delta == 0 {
        return Ok(());
    }
    sqlx::query(
        r#"
        INSERT INTO sync_status (user_id, pending_operations_count, conflicts_count)
        VALUES ($1, GREATEST($2, 0), GREATEST($3, 0))
        ON CONFLICT (user_id) DO UPDATE SET
            pending_operations_count = GREATEST(sync_status.pending_operations_count + $2, 0),
            conflicts_count = GREATEST(sync_status.conflicts_count + $3, 0)
        "#,
    )
    .bind(user_id)
    .bind(pending_delta)
    .bind(conflicts_delta)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Status of a user. A user never seen before gets the zero status.
pub async fn get_status(
    conn: &mut PgConnection,
    user_id: UserId,
    for_update: bool,
) -> SyncResult<SyncStatus> {
    if for_update {
        sqlx::query(
            "INSERT INTO sync_status (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
        )
            .bind(user_id)
            .execute(&mut *conn)
            .await?;
    }
    let sql = format!(
        "SELECT * FROM sync_status WHERE user_id = $1{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    let status = sqlx::query_as::<_, StoredStatus>(&sql)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .map(SyncStatus::from)
        .unwrap_or_else(|| SyncStatus::new(user_id));
    Ok(status)
}

/// Write the presence and last-sync fields of a status row.
pub async fn save_status(conn: &mut PgConnection, status: &SyncStatus) -> SyncResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_status (
            user_id, is_online, last_online_at, last_sync_token,
            last_sync_at, last_sync_ok, last_sync_error
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (user_id) DO UPDATE SET
            is_online = EXCLUDED.is_online,
            last_online_at = EXCLUDED.last_online_at,
            last_sync_token = EXCLUDED.last_sync_token,
            last_sync_at = EXCLUDED.last_sync_at,
            last_sync_ok = EXCLUDED.last_sync_ok,
            last_sync_error = EXCLUDED.last_sync_error
        "#,
    )
    .bind(status.user_id)
    .bind(status.is_online)
    .bind(status.last_online_at)
    .bind(&status.last_sync_token)
    .bind(status.last_sync_at)
    .bind(status.last_sync_ok)
    .bind(&status.last_sync_error)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[derive(Debug)]
pub struct StoredJournalEntry {
    pub user_id: i64,
    pub sync_type: String,
    pub operations_processed: i32,
    pub conflicts_resolved: i32,
    pub duration_ms: i64,
    pub success: bool,
    pub error: Option<String>,
    pub sync_token: String,
    pub created_at: Timestamp,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredJournalEntry {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredJournalEntry {
            user_id: row.try_get("user_id")?,
            sync_type: row.try_get("sync_type")?,
            operations_processed: row.try_get("operations_processed")?,
            conflicts_resolved: row.try_get("conflicts_resolved")?,
            duration_ms: row.try_get("duration_ms")?,
            success: row.try_get("success")?,
            error: row.try_get("error")?,
            sync_token: row.try_get("sync_token")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl StoredJournalEntry {
    pub fn into_entry(self) -> SyncResult<SyncJournalEntry> {
        Ok(SyncJournalEntry {
            user_id: self.user_id,
            sync_type: SyncKind::parse(&self.sync_type)?,
            operations_processed: to_u32(self.operations_processed, "operations_processed")?,
            conflicts_resolved: to_u32(self.conflicts_resolved, "conflicts_resolved")?,
            duration_ms: to_u64(self.duration_ms, "duration_ms")?,
            success: self.success,
            error: self.error,
            sync_token: self.sync_token,
            created_at: self.created_at,
        })
    }
}

/// Append a journal row.
pub async fn insert_history(conn: &mut PgConnection, entry: &SyncJournalEntry) -> SyncResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_history (
            user_id, sync_type, operations_processed, conflicts_resolved,
            duration_ms, success, error, sync_token, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(entry.user_id)
    .bind(entry.sync_type.as_str())
    .bind(to_i32(entry.operations_processed, "operations_processed")?)
    .bind(to_i32(entry.conflicts_resolved, "conflicts_resolved")?)
    .bind(to_i64(entry.duration_ms, "duration_ms")?)
    .bind(entry.success)
    .bind(&entry.error)
    .bind(&entry.sync_token)
    .bind(entry.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Journal of a user, newest first.
pub async fn history(
    conn: &mut PgConnection,
    user_id: UserId,
    limit: Option<i64>,
) -> SyncResult<Vec<SyncJournalEntry>> {
    sqlx::query_as::<_, StoredJournalEntry>(
        "SELECT * FROM sync_history WHERE user_id = $1 ORDER BY id DESC LIMIT $2",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(StoredJournalEntry::into_entry)
    .collect()
}

//! Database operations for the `sync_conflicts` table.

use sqlx::{PgConnection, Row};
use tether_engine::{
    Conflict, ConflictKind, ConflictStatus, NewConflict, Strategy, Timestamp, UserId,
};

use super::to_payload;
use crate::error::SyncResult;

const SELECT_CONFLICT: &str = r#"
    SELECT id, user_id, operation_id, table_name, record_id, conflict_type,
           local_data, server_data, resolution_strategy, status, resolved_data,
           created_at, resolved_at
    FROM sync_conflicts
"#;

/// A stored conflict row.
#[derive(Debug)]
pub struct StoredConflict {
    pub id: i64,
    pub user_id: i64,
    pub operation_id: Option<String>,
    pub table_name: String,
    pub record_id: String,
    pub conflict_type: String,
    pub local_data: serde_json::Value,
    pub server_data: serde_json::Value,
    pub resolution_strategy: Option<String>,
    pub status: String,
    pub resolved_data: Option<serde_json::Value>,
    pub created_at: Timestamp,
    pub resolved_at: Option<Timestamp>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredConflict {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredConflict {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            operation_id: row.try_get("operation_id")?,
            table_name: row.try_get("table_name")?,
            record_id: row.try_get("record_id")?,
            conflict_type: row.try_get("conflict_type")?,
            local_data: row.try_get("local_data")?,
            server_data: row.try_get("server_data")?,
            resolution_strategy: row.try_get("resolution_strategy")?,
            status: row.try_get("status")?,
            resolved_data: row.try_get("resolved_data")?,
            created_at: row.try_get("created_at")?,
            resolved_at: row.try_get("resolved_at")?,
        })
    }
}

impl StoredConflict {
    pub fn into_conflict(self) -> SyncResult<Conflict> {
        Ok(Conflict {
            id: self.id,
            user_id: self.user_id,
            operation_id: self.operation_id,
            table_name: self.table_name,
            record_id: self.record_id,
            conflict_type: ConflictKind::parse(&self.conflict_type)?,
            local_data: to_payload(self.local_data, "local_data")?,
            server_data: to_payload(self.server_data, "server_data")?,
            resolution_strategy: self
                .resolution_strategy
                .as_deref()
                .map(Strategy::parse)
                .transpose()?,
            status: ConflictStatus::parse(&self.status)?,
            resolved_data: self
                .resolved_data
                .map(|v| to_payload(v, "resolved_data"))
                .transpose()?,
            created_at: self.created_at,
            resolved_at: self.resolved_at,
        })
    }
}

/// Persist a new pending conflict and return it with its ID.
pub async fn insert_conflict(
    conn: &mut PgConnection,
    conflict: NewConflict,
    at: Timestamp,
) -> SyncResult<Conflict> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO sync_conflicts (
            user_id, operation_id, table_name, record_id, conflict_type,
            local_data, server_data, resolution_strategy, status, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9)
        RETURNING id
        "#,
    )
    .bind(conflict.user_id)
    .bind(&conflict.operation_id)
    .bind(&conflict.table_name)
    .bind(&conflict.record_id)
    .bind(conflict.conflict_type.as_str())
    .bind(serde_json::Value::Object(conflict.local_data.clone()))
    .bind(serde_json::Value::Object(conflict.server_data.clone()))
    .bind(conflict.resolution_strategy.map(|s| s.as_str()))
    .bind(at)
    .fetch_one(&mut *conn)
    .await?;

    Ok(conflict.into_conflict(id, at))
}

/// Read one conflict of a user, optionally locking it.
pub async fn get_conflict(
    conn: &mut PgConnection,
    user_id: UserId,
    conflict_id: i64,
    for_update: bool,
) -> SyncResult<Option<Conflict>> {
    let sql = format!(
        "{SELECT_CONFLICT} WHERE user_id = $1 AND id = $2{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    sqlx::query_as::<_, StoredConflict>(&sql)
        .bind(user_id)
        .bind(conflict_id)
        .fetch_optional(&mut *conn)
        .await?
        .map(StoredConflict::into_conflict)
        .transpose()
}

/// Conflicts of a user, oldest first, optionally filtered by status.
pub async fn list_conflicts(
    conn: &mut PgConnection,
    user_id: UserId,
    status: Option<ConflictStatus>,
    limit: Option<i64>,
) -> SyncResult<Vec<Conflict>> {
    let sql = format!(
        "{SELECT_CONFLICT} WHERE user_id = $1 AND ($2::text IS NULL OR status = $2) \
         ORDER BY id ASC LIMIT $3"
    );
    sqlx::query_as::<_, StoredConflict>(&sql)
        .bind(user_id)
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(StoredConflict::into_conflict)
        .collect()
}

/// Write back a resolution decided by the engine.
pub async fn save_resolution(conn: &mut PgConnection, conflict: &Conflict) -> SyncResult<()> {
    sqlx::query(
        r#"
        UPDATE sync_conflicts
        SET status = $3, resolution_strategy = $4, resolved_data = $5, resolved_at = $6
        WHERE user_id = $1 AND id = $2
        "#,
    )
    .bind(conflict.user_id)
    .bind(conflict.id)
    .bind(conflict.status.as_str())
    .bind(conflict.resolution_strategy.map(|s| s.as_str()))
    .bind(conflict.resolved_data.clone().map(serde_json::Value::Object))
    .bind(conflict.resolved_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

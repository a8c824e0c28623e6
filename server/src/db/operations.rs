//! Database operations for the `offline_operations` table.

use sqlx::{PgConnection, Row};
use tether_engine::{
    Operation, OperationKind, OperationStatus, Strategy, Timestamp, UserId,
};

use super::{to_i32, to_i64, to_payload, to_u32, to_u64};
use crate::error::{SyncError, SyncResult};

const SELECT_OPERATION: &str = r#"
    SELECT operation_id, user_id, operation_type, table_name, record_id, data,
           strategy, base_version, status, retry_count, max_retries,
           error_message, created_at, updated_at
    FROM offline_operations
"#;

/// A stored operation row from the database.
#[derive(Debug)]
pub struct StoredOperation {
    pub operation_id: String,
    pub user_id: i64,
    pub operation_type: String,
    pub table_name: String,
    pub record_id: String,
    pub data: Option<serde_json::Value>,
    pub strategy: Option<String>,
    pub base_version: Option<i64>,
    pub status: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredOperation {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredOperation {
            operation_id: row.try_get("operation_id")?,
            user_id: row.try_get("user_id")?,
            operation_type: row.try_get("operation_type")?,
            table_name: row.try_get("table_name")?,
            record_id: row.try_get("record_id")?,
            data: row.try_get("data")?,
            strategy: row.try_get("strategy")?,
            base_version: row.try_get("base_version")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl StoredOperation {
    /// Convert a database row into an engine operation.
    pub fn into_operation(self) -> SyncResult<Operation> {
        Ok(Operation {
            operation_type: OperationKind::parse(&self.operation_type)?,
            status: OperationStatus::parse(&self.status)?,
            strategy: self.strategy.as_deref().map(Strategy::parse).transpose()?,
            base_version: self
                .base_version
                .map(|v| to_u64(v, "base_version"))
                .transpose()?,
            data: self.data.map(|v| to_payload(v, "operation data")).transpose()?,
            retry_count: to_u32(self.retry_count, "retry_count")?,
            max_retries: to_u32(self.max_retries, "max_retries")?,
            operation_id: self.operation_id,
            user_id: self.user_id,
            table_name: self.table_name,
            record_id: self.record_id,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn into_operations(rows: Vec<StoredOperation>) -> SyncResult<Vec<Operation>> {
    rows.into_iter().map(StoredOperation::into_operation).collect()
}

/// Insert an operation. Returns `false` if the ID was already queued.
pub async fn insert_operation(conn: &mut PgConnection, op: &Operation) -> SyncResult<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO offline_operations (
            operation_id, user_id, operation_type, table_name, record_id, data,
            strategy, base_version, status, retry_count, max_retries,
            error_message, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (user_id, operation_id) DO NOTHING
        "#,
    )
    .bind(&op.operation_id)
    .bind(op.user_id)
    .bind(op.operation_type.as_str())
    .bind(&op.table_name)
    .bind(&op.record_id)
    .bind(op.data.clone().map(serde_json::Value::Object))
    .bind(op.strategy.map(|s| s.as_str()))
    .bind(op.base_version.map(|v| to_i64(v, "base_version")).transpose()?)
    .bind(op.status.as_str())
    .bind(to_i32(op.retry_count, "retry_count")?)
    .bind(to_i32(op.max_retries, "max_retries")?)
    .bind(&op.error_message)
    .bind(op.created_at)
    .bind(op.updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Fetch one operation, optionally locking its row for the transaction.
pub async fn get_operation(
    conn: &mut PgConnection,
    user_id: UserId,
    operation_id: &str,
    for_update: bool,
) -> SyncResult<Option<Operation>> {
    let sql = format!(
        "{SELECT_OPERATION} WHERE user_id = $1 AND operation_id = $2{}",
        if for_update { " FOR UPDATE" } else { "" }
    );
    sqlx::query_as::<_, StoredOperation>(&sql)
        .bind(user_id)
        .bind(operation_id)
        .fetch_optional(&mut *conn)
        .await?
        .map(StoredOperation::into_operation)
        .transpose()
}

/// Like [`get_operation`] with a row lock, but absence is an error.
pub async fn lock_operation(
    conn: &mut PgConnection,
    user_id: UserId,
    operation_id: &str,
) -> SyncResult<Operation> {
    get_operation(conn, user_id, operation_id, true)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("operation {operation_id}")))
}

/// Pending operations of a user in queue order.
pub async fn pending_for_user(
    conn: &mut PgConnection,
    user_id: UserId,
    limit: Option<i64>,
) -> SyncResult<Vec<Operation>> {
    let sql = format!(
        "{SELECT_OPERATION} WHERE user_id = $1 AND status = 'pending' \
         ORDER BY created_at ASC, operation_id ASC LIMIT $2"
    );
    let rows = sqlx::query_as::<_, StoredOperation>(&sql)
        .bind(user_id)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;
    into_operations(rows)
}

/// Operations of every user in `status`, in queue order per user.
pub async fn with_status(
    conn: &mut PgConnection,
    status: OperationStatus,
) -> SyncResult<Vec<Operation>> {
    let sql = format!(
        "{SELECT_OPERATION} WHERE status = $1 \
         ORDER BY user_id ASC, created_at ASC, operation_id ASC"
    );
    let rows = sqlx::query_as::<_, StoredOperation>(&sql)
        .bind(status.as_str())
        .fetch_all(&mut *conn)
        .await?;
    into_operations(rows)
}

/// Write back the mutable fields of an operation.
pub async fn save_operation(conn: &mut PgConnection, op: &Operation) -> SyncResult<()> {
    sqlx::query(
        r#"
        UPDATE offline_operations
        SET data = $3, status = $4, retry_count = $5, error_message = $6, updated_at = $7
        WHERE user_id = $1 AND operation_id = $2
        "#,
    )
    .bind(op.user_id)
    .bind(&op.operation_id)
    .bind(op.data.clone().map(serde_json::Value::Object))
    .bind(op.status.as_str())
    .bind(to_i32(op.retry_count, "retry_count")?)
    .bind(&op.error_message)
    .bind(op.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

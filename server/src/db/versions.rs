//! Database operations for the `data_versions` registry.

use sqlx::{PgConnection, Row};
use tether_engine::{ModifiedBy, Timestamp, UserId, VersionEntry};

use super::{to_i64, to_u64};
use crate::error::SyncResult;

/// A stored version row.
#[derive(Debug)]
pub struct StoredVersion {
    pub user_id: i64,
    pub table_name: String,
    pub record_id: String,
    pub version: i64,
    pub last_modified_by: String,
    pub last_modified_at: Timestamp,
    pub checksum: String,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredVersion {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredVersion {
            user_id: row.try_get("user_id")?,
            table_name: row.try_get("table_name")?,
            record_id: row.try_get("record_id")?,
            version: row.try_get("version")?,
            last_modified_by: row.try_get("last_modified_by")?,
            last_modified_at: row.try_get("last_modified_at")?,
            checksum: row.try_get("checksum")?,
        })
    }
}

impl StoredVersion {
    pub fn into_entry(self) -> SyncResult<VersionEntry> {
        Ok(VersionEntry {
            user_id: self.user_id,
            table_name: self.table_name,
            record_id: self.record_id,
            version: to_u64(self.version, "version")?,
            last_modified_by: ModifiedBy::parse(&self.last_modified_by)?,
            last_modified_at: self.last_modified_at,
            checksum: self.checksum,
        })
    }
}

/// Read the version entry of a record, optionally locking it.
pub async fn get_version(
    conn: &mut PgConnection,
    user_id: UserId,
    table_name: &str,
    record_id: &str,
    for_update: bool,
) -> SyncResult<Option<VersionEntry>> {
    let sql = format!(
        r#"
        SELECT user_id, table_name, record_id, version, last_modified_by,
               last_modified_at, checksum
        FROM data_versions
        WHERE user_id = $1 AND table_name = $2 AND record_id = $3{}
        "#,
        if for_update { " FOR UPDATE" } else { "" }
    );
    sqlx::query_as::<_, StoredVersion>(&sql)
        .bind(user_id)
        .bind(table_name)
        .bind(record_id)
        .fetch_optional(&mut *conn)
        .await?
        .map(StoredVersion::into_entry)
        .transpose()
}

/// Store `entry`, replacing the previous version of the record.
pub async fn upsert_version(conn: &mut PgConnection, entry: &VersionEntry) -> SyncResult<()> {
    sqlx::query(
        r#"
        INSERT INTO data_versions (
            user_id, table_name, record_id, version, last_modified_by,
            last_modified_at, checksum
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (user_id, table_name, record_id) DO UPDATE SET
            version = EXCLUDED.version,
            last_modified_by = EXCLUDED.last_modified_by,
            last_modified_at = EXCLUDED.last_modified_at,
            checksum = EXCLUDED.checksum
        "#,
    )
    .bind(entry.user_id)
    .bind(&entry.table_name)
    .bind(&entry.record_id)
    .bind(to_i64(entry.version, "version")?)
    .bind(entry.last_modified_by.as_str())
    .bind(entry.last_modified_at)
    .bind(&entry.checksum)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

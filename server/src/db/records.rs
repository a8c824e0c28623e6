//! Record gateway: typed tables for the well-known kinds plus the
//! schemaless `generic_records` table for every other kind name.

use sqlx::{postgres::PgRow, PgConnection, Row};
use tether_engine::{
    Order, OrderItem, Product, RecordKind, RecordPayload, RowChange, StoredRecord, Timestamp, User,
};

use super::{to_i64, to_payload, to_u64};
use crate::error::{SyncError, SyncResult};

/// A row from `users`.
#[derive(Debug)]
pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub avatar_url: Option<String>,
    pub is_active: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl<'r> sqlx::FromRow<'r, PgRow> for UserRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(UserRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            phone: row.try_get("phone")?,
            avatar_url: row.try_get("avatar_url")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl UserRow {
    fn into_record(self) -> StoredRecord {
        let user = User {
            name: self.name,
            email: self.email,
            phone: self.phone,
            avatar_url: self.avatar_url,
            is_active: self.is_active,
        };
        StoredRecord {
            kind: RecordKind::Users,
            record_id: self.id.to_string(),
            data: RecordPayload::User(user).to_payload(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// A row from `products`.
#[derive(Debug)]
pub struct ProductRow {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub price: i64,
    pub stock: i64,
    pub category: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl<'r> sqlx::FromRow<'r, PgRow> for ProductRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ProductRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            price: row.try_get("price")?,
            stock: row.try_get("stock")?,
            category: row.try_get("category")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl ProductRow {
    fn into_record(self) -> StoredRecord {
        let product = Product {
            name: self.name,
            description: self.description,
            price: self.price,
            stock: self.stock,
            category: self.category,
        };
        StoredRecord {
            kind: RecordKind::Products,
            record_id: self.id.to_string(),
            data: RecordPayload::Product(product).to_payload(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// A row from `orders`. Items are kept as a JSONB array.
#[derive(Debug)]
pub struct OrderRow {
    pub id: i64,
    pub user_id: i64,
    pub status: String,
    pub items: serde_json::Value,
    pub total: i64,
    pub notes: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl<'r> sqlx::FromRow<'r, PgRow> for OrderRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OrderRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            status: row.try_get("status")?,
            items: row.try_get("items")?,
            total: row.try_get("total")?,
            notes: row.try_get("notes")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl OrderRow {
    fn into_record(self) -> SyncResult<StoredRecord> {
        let items: Vec<OrderItem> = serde_json::from_value(self.items)?;
        let order = Order {
            user_id: to_u64(self.user_id, "orders.user_id")?,
            status: self.status,
            items,
            total: self.total,
            notes: self.notes,
        };
        Ok(StoredRecord {
            kind: RecordKind::Orders,
            record_id: self.id.to_string(),
            data: RecordPayload::Order(order).to_payload(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// A row from `generic_records`.
#[derive(Debug)]
pub struct GenericRow {
    pub table_name: String,
    pub record_id: String,
    pub data: serde_json::Value,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl<'r> sqlx::FromRow<'r, PgRow> for GenericRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(GenericRow {
            table_name: row.try_get("table_name")?,
            record_id: row.try_get("record_id")?,
            data: row.try_get("data")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl GenericRow {
    fn into_record(self) -> SyncResult<StoredRecord> {
        Ok(StoredRecord {
            kind: RecordKind::parse(&self.table_name)?,
            data: to_payload(self.data, "generic_records.data")?,
            record_id: self.record_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Numeric primary key of a well-known record.
fn numeric_id(kind: &RecordKind, record_id: &str) -> SyncResult<i64> {
    match kind.parse_record_id(record_id)? {
        Some(id) => to_i64(id, "record id"),
        None => Err(SyncError::Internal(format!(
            "{kind} has no numeric primary key"
        ))),
    }
}

/// Read one record, optionally locking its row.
pub async fn fetch_record(
    conn: &mut PgConnection,
    kind: &RecordKind,
    record_id: &str,
    for_update: bool,
) -> SyncResult<Option<StoredRecord>> {
    let lock = if for_update { " FOR UPDATE" } else { "" };

    let record = match kind {
        RecordKind::Users => {
            let sql = format!("SELECT * FROM users WHERE id = $1{lock}");
            sqlx::query_as::<_, UserRow>(&sql)
                .bind(numeric_id(kind, record_id)?)
                .fetch_optional(&mut *conn)
                .await?
                .map(UserRow::into_record)
        }
        RecordKind::Products => {
            let sql = format!("SELECT * FROM products WHERE id = $1{lock}");
            sqlx::query_as::<_, ProductRow>(&sql)
                .bind(numeric_id(kind, record_id)?)
                .fetch_optional(&mut *conn)
                .await?
                .map(ProductRow::into_record)
        }
        RecordKind::Orders => {
            let sql = format!("SELECT * FROM orders WHERE id = $1{lock}");
            sqlx::query_as::<_, OrderRow>(&sql)
                .bind(numeric_id(kind, record_id)?)
                .fetch_optional(&mut *conn)
                .await?
                .map(OrderRow::into_record)
                .transpose()?
        }
        RecordKind::Other(name) => {
            kind.parse_record_id(record_id)?;
            let sql = format!(
                "SELECT * FROM generic_records WHERE table_name = $1 AND record_id = $2{lock}"
            );
            sqlx::query_as::<_, GenericRow>(&sql)
                .bind(name)
                .bind(record_id)
                .fetch_optional(&mut *conn)
                .await?
                .map(GenericRow::into_record)
                .transpose()?
        }
    };

    Ok(record)
}

/// Records of `kind` changed after `since`, oldest first.
pub async fn records_updated_since(
    conn: &mut PgConnection,
    kind: &RecordKind,
    since: Timestamp,
) -> SyncResult<Vec<StoredRecord>> {
    match kind {
        RecordKind::Users => Ok(sqlx::query_as::<_, UserRow>(
            "SELECT * FROM users WHERE updated_at > $1 ORDER BY updated_at ASC, id ASC",
        )
        .bind(since)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(UserRow::into_record)
        .collect()),
        RecordKind::Products => Ok(sqlx::query_as::<_, ProductRow>(
            "SELECT * FROM products WHERE updated_at > $1 ORDER BY updated_at ASC, id ASC",
        )
        .bind(since)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(ProductRow::into_record)
        .collect()),
        RecordKind::Orders => sqlx::query_as::<_, OrderRow>(
            "SELECT * FROM orders WHERE updated_at > $1 ORDER BY updated_at ASC, id ASC",
        )
        .bind(since)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(OrderRow::into_record)
        .collect(),
        RecordKind::Other(name) => sqlx::query_as::<_, GenericRow>(
            r#"
            SELECT * FROM generic_records
            WHERE table_name = $1 AND updated_at > $2
            ORDER BY updated_at ASC, record_id ASC
            "#,
        )
        .bind(name)
        .bind(since)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(GenericRow::into_record)
        .collect(),
    }
}

/// Apply a planned row change. Inserts and replacements share one upsert
/// that never touches `created_at` of an existing row.
pub async fn apply_change(
    conn: &mut PgConnection,
    kind: &RecordKind,
    record_id: &str,
    change: RowChange,
    at: Timestamp,
) -> SyncResult<()> {
    match change {
        RowChange::Insert(payload) | RowChange::Replace(payload) => {
            write_payload(conn, kind, record_id, payload, at).await
        }
        RowChange::Delete => delete_record(conn, kind, record_id).await,
        RowChange::Unchanged => Ok(()),
    }
}

async fn write_payload(
    conn: &mut PgConnection,
    kind: &RecordKind,
    record_id: &str,
    payload: RecordPayload,
    at: Timestamp,
) -> SyncResult<()> {
    match payload {
        RecordPayload::User(user) => {
            sqlx::query(
                r#"
                INSERT INTO users (
                    id, name, email, phone, avatar_url, is_active, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
                ON CONFLICT (id) DO UPDATE SET
                    name = EXCLUDED.name,
                    email = EXCLUDED.email,
                    phone = EXCLUDED.phone,
                    avatar_url = EXCLUDED.avatar_url,
                    is_active = EXCLUDED.is_active,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(numeric_id(kind, record_id)?)
            .bind(&user.name)
            .bind(&user.email)
            .bind(&user.phone)
            .bind(&user.avatar_url)
            .bind(user.is_active)
            .bind(at)
            .execute(&mut *conn)
            .await?;
        }
        RecordPayload::Product(product) => {
            sqlx::query(
                r#"
                INSERT INTO products (
                    id, name, description, price, stock, category, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
                ON CONFLICT (id) DO UPDATE SET
                    name = EXCLUDED.name,
                    description = EXCLUDED.description,
                    price = EXCLUDED.price,
                    stock = EXCLUDED.stock,
                    category = EXCLUDED.category,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(numeric_id(kind, record_id)?)
            .bind(&product.name)
            .bind(&product.description)
            .bind(product.price)
            .bind(product.stock)
            .bind(&product.category)
            .bind(at)
            .execute(&mut *conn)
            .await?;
        }
        RecordPayload::Order(order) => {
            sqlx::query(
                r#"
                INSERT INTO orders (
                    id, user_id, status, items, total, notes, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
                ON CONFLICT (id) DO UPDATE SET
                    user_id = EXCLUDED.user_id,
                    status = EXCLUDED.status,
                    items = EXCLUDED.items,
                    total = EXCLUDED.total,
                    notes = EXCLUDED.notes,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(numeric_id(kind, record_id)?)
            .bind(to_i64(order.user_id, "orders.user_id")?)
            .bind(&order.status)
            .bind(serde_json::to_value(&order.items)?)
            .bind(order.total)
            .bind(&order.notes)
            .bind(at)
            .execute(&mut *conn)
            .await?;
        }
        RecordPayload::Other(data) => {
            sqlx::query(
                r#"
                INSERT INTO generic_records (table_name, record_id, data, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $4)
                ON CONFLICT (table_name, record_id) DO UPDATE SET
                    data = EXCLUDED.data,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(kind.as_str())
            .bind(record_id)
            .bind(serde_json::Value::Object(data))
            .bind(at)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

async fn delete_record(
    conn: &mut PgConnection,
    kind: &RecordKind,
    record_id: &str,
) -> SyncResult<()> {
    let result = match kind {
        RecordKind::Other(name) => {
            sqlx::query("DELETE FROM generic_records WHERE table_name = $1 AND record_id = $2")
                .bind(name)
                .bind(record_id)
                .execute(&mut *conn)
                .await?
        }
        well_known => {
            let sql = format!("DELETE FROM {} WHERE id = $1", well_known.as_str());
            sqlx::query(&sql)
                .bind(numeric_id(kind, record_id)?)
                .execute(&mut *conn)
                .await?
        }
    };

    if result.rows_affected() == 0 {
        return Err(SyncError::NotFound(format!("{kind} record {record_id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_id_requires_well_known_kind() {
        assert_eq!(numeric_id(&RecordKind::Products, "42").unwrap(), 42);
        assert_eq!(numeric_id(&RecordKind::Users, "x").unwrap_err().code(), "bad_record_id");
        let notes = RecordKind::parse("notes").unwrap();
        assert!(numeric_id(&notes, "a-1").is_err());
    }

    #[test]
    fn order_row_decodes_items() {
        let now = chrono::Utc::now();
        let row = OrderRow {
            id: 9,
            user_id: 3,
            status: "paid".into(),
            items: serde_json::json!([{"product_id": 1, "quantity": 2, "price": 150}]),
            total: 300,
            notes: None,
            created_at: now,
            updated_at: now,
        };
        let record = row.into_record().unwrap();
        assert_eq!(record.record_id, "9");
        assert_eq!(record.data["total"], 300);
        assert_eq!(record.data["items"][0]["quantity"], 2);
    }
}

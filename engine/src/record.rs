//! Record kinds, typed schemas and the gateway write pipeline.
//!
//! Three kinds are known natively (`users`, `products`, `orders`) and are
//! decoded into typed schemas. Any other kind name goes through the generic
//! path and is stored as a schemaless mapping.
//!
//! Every write passes through explicit stages instead of save hooks:
//!
//! 1. **decode**: payload mapping into the kind's schema
//! 2. **normalize**: trim/lowercase/derive fields
//! 3. **validate**: reject values the store must never hold
//! 4. **plan**: compare with the current row and produce a [`RowChange`]

use crate::{error::Result, Error, Payload, RecordId, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Symbolic name of a record type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RecordKind {
    Users,
    Products,
    Orders,
    /// Generic kind stored in the schemaless side table.
    Other(String),
}

impl RecordKind {
    /// The natively supported kinds, in selective-sync order.
    pub const WELL_KNOWN: [RecordKind; 3] =
        [RecordKind::Users, RecordKind::Products, RecordKind::Orders];

    /// Parse a kind name.
    ///
    /// Generic names must be lowercase identifiers (`[a-z][a-z0-9_]*`, at most
    /// 63 bytes) since they end up as keys in the side table.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "users" => Ok(RecordKind::Users),
            "products" => Ok(RecordKind::Products),
            "orders" => Ok(RecordKind::Orders),
            other if is_identifier(other) => Ok(RecordKind::Other(other.to_string())),
            other => Err(Error::BadKind(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RecordKind::Users => "users",
            RecordKind::Products => "products",
            RecordKind::Orders => "orders",
            RecordKind::Other(name) => name,
        }
    }

    pub fn is_well_known(&self) -> bool {
        !matches!(self, RecordKind::Other(_))
    }

    /// Coerce a record ID. Well-known kinds require an unsigned integer that
    /// fits a BIGINT key.
    pub fn parse_record_id(&self, record_id: &str) -> Result<Option<u64>> {
        if record_id.is_empty() {
            return Err(Error::BadRecordId(record_id.to_string()));
        }
        if !self.is_well_known() {
            return Ok(None);
        }
        record_id
            .parse::<u64>()
            .ok()
            .filter(|id| i64::try_from(*id).is_ok())
            .map(Some)
            .ok_or_else(|| Error::BadRecordId(record_id.to_string()))
    }

    /// Run decode, normalize and validate over a full payload.
    pub fn decode(&self, data: &Payload) -> Result<RecordPayload> {
        Ok(match self {
            RecordKind::Users => RecordPayload::User(prepare::<User>(data)?),
            RecordKind::Products => RecordPayload::Product(prepare::<Product>(data)?),
            RecordKind::Orders => RecordPayload::Order(prepare::<Order>(data)?),
            RecordKind::Other(_) => RecordPayload::Other(data.clone()),
        })
    }

    /// Plan the row change for `intent` given the current row, if any.
    pub fn plan_write(
        &self,
        record_id: &str,
        intent: &WriteIntent,
        existing: Option<&Payload>,
    ) -> Result<RowChange> {
        self.parse_record_id(record_id)?;

        match (intent, existing) {
            (WriteIntent::Skip, _) => Ok(RowChange::Unchanged),
            (WriteIntent::Create(_), Some(_)) => Err(Error::RecordAlreadyExists {
                kind: self.as_str().to_string(),
                id: record_id.to_string(),
            }),
            (WriteIntent::Create(data), None) | (WriteIntent::Upsert(data), None) => {
                Ok(RowChange::Insert(self.decode(data)?))
            }
            (WriteIntent::Update(patch), Some(current))
            | (WriteIntent::Upsert(patch), Some(current)) => {
                Ok(RowChange::Replace(self.decode(&overlay(current, patch))?))
            }
            (WriteIntent::Delete, Some(_)) => Ok(RowChange::Delete),
            (WriteIntent::Update(_), None) | (WriteIntent::Delete, None) => {
                Err(Error::RecordNotFound {
                    kind: self.as_str().to_string(),
                    id: record_id.to_string(),
                })
            }
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for RecordKind {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        RecordKind::parse(&value)
    }
}

impl From<RecordKind> for String {
    fn from(kind: RecordKind) -> Self {
        kind.as_str().to_string()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && name.len() <= 63
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Overlay `patch` onto `current`, key by key.
pub fn overlay(current: &Payload, patch: &Payload) -> Payload {
    let mut merged = current.clone();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Normalization and validation stages shared by the typed schemas.
pub trait RecordSchema: Serialize + DeserializeOwned {
    /// Canonicalize field values before validation.
    fn normalize(&mut self) {}

    /// Reject values that must never reach the store.
    fn validate(&self) -> Result<()>;
}

fn prepare<T: RecordSchema>(data: &Payload) -> Result<T> {
    let mut record: T = serde_json::from_value(Value::Object(data.clone()))
        .map_err(|e| Error::BadPayload(e.to_string()))?;
    record.normalize();
    record.validate()?;
    Ok(record)
}

fn default_true() -> bool {
    true
}

/// Schema of the `users` kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

impl RecordSchema for User {
    fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.email = self.email.trim().to_lowercase();
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::BadPayload("users.name must not be empty".into()));
        }
        match self.email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
            _ => Err(Error::BadPayload(format!(
                "users.email is not an address: {}",
                self.email
            ))),
        }
    }
}

/// Schema of the `products` kind. Prices are in minor currency units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub price: i64,
    #[serde(default)]
    pub stock: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl RecordSchema for Product {
    fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::BadPayload("products.name must not be empty".into()));
        }
        if self.price < 0 {
            return Err(Error::BadPayload("products.price must not be negative".into()));
        }
        if self.stock < 0 {
            return Err(Error::BadPayload("products.stock must not be negative".into()));
        }
        Ok(())
    }
}

/// Statuses an order may be in.
pub const ORDER_STATUSES: [&str; 5] = ["pending", "paid", "shipped", "delivered", "cancelled"];

fn default_order_status() -> String {
    "pending".to_string()
}

/// A single order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: u64,
    pub quantity: u32,
    pub price: i64,
}

/// Schema of the `orders` kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub user_id: u64,
    #[serde(default = "default_order_status")]
    pub status: String,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    /// Derived from the items when omitted.
    #[serde(default)]
    pub total: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl RecordSchema for Order {
    fn normalize(&mut self) {
        self.status = self.status.trim().to_lowercase();
        if self.total == 0 {
            self.total = self
                .items
                .iter()
                .map(|item| item.price.saturating_mul(i64::from(item.quantity)))
                .sum();
        }
    }

    fn validate(&self) -> Result<()> {
        if !ORDER_STATUSES.contains(&self.status.as_str()) {
            return Err(Error::BadPayload(format!(
                "orders.status is not one of {ORDER_STATUSES:?}: {}",
                self.status
            )));
        }
        if self.items.iter().any(|item| item.quantity == 0) {
            return Err(Error::BadPayload("orders.items quantity must be positive".into()));
        }
        if self.total < 0 {
            return Err(Error::BadPayload("orders.total must not be negative".into()));
        }
        Ok(())
    }
}

/// A decoded payload: typed for the well-known kinds, raw otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordPayload {
    User(User),
    Product(Product),
    Order(Order),
    Other(Payload),
}

impl RecordPayload {
    /// Serialize back into a payload mapping.
    pub fn to_payload(&self) -> Payload {
        let value = match self {
            RecordPayload::User(user) => serde_json::to_value(user),
            RecordPayload::Product(product) => serde_json::to_value(product),
            RecordPayload::Order(order) => serde_json::to_value(order),
            RecordPayload::Other(data) => return data.clone(),
        };
        match value {
            Ok(Value::Object(map)) => map,
            // Plain structs with string keys always serialize to objects.
            _ => Payload::new(),
        }
    }
}

/// What the orchestrator wants to happen to a record.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteIntent {
    Create(Payload),
    /// Patch the existing record.
    Update(Payload),
    /// Patch if present, create otherwise.
    Upsert(Payload),
    Delete,
    /// Commit the operation without touching the record.
    Skip,
}

/// The planned row change, after the pipeline stages ran.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    Insert(RecordPayload),
    Replace(RecordPayload),
    Delete,
    Unchanged,
}

/// A record row as the gateway reads it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub kind: RecordKind,
    pub record_id: RecordId,
    pub data: Payload,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl StoredRecord {
    /// JSON shape sent to clients: the payload plus id and timestamps.
    pub fn to_json(&self) -> Value {
        let mut map = self.data.clone();
        let id = match self.kind.parse_record_id(&self.record_id) {
            Ok(Some(numeric)) => Value::from(numeric),
            _ => Value::from(self.record_id.clone()),
        };
        map.insert("id".into(), id);
        map.insert("created_at".into(), Value::from(self.created_at.to_rfc3339()));
        map.insert("updated_at".into(), Value::from(self.updated_at.to_rfc3339()));
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn parse_kinds() {
        assert_eq!(RecordKind::parse("users").unwrap(), RecordKind::Users);
        assert_eq!(
            RecordKind::parse("notes").unwrap(),
            RecordKind::Other("notes".into())
        );
        assert!(RecordKind::parse("").is_err());
        assert!(RecordKind::parse("Notes").is_err());
        assert!(RecordKind::parse("notes; drop table users").is_err());
        assert!(RecordKind::parse("1notes").is_err());
    }

    #[test]
    fn kind_serializes_as_string() {
        let json = serde_json::to_string(&RecordKind::Products).unwrap();
        assert_eq!(json, r#""products""#);
        let kind: RecordKind = serde_json::from_str(r#""audit_log""#).unwrap();
        assert_eq!(kind, RecordKind::Other("audit_log".into()));
        assert!(serde_json::from_str::<RecordKind>(r#""Bad Kind""#).is_err());
    }

    #[test]
    fn record_id_coercion() {
        assert_eq!(RecordKind::Orders.parse_record_id("17").unwrap(), Some(17));
        assert!(RecordKind::Orders.parse_record_id("-1").is_err());
        assert!(RecordKind::Orders.parse_record_id("x").is_err());
        assert_eq!(
            RecordKind::Orders.parse_record_id("9223372036854775807").unwrap(),
            Some(i64::MAX as u64)
        );
        assert!(RecordKind::Orders
            .parse_record_id("9223372036854775808")
            .is_err());
        assert_eq!(
            RecordKind::Other("notes".into())
                .parse_record_id("a-b")
                .unwrap(),
            None
        );
        assert!(RecordKind::Other("notes".into())
            .parse_record_id("")
            .is_err());
    }

    #[test]
    fn user_pipeline_normalizes_and_validates() {
        let decoded = RecordKind::Users
            .decode(&payload(json!({"name": " Ada ", "email": " ADA@Example.com"})))
            .unwrap();
        match decoded {
            RecordPayload::User(user) => {
                assert_eq!(user.name, "Ada");
                assert_eq!(user.email, "ada@example.com");
                assert!(user.is_active);
            }
            other => panic!("expected user, got {other:?}"),
        }

        let err = RecordKind::Users
            .decode(&payload(json!({"name": "Ada", "email": "nope"})))
            .unwrap_err();
        assert!(matches!(err, Error::BadPayload(_)));
    }

    #[test]
    fn order_total_is_derived() {
        let decoded = RecordKind::Orders
            .decode(&payload(json!({
                "user_id": 7,
                "items": [
                    {"product_id": 1, "quantity": 2, "price": 150},
                    {"product_id": 2, "quantity": 1, "price": 99}
                ]
            })))
            .unwrap();
        let data = decoded.to_payload();
        assert_eq!(data["total"], json!(399));
        assert_eq!(data["status"], json!("pending"));
    }

    #[test]
    fn product_payload_round_trips_cleanly() {
        let data = payload(json!({"name": "A", "price": 100}));
        let decoded = RecordKind::Products.decode(&data).unwrap();
        assert_eq!(
            Value::Object(decoded.to_payload()),
            json!({"name": "A", "price": 100, "stock": 0})
        );
    }

    #[test]
    fn plan_update_overlays_patch() {
        let current = payload(json!({"name": "Srv", "price": 9, "stock": 3}));
        let change = RecordKind::Products
            .plan_write(
                "5",
                &WriteIntent::Update(payload(json!({"price": 11}))),
                Some(&current),
            )
            .unwrap();

        match change {
            RowChange::Replace(RecordPayload::Product(p)) => {
                assert_eq!(p.name, "Srv");
                assert_eq!(p.price, 11);
                assert_eq!(p.stock, 3);
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn plan_rejects_missing_and_duplicate_rows() {
        let data = payload(json!({"name": "A", "price": 1}));
        let err = RecordKind::Products
            .plan_write("1", &WriteIntent::Update(data.clone()), None)
            .unwrap_err();
        assert!(err.is_not_found());

        let err = RecordKind::Products
            .plan_write("1", &WriteIntent::Create(data.clone()), Some(&data))
            .unwrap_err();
        assert!(matches!(err, Error::RecordAlreadyExists { .. }));

        assert_eq!(
            RecordKind::Products
                .plan_write("1", &WriteIntent::Delete, Some(&data))
                .unwrap(),
            RowChange::Delete
        );
        assert_eq!(
            RecordKind::Products
                .plan_write("1", &WriteIntent::Skip, None)
                .unwrap(),
            RowChange::Unchanged
        );
    }

    #[test]
    fn upsert_creates_when_absent() {
        let data = payload(json!({"title": "hello"}));
        let change = RecordKind::Other("notes".into())
            .plan_write("n-1", &WriteIntent::Upsert(data.clone()), None)
            .unwrap();
        assert_eq!(change, RowChange::Insert(RecordPayload::Other(data)));
    }

    #[test]
    fn stored_record_json_includes_identity() {
        let now = chrono::Utc::now();
        let record = StoredRecord {
            kind: RecordKind::Products,
            record_id: "3".into(),
            data: payload(json!({"name": "A", "price": 1})),
            created_at: now,
            updated_at: now,
        };
        let json = record.to_json();
        assert_eq!(json["id"], json!(3));
        assert_eq!(json["name"], json!("A"));
        assert!(json["updated_at"].is_string());
    }
}

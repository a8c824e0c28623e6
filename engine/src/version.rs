//! Per-record version registry entries.

use crate::{checksum, error::Result, Error, Payload, RecordId, Timestamp, UserId, Version};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who committed the last write of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModifiedBy {
    Server,
    Client,
}

impl ModifiedBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModifiedBy::Server => "server",
            ModifiedBy::Client => "client",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "server" => Ok(ModifiedBy::Server),
            "client" => Ok(ModifiedBy::Client),
            other => Err(Error::BadPayload(format!("unknown modifier: {other}"))),
        }
    }
}

impl fmt::Display for ModifiedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Version metadata for one `(user, kind, record)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub user_id: UserId,
    pub table_name: String,
    pub record_id: RecordId,
    pub version: Version,
    pub last_modified_by: ModifiedBy,
    pub last_modified_at: Timestamp,
    pub checksum: String,
}

impl VersionEntry {
    /// Compute the entry following `previous` after committing `payload`.
    ///
    /// Absent entries start at version 1. This is the only way a version is
    /// produced, which keeps the per-record sequence strictly increasing.
    pub fn bump(
        previous: Option<&VersionEntry>,
        user_id: UserId,
        table_name: &str,
        record_id: &str,
        payload: &Payload,
        modified_by: ModifiedBy,
        at: Timestamp,
    ) -> VersionEntry {
        let version = previous.map_or(1, |entry| entry.version + 1);
        VersionEntry {
            user_id,
            table_name: table_name.to_string(),
            record_id: record_id.to_string(),
            version,
            last_modified_by: modified_by,
            last_modified_at: at,
            checksum: checksum::record_checksum(
                table_name,
                record_id,
                version,
                modified_by.as_str(),
                payload,
            ),
        }
    }

    /// Checksum `payload` would have under this entry's identity and version.
    pub fn checksum_for(&self, payload: &Payload) -> String {
        checksum::record_checksum(
            &self.table_name,
            &self.record_id,
            self.version,
            self.last_modified_by.as_str(),
            payload,
        )
    }

    /// Whether `payload` is exactly what was last committed.
    pub fn matches(&self, payload: &Payload) -> bool {
        self.checksum_for(payload) == self.checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn bump_starts_at_one_and_increments() {
        let now = Utc::now();
        let data = payload(json!({"name": "A"}));

        let first = VersionEntry::bump(None, 7, "products", "42", &data, ModifiedBy::Server, now);
        assert_eq!(first.version, 1);
        assert_eq!(first.last_modified_by, ModifiedBy::Server);

        let second = VersionEntry::bump(
            Some(&first),
            7,
            "products",
            "42",
            &data,
            ModifiedBy::Server,
            now,
        );
        assert_eq!(second.version, 2);
        assert_ne!(first.checksum, second.checksum);
    }

    #[test]
    fn matches_detects_divergence() {
        let now = Utc::now();
        let committed = payload(json!({"name": "Srv", "price": 9}));
        let entry =
            VersionEntry::bump(None, 1, "products", "5", &committed, ModifiedBy::Server, now);

        assert!(entry.matches(&payload(json!({"price": 9, "name": "Srv"}))));
        assert!(!entry.matches(&payload(json!({"name": "Cli", "price": 11}))));
    }
}

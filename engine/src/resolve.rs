//! Conflict resolution.
//!
//! This is the core of determinism. Given the same local and server data, a
//! strategy always produces byte-identical resolved data, on any host.
//!
//! # Merge
//!
//! Start from the server data, then for every non-null client field:
//! 1. absent on the server: take the client value
//! 2. canonically equal: keep it
//! 3. different: type-directed tie-break (see [`tie_break`])

use crate::{
    checksum,
    conflict::{Conflict, ConflictKind, Strategy},
    operation::OperationKind,
    record::WriteIntent,
    Payload,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Result of applying a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub strategy: Strategy,
    pub data: Payload,
    /// `false` when the conflict must stay pending (manual strategy).
    pub settled: bool,
}

/// Apply `strategy` to a pair of payloads.
pub fn resolve(strategy: Strategy, local: &Payload, server: &Payload) -> Resolution {
    let (data, settled) = match strategy {
        Strategy::ServerWins => (server.clone(), true),
        Strategy::ClientWins => (local.clone(), true),
        Strategy::Merge => (merge(local, server), true),
        Strategy::Manual => (server.clone(), false),
    };
    Resolution {
        strategy,
        data,
        settled,
    }
}

/// Resolve a persisted conflict with its effective strategy.
pub fn resolve_conflict(conflict: &Conflict) -> Resolution {
    resolve(
        conflict.effective_strategy(),
        &conflict.local_data,
        &conflict.server_data,
    )
}

/// Field-wise merge of client data into server data.
pub fn merge(local: &Payload, server: &Payload) -> Payload {
    let mut merged = server.clone();
    for (key, local_value) in local {
        if local_value.is_null() {
            continue;
        }
        let chosen = match server.get(key) {
            None => local_value.clone(),
            Some(server_value) if checksum::canonical_eq(local_value, server_value) => {
                server_value.clone()
            }
            Some(server_value) => tie_break(local_value, server_value).clone(),
        };
        merged.insert(key.clone(), chosen);
    }
    merged
}

/// Pick between two differing values of the same key.
///
/// - mapping or array: server
/// - strings: the longer one, server on equal length
/// - numbers: the larger one, server when numerically equal
/// - booleans: `true`
/// - anything else, including mixed types: server
pub fn tie_break<'a>(local: &'a Value, server: &'a Value) -> &'a Value {
    match (local, server) {
        (Value::String(l), Value::String(s)) => {
            if l.chars().count() > s.chars().count() {
                local
            } else {
                server
            }
        }
        (Value::Number(_), Value::Number(_)) => {
            if compare_numbers(local, server) == Ordering::Greater {
                local
            } else {
                server
            }
        }
        (Value::Bool(l), Value::Bool(_)) => {
            if *l {
                local
            } else {
                server
            }
        }
        _ => server,
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Ordering {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a.cmp(&b);
    }
    if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
        return a.cmp(&b);
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}

/// What to write once a conflict on `op_kind` has been resolved.
///
/// Server-wins leaves the store untouched (the server copy already is the
/// resolved data), and an empty resolution has nothing to write.
pub fn plan_resolved_write(
    op_kind: OperationKind,
    strategy: Strategy,
    server_exists: bool,
    resolved: &Payload,
) -> WriteIntent {
    match op_kind {
        OperationKind::Delete => match strategy {
            Strategy::ClientWins if server_exists => WriteIntent::Delete,
            _ => WriteIntent::Skip,
        },
        OperationKind::Create | OperationKind::Update => {
            if resolved.is_empty() || strategy == Strategy::ServerWins {
                WriteIntent::Skip
            } else {
                WriteIntent::Upsert(resolved.clone())
            }
        }
    }
}

/// Conflict severity, by number of conflicting fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_field_count(count: usize) -> Self {
        match count {
            0 => Severity::Low,
            1..=2 => Severity::Medium,
            3..=5 => Severity::High,
            _ => Severity::Critical,
        }
    }
}

/// Human-facing summary of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub conflicting_fields: Vec<String>,
    pub severity: Severity,
    pub recommended_strategy: Strategy,
    pub description: String,
}

/// Fields whose values differ between the two sides, sorted.
///
/// A field present on one side only counts when its value is non-null.
pub fn conflicting_fields(local: &Payload, server: &Payload) -> Vec<String> {
    let keys: BTreeSet<&String> = local.keys().chain(server.keys()).collect();
    keys.into_iter()
        .filter(|key| match (local.get(*key), server.get(*key)) {
            (Some(l), Some(s)) => !checksum::canonical_eq(l, s),
            (Some(v), None) | (None, Some(v)) => !v.is_null(),
            (None, None) => false,
        })
        .cloned()
        .collect()
}

pub fn analyze(conflict: &Conflict) -> Analysis {
    let fields = conflicting_fields(&conflict.local_data, &conflict.server_data);
    let severity = Severity::from_field_count(fields.len());

    // Wide divergence on a live record is left to a person.
    let recommended_strategy = match (severity, conflict.conflict_type) {
        (Severity::Critical, ConflictKind::VersionMismatch | ConflictKind::ConcurrentEdit) => {
            Strategy::Manual
        }
        _ => conflict.conflict_type.default_strategy(),
    };

    let description = match fields.len() {
        0 => format!(
            "{} on {}/{} with no field differences",
            conflict.conflict_type, conflict.table_name, conflict.record_id
        ),
        n => format!(
            "{} on {}/{}: {} conflicting field(s): {}",
            conflict.conflict_type,
            conflict.table_name,
            conflict.record_id,
            n,
            fields.join(", ")
        ),
    };

    Analysis {
        conflicting_fields: fields,
        severity,
        recommended_strategy,
        description,
    }
}

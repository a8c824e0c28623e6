//! Operation types for queued offline mutations.
//!
//! Clients never mutate server records directly. They enqueue operations that
//! the orchestrator drains in arrival order, which is what lets a device keep
//! working while disconnected.

use crate::{
    conflict::Strategy, error::Result, record::RecordKind, Error, OperationId, Payload, RecordId,
    Timestamp, UserId, Version,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Default retry budget for a newly enqueued operation.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// The kind of mutation an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "create" => Ok(OperationKind::Create),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            other => Err(Error::BadPayload(format!("unknown operation type: {other}"))),
        }
    }

    /// Create and update carry a payload; delete may omit it.
    pub fn requires_payload(&self) -> bool {
        !matches!(self, OperationKind::Delete)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a queued operation.
///
/// ```text
///        enqueue              take              apply ok
///  (new) ──────► pending ───► processing ─────► completed
///                  ▲              │
///                  │              └─ apply fail ─► failed
///                  └──────── retry reset ◄─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(OperationStatus::Pending),
            "processing" => Ok(OperationStatus::Processing),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(Error::BadPayload(format!("unknown operation status: {other}"))),
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `processing -> failed` also covers operations interrupted by a crash,
    /// and the only way back to `pending` is the retry reset from `failed`.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client request to enqueue an operation.
///
/// Status and retry bookkeeping are assigned by the queue; the ID is optional
/// so clients that generate their own IDs get idempotent retries of enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOperation {
    #[serde(default)]
    pub operation_id: Option<OperationId>,
    pub operation_type: OperationKind,
    pub table_name: String,
    pub record_id: RecordId,
    #[serde(default)]
    pub data: Option<Payload>,
    /// Strategy to apply if this operation triggers a conflict.
    #[serde(default)]
    pub strategy: Option<Strategy>,
    /// The record version the client last observed.
    #[serde(default)]
    pub base_version: Option<Version>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl NewOperation {
    pub fn new(
        operation_type: OperationKind,
        table_name: impl Into<String>,
        record_id: impl Into<RecordId>,
        data: Option<Payload>,
    ) -> Self {
        Self {
            operation_id: None,
            operation_type,
            table_name: table_name.into(),
            record_id: record_id.into(),
            data,
            strategy: None,
            base_version: None,
            max_retries: None,
        }
    }

    pub fn with_id(mut self, operation_id: impl Into<OperationId>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_base_version(mut self, version: Version) -> Self {
        self.base_version = Some(version);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Check the request shape before anything is persisted.
    ///
    /// Creates against a well-known kind are decoded in full so that a bad
    /// payload is rejected at enqueue time instead of failing on every retry.
    pub fn validate(&self) -> Result<RecordKind> {
        let kind = RecordKind::parse(&self.table_name)?;
        kind.parse_record_id(&self.record_id)?;

        if self.operation_id.as_deref().is_some_and(str::is_empty) {
            return Err(Error::BadPayload("operation_id must not be empty".into()));
        }

        match (&self.data, self.operation_type.requires_payload()) {
            (None, true) => Err(Error::BadPayload(format!(
                "{} requires a data payload",
                self.operation_type
            ))),
            (Some(data), _) if self.operation_type == OperationKind::Create => {
                kind.decode(data)?;
                Ok(kind)
            }
            _ => Ok(kind),
        }
    }

    /// Materialize the queued operation for `user_id`.
    pub fn into_operation(
        self,
        user_id: UserId,
        operation_id: OperationId,
        default_max_retries: u32,
        now: Timestamp,
    ) -> Operation {
        Operation {
            operation_id,
            user_id,
            operation_type: self.operation_type,
            table_name: self.table_name,
            record_id: self.record_id,
            data: self.data,
            strategy: self.strategy,
            base_version: self.base_version,
            status: OperationStatus::Pending,
            retry_count: 0,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A durable queued operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: OperationId,
    pub user_id: UserId,
    pub operation_type: OperationKind,
    pub table_name: String,
    pub record_id: RecordId,
    pub data: Option<Payload>,
    pub strategy: Option<Strategy>,
    pub base_version: Option<Version>,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Operation {
    /// The payload, or an empty mapping for payload-less deletes.
    pub fn payload(&self) -> Payload {
        self.data.clone().unwrap_or_default()
    }

    pub fn record_kind(&self) -> Result<RecordKind> {
        RecordKind::parse(&self.table_name)
    }

    /// Whether the retry loop may still reset this operation.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Move to `next`, enforcing the status state machine.
    pub fn transition(&mut self, next: OperationStatus, at: Timestamp) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                op_id: self.operation_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }

    pub fn mark_processing(&mut self, at: Timestamp) -> Result<()> {
        self.transition(OperationStatus::Processing, at)
    }

    pub fn mark_completed(&mut self, at: Timestamp) -> Result<()> {
        self.transition(OperationStatus::Completed, at)?;
        self.error_message = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, at: Timestamp) -> Result<()> {
        self.transition(OperationStatus::Failed, at)?;
        self.error_message = Some(error.into());
        Ok(())
    }

    /// Reset a failed operation for another attempt, consuming one retry.
    pub fn reset_for_retry(&mut self, at: Timestamp) -> Result<()> {
        if !self.has_retry_budget() {
            return Err(Error::InvalidTransition {
                op_id: self.operation_id.clone(),
                from: format!("{} (retries exhausted)", self.status),
                to: OperationStatus::Pending.to_string(),
            });
        }
        self.transition(OperationStatus::Pending, at)?;
        self.retry_count += 1;
        self.error_message = None;
        Ok(())
    }

    /// Queue order: arrival time, then operation ID.
    pub fn queue_order(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.operation_id.cmp(&other.operation_id))
    }
}

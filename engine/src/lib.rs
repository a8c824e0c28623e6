//! # Tether Engine
//!
//! The pure core of an offline-first synchronization service.
//!
//! Clients queue mutations while disconnected; a server drains each user's
//! queue in arrival order, detects divergence from the committed state, and
//! resolves conflicts deterministically. This crate holds every rule of that
//! process. Persistence, transport and scheduling live in `tether-server`.
//!
//! ## Design Principles
//!
//! - **No IO**: the engine never touches files, sockets or clocks; callers
//!   pass `now` in explicitly
//! - **Deterministic**: the same payloads and strategy always resolve to the
//!   same bytes
//! - **Testable**: the in-memory [`Store`] is a complete reference backend
//!
//! ## Core Concepts
//!
//! ### Operations
//!
//! A queued [`Operation`] is a create, update or delete against one record of
//! one [`RecordKind`]. Its status follows a small state machine
//! (pending, processing, completed, failed) with a bounded retry budget.
//!
//! ### Versions
//!
//! Every committed write bumps a [`VersionEntry`] whose checksum covers the
//! committed payload. An incoming payload that does not match it diverged.
//!
//! ### Conflicts
//!
//! [`conflict::detect`] classifies divergence into a [`ConflictKind`], and
//! [`resolve::resolve`] applies a [`Strategy`]: server wins, client wins,
//! a field-wise merge, or manual.
//!
//! ## Quick Start
//!
//! ```rust
//! use tether_engine::{
//!     ModifiedBy, NewOperation, OperationKind, Store, WriteIntent, DEFAULT_MAX_RETRIES,
//! };
//! use serde_json::json;
//!
//! let now = chrono::Utc::now();
//! let mut store = Store::new();
//!
//! // 1. Queue an operation
//! let data = json!({"name": "Lamp", "price": 1999}).as_object().cloned().unwrap();
//! let op = NewOperation::new(OperationKind::Create, "products", "1", Some(data))
//!     .into_operation(7, "op-1".into(), DEFAULT_MAX_RETRIES, now);
//! store.enqueue(op.clone());
//!
//! // 2. Process it
//! store.mark_processing(7, "op-1", now).unwrap();
//! let version = store
//!     .commit_operation(7, "op-1", &WriteIntent::Create(op.payload()), ModifiedBy::Server, now)
//!     .unwrap();
//! assert_eq!(version.version, 1);
//! ```

pub mod checksum;
pub mod conflict;
pub mod error;
pub mod id;
pub mod operation;
pub mod record;
pub mod resolve;
pub mod retry;
pub mod store;
pub mod sync;
pub mod version;

// Re-export main types at crate root
pub use conflict::{
    detect, Conflict, ConflictKind, ConflictStatus, NewConflict, SessionEdits, Strategy,
};
pub use error::Error;
pub use operation::{
    NewOperation, Operation, OperationKind, OperationStatus, DEFAULT_MAX_RETRIES,
};
pub use record::{
    Order, OrderItem, Product, RecordKind, RecordPayload, RecordSchema, RowChange, StoredRecord,
    User, WriteIntent,
};
pub use resolve::{analyze, plan_resolved_write, resolve, Analysis, Resolution, Severity};
pub use retry::RetryPolicy;
pub use store::Store;
pub use sync::{SelectiveData, SyncJournalEntry, SyncKind, SyncStatus, SyncSummary};
pub use version::{ModifiedBy, VersionEntry};

/// Type aliases for clarity
pub type UserId = i64;
pub type RecordId = String;
pub type OperationId = String;
pub type Version = u64;
pub type Timestamp = chrono::DateTime<chrono::Utc>;
pub type Payload = serde_json::Map<String, serde_json::Value>;

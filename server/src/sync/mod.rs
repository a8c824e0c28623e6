//! Sync orchestration: sessions, conflict handling, presence and retries.

mod locks;
mod orchestrator;
mod retry;

pub use locks::UserLocks;
pub use orchestrator::{EngineSettings, RetryReport, SyncEngine};
pub use retry::spawn_retry_loop;

//! Per-user serialization of sync sessions and retry attempts.

use std::sync::Arc;

use dashmap::DashMap;
use tether_engine::UserId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per user. Holding the guard means no other session or
/// retry attempt of that user is running.
#[derive(Debug, Default)]
pub struct UserLocks {
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the user's lock.
    pub async fn acquire(&self, user_id: UserId) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(user_id).or_default().clone();
        lock.lock_owned().await
    }

    /// Take the user's lock only if nobody holds it.
    pub fn try_acquire(&self, user_id: UserId) -> Option<OwnedMutexGuard<()>> {
        let lock = self.locks.entry(user_id).or_default().clone();
        lock.try_lock_owned().ok()
    }
}

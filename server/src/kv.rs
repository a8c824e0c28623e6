//! In-process key-value store with TTL and atomic counters.
//!
//! Holds ephemeral data only: selective-sync hints and per-user session
//! counters. Durable truth lives in the storage backend.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tether_engine::UserId;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Key of the point a user's next selective sync starts from.
pub fn selective_since_key(user_id: UserId) -> String {
    format!("sync:selective_since:{user_id}")
}

/// Key of a user's sync session counter.
pub fn sessions_key(user_id: UserId) -> String {
    format!("sync:sessions:{user_id}")
}

/// Thread-safe KV store, shared via `Arc`.
#[derive(Debug, Default)]
pub struct KvStore {
    entries: DashMap<String, Entry>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, optionally expiring after `ttl`.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) {
        let entry = Entry {
            value: value.into(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.insert(key.into(), entry);
    }

    /// Get a live value. Expired keys read as absent and are dropped.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        None
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Atomically add `delta` to the counter at `key` and return the new value.
    ///
    /// Missing, expired or non-numeric values count as zero. The TTL of a
    /// live counter is kept.
    pub fn incr(&self, key: &str, delta: i64) -> i64 {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: None,
        });
        if entry.is_expired(now) {
            entry.expires_at = None;
            entry.value = "0".to_string();
        }
        let next = entry
            .value
            .parse::<i64>()
            .unwrap_or(0)
            .saturating_add(delta);
        entry.value = next.to_string();
        next
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

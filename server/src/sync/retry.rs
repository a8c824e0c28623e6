//! Background retry loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::SyncEngine;

/// Run [`SyncEngine::retry_failed`] every `every` until `cancel` fires.
///
/// The first tick happens one interval after start. Expired KV keys are
/// purged on every tick.
pub fn spawn_retry_loop(
    engine: Arc<SyncEngine>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = every.as_secs(), "Retry loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let purged = engine.kv().purge_expired();
            if purged > 0 {
                debug!(purged, "Purged expired KV keys");
            }

            if let Err(err) = engine.retry_failed(Utc::now(), &cancel).await {
                error!(error = %err, "Retry pass failed");
            }
        }

        info!("Retry loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvStore;
    use crate::storage::MemoryBackend;
    use crate::sync::EngineSettings;
    use crate::websocket::ConnectionManager;

    #[tokio::test]
    async fn loop_stops_on_cancel() {
        let engine = Arc::new(SyncEngine::new(
            Arc::new(MemoryBackend::new()),
            ConnectionManager::new_shared(),
            Arc::new(KvStore::new()),
            EngineSettings::default(),
        ));
        let cancel = CancellationToken::new();
        let handle = spawn_retry_loop(engine, Duration::from_millis(10), cancel.clone());

        tokio::time::sleep(Duration::from_millis(35)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn tick_purges_expired_keys() {
        let kv = Arc::new(KvStore::new());
        kv.set("short", "1", Some(Duration::from_millis(1)));
        kv.set("long", "1", None);
        let engine = Arc::new(SyncEngine::new(
            Arc::new(MemoryBackend::new()),
            ConnectionManager::new_shared(),
            kv.clone(),
            EngineSettings::default(),
        ));
        let cancel = CancellationToken::new();
        let handle = spawn_retry_loop(engine, Duration::from_millis(10), cancel.clone());

        tokio::time::sleep(Duration::from_millis(40)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(kv.len(), 1);
    }
}

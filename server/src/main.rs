//! Tether Server - sync service for offline-first clients.

use std::sync::Arc;

use tether_server::config::Config;
use tether_server::db::{self, PgBackend};
use tether_server::storage::{MemoryBackend, SyncBackend};
use tether_server::sync::spawn_retry_loop;
use tether_server::{app, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Tether Server on {}:{}", config.host, config.port);

    let backend: Arc<dyn SyncBackend> = match &config.database_url {
        Some(url) => {
            let pool = db::create_pool(url, config.request_timeout).await?;
            tracing::info!("Running database migrations...");
            db::run_migrations(&pool).await?;
            Arc::new(PgBackend::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, keeping state in memory");
            Arc::new(MemoryBackend::new())
        }
    };

    let addr = format!("{}:{}", config.host, config.port);
    let retry_interval = config.retry_interval;
    let state = AppState::new(config, backend);

    let recovered = state.engine.recover_interrupted().await?;
    if recovered > 0 {
        tracing::warn!(recovered, "Failed operations interrupted by the last shutdown");
    }

    let retry = spawn_retry_loop(state.engine.clone(), retry_interval, state.shutdown.clone());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        })
        .await?;

    retry.await?;
    tracing::info!("Server stopped");

    Ok(())
}

//! Bulkcast server: HTTP intake in front of the broadcast dispatch engine.

mod api;
mod auth;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::sqlite::SqlitePoolOptions;
use tower_http::trace::TraceLayer;
use tracing::info;

use bc_common::logging::init_logging;
use bc_config::ConfigLoader;
use bc_dispatch::{BroadcastOrchestrator, DispatchPool, DispatchPoolConfig, StatusTracker};
use bc_provider::{WhatsAppClient, WhatsAppClientConfig};
use bc_queue::{JobQueue, SqliteJobQueue};
use bc_store::{BroadcastRepository, RecipientRepository};

use crate::api::AppState;
use crate::auth::StaticTokenAuthenticator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging("bc-server");

    let config = ConfigLoader::new().load().context("loading configuration")?;

    let db = SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .context("connecting to database")?;

    let broadcasts = BroadcastRepository::new(db.clone());
    let recipients = RecipientRepository::new(db.clone());
    broadcasts.init_schema().await?;
    recipients.init_schema().await?;

    let queue = Arc::new(SqliteJobQueue::new(
        db,
        "send-jobs",
        Duration::from_secs(config.dispatch.queue_poll_interval_seconds),
    ));
    queue.init_schema().await?;

    let provider = Arc::new(WhatsAppClient::new(WhatsAppClientConfig {
        api_base_url: config.provider.api_base_url.clone(),
        access_token: config.provider.access_token.clone(),
        timeout: Duration::from_secs(config.provider.call_timeout_seconds),
        connect_timeout: Duration::from_secs(config.provider.connect_timeout_seconds),
    }));

    let tracker = Arc::new(StatusTracker::new(broadcasts.clone(), recipients.clone()));

    let pool = Arc::new(DispatchPool::new(
        DispatchPoolConfig {
            worker_pool_size: config.dispatch.worker_pool_size,
            max_attempts: config.dispatch.max_attempts,
            dequeue_timeout: Duration::from_secs(config.dispatch.queue_poll_interval_seconds),
            retry_backoff: Duration::from_secs(config.dispatch.retry_backoff_seconds),
            retry_backoff_cap: Duration::from_secs(config.dispatch.retry_backoff_cap_seconds),
        },
        queue.clone(),
        provider,
        tracker.clone(),
    ));

    // Start consuming right away so entries left over from a previous run
    // resume without waiting for the next submit.
    pool.clone().ensure_started().await;

    let orchestrator = Arc::new(BroadcastOrchestrator::new(
        broadcasts,
        recipients,
        queue.clone(),
        tracker,
        pool.clone(),
    ));

    let state = AppState {
        orchestrator,
        pool: pool.clone(),
        auth: Arc::new(StaticTokenAuthenticator::new(config.auth.tokens.clone())),
    };

    let app = api::router(state).layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "Bulkcast server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // In-flight sends finish; unclaimed queue entries stay for the next run.
    pool.shutdown().await;
    queue.stop().await;

    info!("Bulkcast server stopped");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    info!("Shutdown signal received");
}

//! Conduit event delivery and scheduling gateway.
//!
//! Main entry point for the conduit service. Wires the event source, the
//! delivery engine and the HTTP surface together and coordinates graceful
//! startup and shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use conduit_api::{create_router, shutdown_signal, start_server, AppState, Config, IngestState};
use conduit_core::{
    storage::{schema::ensure_schema, Storage},
    Clock, RealClock,
};
use conduit_delivery::{
    DedupCache, DeliveryClient, DeliveryEngine, Dispatcher, PollingWorker,
    PostgresDeliveryStorage, Scheduler,
};
use conduit_sources::{build_source, SourceConfig};
use conduit_transform::ScriptSandbox;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log)?;

    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        worker_id = %config.worker_id,
        source = config.source.kind(),
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    ensure_schema(&db_pool).await.context("Failed to bootstrap database schema")?;
    info!("Database schema ready");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let storage = Arc::new(Storage::new(db_pool.clone()));

    let client = DeliveryClient::new(&config.to_client_config())
        .context("Failed to build outbound HTTP client")?;
    let sandbox = Arc::new(ScriptSandbox::with_clock(config.to_sandbox_config(), clock.clone()));
    let dispatcher = Arc::new(
        Dispatcher::new(
            Arc::new(PostgresDeliveryStorage::new(storage.clone())),
            client,
            clock.clone(),
            config.to_dispatch_config(),
        )
        .with_sandbox(sandbox)
        .with_code_lookup(storage.code_mappings.clone()),
    );

    let handle = build_source(&config.source, clock.clone())
        .await
        .context("Failed to build event source")?;

    let scheduler = Arc::new(Scheduler::new(dispatcher.clone(), config.to_scheduler_config()));
    let dedup = Arc::new(DedupCache::new(config.to_dedup_config(), clock.clone()));
    let worker = Arc::new(PollingWorker::new(
        handle.source.clone(),
        dispatcher.clone(),
        scheduler.clone(),
        dedup,
        config.to_worker_config(),
    ));

    let mut engine =
        DeliveryEngine::new(worker, scheduler).with_shutdown_timeout(config.shutdown_timeout());
    engine.start().context("Failed to start delivery engine")?;

    let mut state = AppState::new(dispatcher);
    if let (Some(push), SourceConfig::HttpPush(push_config)) = (&handle.push, &config.source) {
        state = state.with_ingest(IngestState::new(push.clone(), push_config));
    }

    let addr = config.parse_server_addr()?;
    let router = create_router(state, Duration::from_secs(config.request_timeout));
    let server_token = CancellationToken::new();
    let server_handle = tokio::spawn({
        let token = server_token.clone();
        async move {
            if let Err(e) = start_server(router, addr, token.cancelled_owned()).await {
                error!(error = %e, "Server failed");
            }
        }
    });

    info!(%addr, "Conduit is ready");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    server_token.cancel();
    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "Delivery engine did not stop cleanly");
    }

    tokio::select! {
        _ = tokio::time::sleep(config.shutdown_timeout()) => {
            info!("Shutdown grace period expired");
        }
        _ = server_handle => {
            info!("Server stopped");
        }
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("Conduit shutdown complete");
    Ok(())
}

/// Initializes tracing. `RUST_LOG` wins over the configured directives.
fn init_tracing(directives: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directives))
        .context("Invalid log filter directives")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

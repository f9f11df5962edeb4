//! hookwire webhook delivery service.
//!
//! Loads configuration, connects to Postgres and Redis, bootstraps the schema
//! and runs the delivery engine until SIGINT or SIGTERM.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hookwire_core::{
    events::{AttemptEvent, EventHandler, MulticastEventHandler},
    storage::Storage,
    time::RealClock,
};
use hookwire_delivery::{
    hook::NoOpOutboundHook, queue::RedisTaskQueue, storage::PostgresDeliveryStorage,
    DeliveryEngine,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!(
        database_url = %config.database_url_masked(),
        redis_url = %config.redis_url_masked(),
        worker_count = config.worker_count,
        batch_size = config.batch_size,
        acl_rules = ?config.acl_rules,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    let core_storage = Arc::new(Storage::new(db_pool.clone()));
    core_storage.health_check().await.context("failed to verify database connection")?;
    info!("database connection pool established");

    run_migrations(&db_pool).await?;
    info!("database schema ready");

    let redis = redis::Client::open(config.redis_url.as_str()).context("invalid redis url")?;
    let redis = redis::aio::ConnectionManager::new(redis)
        .await
        .context("failed to connect to redis")?;
    info!("redis connection established");

    let storage = Arc::new(PostgresDeliveryStorage::new(core_storage));
    let queue = Arc::new(RedisTaskQueue::new(redis, config.to_queue_config()));

    let mut events = MulticastEventHandler::new();
    events.add_subscriber(Arc::new(AttemptLogger));

    let mut engine = DeliveryEngine::new(
        storage,
        queue,
        Arc::new(RealClock::new()),
        Arc::new(events),
        Arc::new(NoOpOutboundHook),
        config.to_delivery_config(),
    )
    .context("failed to build delivery engine")?;
    engine.start().await.context("failed to start delivery engine")?;

    info!("hookwire is delivering webhooks");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "delivery engine did not shut down cleanly");
    }

    db_pool.close().await;
    info!("database connections closed");

    info!("hookwire shutdown complete");
    Ok(())
}

/// Logs every finished attempt.
#[derive(Debug)]
struct AttemptLogger;

#[async_trait]
impl EventHandler for AttemptLogger {
    async fn handle_event(&self, event: AttemptEvent) {
        match event {
            AttemptEvent::Succeeded(e) => debug!(
                attempt_id = %e.attempt_id,
                event_id = %e.event_id,
                endpoint_id = %e.endpoint_id,
                status = e.response_status,
                latency_ms = e.latency_ms,
                "attempt succeeded"
            ),
            AttemptEvent::Failed(e) if e.exhausted => warn!(
                attempt_id = %e.attempt_id,
                event_id = %e.event_id,
                endpoint_id = %e.endpoint_id,
                attempt_number = e.attempt_number,
                error = %e.error_message,
                "attempt failed, no retries left"
            ),
            AttemptEvent::Failed(e) => debug!(
                attempt_id = %e.attempt_id,
                attempt_number = e.attempt_number,
                error = %e.error_message,
                "attempt failed, retry scheduled"
            ),
            AttemptEvent::Canceled(e) => info!(
                attempt_id = %e.attempt_id,
                endpoint_id = %e.endpoint_id,
                "attempt canceled"
            ),
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured filter.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid log filter")?;

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
        .context("failed to install tracing subscriber")
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(config.pool_acquire_timeout())
            .idle_timeout(config.pool_idle_timeout())
            .max_lifetime(config.pool_max_lifetime())
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Creates tables and indexes the repositories rely on, if missing.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    const STATEMENTS: &[(&str, &str)] = &[
        (
            "workspaces",
            r"
            CREATE TABLE IF NOT EXISTS workspaces (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
        ),
        (
            "endpoints",
            r"
            CREATE TABLE IF NOT EXISTS endpoints (
                id UUID PRIMARY KEY,
                workspace_id UUID NOT NULL REFERENCES workspaces(id),
                name TEXT,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                request JSONB NOT NULL,
                retry JSONB NOT NULL,
                events TEXT[] NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
        ),
        (
            "events",
            r"
            CREATE TABLE IF NOT EXISTS events (
                id UUID PRIMARY KEY,
                workspace_id UUID NOT NULL REFERENCES workspaces(id),
                event_type TEXT NOT NULL,
                data JSONB NOT NULL,
                unique_id TEXT,
                ingested_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
        ),
        (
            "attempts",
            r"
            CREATE TABLE IF NOT EXISTS attempts (
                id UUID PRIMARY KEY,
                event_id UUID NOT NULL REFERENCES events(id),
                endpoint_id UUID NOT NULL REFERENCES endpoints(id),
                workspace_id UUID NOT NULL REFERENCES workspaces(id),
                attempt_number INTEGER NOT NULL CHECK (attempt_number >= 1),
                status TEXT NOT NULL,
                scheduled_at TIMESTAMPTZ NOT NULL,
                attempted_at TIMESTAMPTZ,
                trigger_mode TEXT NOT NULL,
                exhausted BOOLEAN NOT NULL DEFAULT FALSE,
                error_code TEXT,
                request JSONB,
                response JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
        ),
        (
            "attempt_details",
            r"
            CREATE TABLE IF NOT EXISTS attempt_details (
                id UUID PRIMARY KEY REFERENCES attempts(id),
                workspace_id UUID NOT NULL REFERENCES workspaces(id),
                request_headers JSONB NOT NULL,
                request_body TEXT,
                response_headers JSONB,
                response_body TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            ",
        ),
        (
            "events unique_id index",
            r"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_events_workspace_unique_id
            ON events(workspace_id, unique_id)
            WHERE unique_id IS NOT NULL
            ",
        ),
        (
            "attempts pending index",
            r"
            CREATE INDEX IF NOT EXISTS idx_attempts_pending
            ON attempts(scheduled_at, id)
            WHERE status = 'INIT'
            ",
        ),
        (
            "attempts event index",
            r"
            CREATE INDEX IF NOT EXISTS idx_attempts_event
            ON attempts(event_id, endpoint_id, attempt_number)
            ",
        ),
        (
            "endpoints workspace index",
            r"
            CREATE INDEX IF NOT EXISTS idx_endpoints_workspace
            ON endpoints(workspace_id, created_at)
            WHERE enabled
            ",
        ),
    ];

    for (name, statement) in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("failed to create {name}"))?;
    }

    Ok(())
}

/// Waits for CTRL+C or SIGTERM. A handler that cannot be installed is
/// logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received CTRL+C signal");
        },
        () = terminate => {
            info!("received SIGTERM signal");
        },
    }
}

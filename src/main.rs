//! Hookline runner.
//!
//! One binary, two roles: `ROLE=api` serves the ingress and admin HTTP
//! surface, `ROLE=worker` runs the delivery pool. Both roles share the
//! PostgreSQL schema; migrations are applied at startup by whichever
//! process starts first.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookline_api::{AppState, Config, Role};
use hookline_core::{storage::Storage, RealClock};
use hookline_delivery::{Dispatcher, PgDeliveryStore, RedisRateGate, SystemResolver, WorkerPool};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::load()?;
    info!(
        role = ?config.role,
        database_url = %config.database_url_masked(),
        api_port = config.api_port,
        "configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    hookline_core::MIGRATOR.run(&pool).await.context("failed to apply migrations")?;
    info!("migrations applied");

    let clock = Arc::new(RealClock);

    match config.role {
        Role::Api => {
            let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
            let state = AppState::new(Storage::new(pool.clone()), clock, Arc::new(config));
            hookline_api::start_server(state, addr).await.context("server failed")?;
        },
        Role::Worker => {
            let redis_client =
                redis::Client::open(config.redis_url.as_str()).context("invalid REDIS_URL")?;
            let mut conn = redis_client
                .get_multiplexed_async_connection()
                .await
                .context("redis connect failed")?;
            redis::cmd("PING")
                .query_async::<()>(&mut conn)
                .await
                .context("redis ping failed")?;
            info!("redis connection established");

            let store = Arc::new(PgDeliveryStore::new(pool.clone()));
            let gate = Arc::new(RedisRateGate::new(conn, clock.clone()));
            let dispatcher = Arc::new(Dispatcher::new(
                Arc::new(SystemResolver),
                clock.clone(),
                config.dispatcher_config(),
            ));

            let mut worker_pool =
                WorkerPool::new(store, gate, dispatcher, clock, config.pool_config());
            worker_pool.start().await;
            info!(worker = %config.worker_name, "delivery pool running");

            shutdown_signal().await;
            info!("shutdown signal received");

            if let Err(err) = worker_pool.shutdown_graceful().await {
                tracing::error!(error = %err, "worker pool did not stop cleanly");
            }
        },
    }

    pool.close().await;
    info!("shutdown complete");
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,hookline=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;
                return Ok(pool);
            },
            Err(_) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database pool after retries");
            },
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL+C"),
        () = terminate => info!("received SIGTERM"),
    }
}

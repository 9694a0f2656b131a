use anyhow::{Context, Result};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::NoTls;
use tracing::info;

const SCHEMA: &str = include_str!("../migrations/0001_session_messages.sql");

const MAX_CONNECTIONS: usize = 16;

/// Builds the pool and makes sure `session_messages` exists.
pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let config = database_url
        .parse::<tokio_postgres::Config>()
        .context("Invalid database URL")?;

    let manager = Manager::from_config(
        config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(manager)
        .max_size(MAX_CONNECTIONS)
        .build()
        .context("Failed to create database pool")?;

    let client = pool
        .get()
        .await
        .context("Failed to connect to database")?;
    client
        .batch_execute(SCHEMA)
        .await
        .context("Failed to apply session_messages schema")?;

    info!(max_connections = MAX_CONNECTIONS, "Database pool ready");
    Ok(pool)
}

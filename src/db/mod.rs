pub mod migrations;

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use tracing::info;

use crate::config::Config;

/// Build the shared connection pool from `DATABASE_URL` and the `PG_*` knobs.
pub async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    let mut options = PgConnectOptions::from_str(&config.database_url)?;
    if config.pg_ssl {
        options = options.ssl_mode(PgSslMode::Require);
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.pg_pool_max)
        .acquire_timeout(Duration::from_millis(config.pg_connect_timeout_ms))
        .idle_timeout(Duration::from_millis(config.pg_idle_timeout_ms))
        .connect_with(options)
        .await?;

    info!(max_connections = config.pg_pool_max, "Database pool ready");
    Ok(pool)
}

//! Connection pool for the task store.

use sqlx_core::pool::PoolOptions;
use sqlx_postgres::{PgPool, Postgres};
use tracing::{debug, info, instrument};

use crate::config::PostgresConfig;
use crate::error::Result;

pub type PgPoolOptions = PoolOptions<Postgres>;

/// Pool settings derived from `config`. A quarter of the pool is kept warm.
pub fn pool_options(config: &PostgresConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.pool_size)
        .min_connections((config.pool_size / 4).max(1))
        .acquire_timeout(config.connect_timeout())
        .idle_timeout(config.idle_timeout())
        .test_before_acquire(false)
}

#[instrument(skip(config), fields(url = %mask_password(&config.url)))]
pub async fn create_pool(config: &PostgresConfig) -> Result<PgPool> {
    info!(
        pool_size = config.pool_size,
        connect_timeout_ms = config.connect_timeout_ms,
        "connecting task store pool"
    );
    let pool = pool_options(config).connect(&config.url).await?;
    debug!(size = pool.size(), "task store pool ready");
    Ok(pool)
}

/// Replaces the password of a connection URL with `****` for logs.
pub fn mask_password(url: &str) -> String {
    let (scheme, rest) = url.split_once("://").unwrap_or(("", url));
    let Some((userinfo, host)) = rest.rsplit_once('@') else {
        return url.to_string();
    };
    let Some((user, _password)) = userinfo.split_once(':') else {
        return url.to_string();
    };
    let prefix = if scheme.is_empty() {
        String::new()
    } else {
        format!("{scheme}://")
    };
    format!("{prefix}{user}:****@{host}")
}

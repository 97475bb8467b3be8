//! Embedded schema migrations.

use std::borrow::Cow;

use sqlx_core::migrate::{Migration, MigrationType, Migrator};
use sqlx_postgres::PgPool;
use tracing::{info, instrument};

use crate::error::{PostgresError, Result};

/// (version, description, sql) in chronological order.
const MIGRATIONS: &[(i64, &str, &str)] = &[(
    20240601000001,
    "create_tasks",
    include_str!("../migrations/20240601000001_create_tasks.sql"),
)];

fn build_migrations() -> Vec<Migration> {
    MIGRATIONS
        .iter()
        .map(|(version, description, sql)| Migration {
            version: *version,
            description: Cow::Borrowed(description),
            migration_type: MigrationType::Simple,
            sql: Cow::Borrowed(sql),
            checksum: Cow::Borrowed(&[]),
            no_tx: false,
        })
        .collect()
}

/// Applies pending migrations. Applied versions are tracked in `_sqlx_migrations`.
#[instrument(skip(pool))]
pub async fn run(pool: &PgPool) -> Result<()> {
    let migrations = build_migrations();
    info!(count = migrations.len(), "Running database migrations (embedded)");

    let migrator = Migrator {
        migrations: Cow::Owned(migrations),
        ignore_missing: false,
        locking: true,
        no_tx: false,
    };

    migrator
        .run(pool)
        .await
        .map_err(|e| PostgresError::Migration(e.to_string()))?;

    info!("Database migrations completed successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_ordered() {
        let versions: Vec<i64> = build_migrations().iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        assert_eq!(versions, sorted);
        assert!(build_migrations()[0].sql.contains("CREATE TABLE IF NOT EXISTS tasks"));
    }
}

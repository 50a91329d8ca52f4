// Migration Runner

use sqlx::SqlitePool;
use tracing::{debug, info};

/// Latest schema version shipped with this crate
pub const SCHEMA_VERSION: i64 = 1;

/// Run broker schema migrations. Safe to run from several channels at once.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let table_exists: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_version'",
    )
    .fetch_one(pool)
    .await?;

    let current_version: i64 = if table_exists > 0 {
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?
            .unwrap_or(0)
    } else {
        0
    };

    debug!(current_version, "Broker schema version");

    if current_version < 1 {
        info!("Applying broker migration 001: queues and messages");
        apply_migration(pool, include_str!("../migrations/001_broker_schema.sql")).await?;
    }

    Ok(())
}

/// Apply a single migration SQL file
async fn apply_migration(pool: &SqlitePool, sql: &str) -> Result<(), sqlx::Error> {
    // Execute migration in a transaction
    let mut tx = pool.begin().await?;

    for statement in sql.split(';') {
        let clean_statement: String = statement
            .lines()
            .filter(|line| !line.trim().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string();

        if !clean_statement.is_empty() {
            sqlx::query(&clean_statement).execute(&mut *tx).await?;
        }
    }

    tx.commit().await?;
    Ok(())
}

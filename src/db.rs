use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Executor, SqlitePool};
use tracing::{debug, info};

use crate::config::Config;

const SCHEMA: &str = include_str!("../migrations/20261019_000001_initial_schema.sql");

/// Batch workers write snapshots concurrently; a busy writer is waited on, not failed.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Open the snapshot store under `data_dir`, creating the file and schema on first use.
pub async fn create_pool(config: &Config) -> Result<SqlitePool> {
    let db_path = config.db_path();
    ensure_parent(&db_path).await?;

    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT);

    let max_connections = config.schedule.max_concurrent_urls.saturating_add(1).max(2);
    let pool = open(options, max_connections)
        .await
        .with_context(|| format!("opening snapshot store {}", db_path.display()))?;

    info!(path = %db_path.display(), max_connections, "snapshot store ready");
    Ok(pool)
}

/// Single-connection in-memory store for tests.
#[cfg(test)]
pub async fn create_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new().in_memory(true);
    open(options, 1).await.context("opening in-memory snapshot store")
}

async fn open(options: SqliteConnectOptions, max_connections: u32) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    apply_schema(&pool).await?;
    Ok(pool)
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    Ok(())
}

/// Every statement in the schema is `IF NOT EXISTS`, so reapplying it on startup is a no-op.
async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    pool.execute(SCHEMA).await.context("applying snapshot store schema")?;
    debug!("snapshot store schema applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[tokio::test]
    async fn file_store_is_created_and_reopened() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_config(&format!(
            "[app]\ndata_dir = \"{}\"\n\n[database]\npath = \"nested/store.db\"\n",
            dir.path().join("data").display()
        ))
        .unwrap();

        let pool = create_pool(&config).await.unwrap();
        sqlx::query("INSERT INTO exclusions (url, excluded_on, reason) VALUES ('https://a.example/', '2024-07-15', 'Low traffic')")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        assert!(config.db_path().exists());
        let reopened = create_pool(&config).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM exclusions")
            .fetch_one(&reopened)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn memory_store_has_schema() {
        let pool = create_memory_pool().await.unwrap();
        let tables: Vec<String> = sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert!(tables.contains(&"snapshots".to_string()));
        assert!(tables.contains(&"exclusions".to_string()));
    }
}

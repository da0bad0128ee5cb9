use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the recovery schema in the configured database file.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Idempotent schema setup on an open pool.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // One row per recovery key; only the working text survives a restart.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS drafts (
            recovery_key TEXT PRIMARY KEY,
            working_text TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_drafts_updated_at ON drafts(updated_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}

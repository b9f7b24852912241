use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::error::Result;

/// Create the schema on a fresh connection and close it again.
pub async fn run_migrations(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Idempotent schema creation on an existing pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One row per analysis identity
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analyses (
            id TEXT PRIMARY KEY,
            min_lon REAL NOT NULL,
            min_lat REAL NOT NULL,
            max_lon REAL NOT NULL,
            max_lat REAL NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            selection_mode TEXT NOT NULL,
            early_image_date TEXT NOT NULL,
            late_image_date TEXT NOT NULL,
            early_scene_json TEXT NOT NULL,
            late_scene_json TEXT NOT NULL,
            early_image BLOB NOT NULL,
            late_image BLOB NOT NULL,
            difference_image BLOB NOT NULL,
            summary_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_analyses_updated_at ON analyses(updated_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}

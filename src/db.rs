use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::Config;
use crate::error::{AnalysisError, Result};

/// Open the SQLite pool, creating the file and its parent directory.
///
/// Any failure here means the store cannot be reached at all.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            AnalysisError::StoreUnavailable(format!("cannot create {}: {}", parent.display(), e))
        })?;
    }

    let unavailable = |e: sqlx::Error| AnalysisError::StoreUnavailable(format!("{}: {}", db_path.display(), e));

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
        .map_err(unavailable)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(unavailable)?;

    Ok(pool)
}

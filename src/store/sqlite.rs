//! SQLite-backed [`ResultStore`].
//!
//! One `analyses` row per identity; blobs and JSON columns are overwritten
//! in place on every save (see [`migrate::apply`](crate::migrate::apply)).

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::error::{AnalysisError, Result};
use crate::migrate;
use crate::models::{
    AnalysisMetadata, AnalysisRecord, AnalysisRequest, AnalysisSummary, ArtifactKind, Artifacts, BBox,
};

use super::{now_millis, ResultStore};

/// Owns the connection pool for the lifetime of the process.
pub struct SqliteResultStore {
    pool: SqlitePool,
}

impl SqliteResultStore {
    /// Connect and ensure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self { pool })
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn blob_column(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::Early => "early_image",
        ArtifactKind::Late => "late_image",
        ArtifactKind::Difference => "difference_image",
    }
}

fn request_from_row(row: &SqliteRow) -> Result<AnalysisRequest> {
    let parse_date = |col: &str| -> Result<chrono::NaiveDate> {
        let raw: String = row.try_get(col)?;
        raw.parse()
            .map_err(|e| AnalysisError::Storage(format!("invalid {} '{}': {}", col, raw, e)))
    };
    let mode: String = row.try_get("selection_mode")?;

    Ok(AnalysisRequest {
        bbox: BBox::new(
            row.try_get("min_lon")?,
            row.try_get("min_lat")?,
            row.try_get("max_lon")?,
            row.try_get("max_lat")?,
        ),
        start_date: parse_date("start_date")?,
        end_date: parse_date("end_date")?,
        selection_mode: mode.parse().map_err(AnalysisError::Storage)?,
    })
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn save(&self, id: &str, metadata: &AnalysisMetadata, artifacts: &Artifacts) -> Result<String> {
        let req = &metadata.request;
        let now = now_millis();

        sqlx::query(
            r#"
            INSERT INTO analyses (id, min_lon, min_lat, max_lon, max_lat,
                                  start_date, end_date, selection_mode,
                                  early_image_date, late_image_date,
                                  early_scene_json, late_scene_json,
                                  early_image, late_image, difference_image,
                                  summary_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                min_lon = excluded.min_lon,
                min_lat = excluded.min_lat,
                max_lon = excluded.max_lon,
                max_lat = excluded.max_lat,
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                selection_mode = excluded.selection_mode,
                early_image_date = excluded.early_image_date,
                late_image_date = excluded.late_image_date,
                early_scene_json = excluded.early_scene_json,
                late_scene_json = excluded.late_scene_json,
                early_image = excluded.early_image,
                late_image = excluded.late_image,
                difference_image = excluded.difference_image,
                summary_json = excluded.summary_json,
                updated_at = MAX(excluded.updated_at, analyses.updated_at + 1)
            "#,
        )
        .bind(id)
        .bind(req.bbox.min_lon)
        .bind(req.bbox.min_lat)
        .bind(req.bbox.max_lon)
        .bind(req.bbox.max_lat)
        .bind(req.start_date.to_string())
        .bind(req.end_date.to_string())
        .bind(req.selection_mode.as_str())
        .bind(metadata.early_scene.date())
        .bind(metadata.late_scene.date())
        .bind(serde_json::to_string(&metadata.early_scene)?)
        .bind(serde_json::to_string(&metadata.late_scene)?)
        .bind(&artifacts.early)
        .bind(&artifacts.late)
        .bind(&artifacts.difference)
        .bind(serde_json::to_string(&metadata.summary)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        log::info!("saved analysis {}", id);
        Ok(id.to_string())
    }

    async fn get(&self, id: &str) -> Result<Option<AnalysisRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, min_lon, min_lat, max_lon, max_lat, start_date, end_date,
                   selection_mode, early_scene_json, late_scene_json, summary_json,
                   created_at, updated_at
            FROM analyses WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let early: String = row.try_get("early_scene_json")?;
        let late: String = row.try_get("late_scene_json")?;
        let summary: String = row.try_get("summary_json")?;

        Ok(Some(AnalysisRecord {
            id: row.try_get("id")?,
            request: request_from_row(&row)?,
            early_scene: serde_json::from_str(&early)?,
            late_scene: serde_json::from_str(&late)?,
            summary: serde_json::from_str(&summary)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn get_artifact(&self, id: &str, kind: ArtifactKind) -> Result<Option<Vec<u8>>> {
        let sql = format!("SELECT {} FROM analyses WHERE id = ?", blob_column(kind));
        let blob: Option<Vec<u8>> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(blob)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<AnalysisSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT id, min_lon, min_lat, max_lon, max_lat, start_date, end_date,
                   selection_mode, early_image_date, late_image_date,
                   created_at, updated_at
            FROM analyses
            ORDER BY updated_at DESC, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(AnalysisSummary {
                    id: row.try_get("id")?,
                    request: request_from_row(row)?,
                    early_image_date: row.try_get("early_image_date")?,
                    late_image_date: row.try_get("late_image_date")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn close(&self) {
        self.pool.close().await;
        log::debug!("result store closed");
    }
}

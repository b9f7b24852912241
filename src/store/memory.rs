//! In-memory [`ResultStore`] for tests and ephemeral runs.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`. Same upsert and ordering
//! semantics as the SQLite store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{AnalysisError, Result};
use crate::models::{AnalysisMetadata, AnalysisRecord, AnalysisSummary, ArtifactKind, Artifacts};

use super::{now_millis, ResultStore};

struct StoredAnalysis {
    metadata: AnalysisMetadata,
    artifacts: Artifacts,
    created_at: i64,
    updated_at: i64,
}

pub struct InMemoryResultStore {
    rows: RwLock<HashMap<String, StoredAnalysis>>,
    closed: AtomicBool,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of stored analyses.
    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AnalysisError::StoreUnavailable("store is closed".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> AnalysisError {
    AnalysisError::StoreUnavailable("lock poisoned".to_string())
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn save(&self, id: &str, metadata: &AnalysisMetadata, artifacts: &Artifacts) -> Result<String> {
        self.check_open()?;
        let now = now_millis();
        let mut rows = self.rows.write().map_err(poisoned)?;

        let (created_at, updated_at) = match rows.get(id) {
            Some(prev) => (prev.created_at, now.max(prev.updated_at + 1)),
            None => (now, now),
        };
        rows.insert(
            id.to_string(),
            StoredAnalysis {
                metadata: metadata.clone(),
                artifacts: artifacts.clone(),
                created_at,
                updated_at,
            },
        );
        Ok(id.to_string())
    }

    async fn get(&self, id: &str) -> Result<Option<AnalysisRecord>> {
        self.check_open()?;
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows.get(id).map(|s| AnalysisRecord {
            id: id.to_string(),
            request: s.metadata.request.clone(),
            early_scene: s.metadata.early_scene.clone(),
            late_scene: s.metadata.late_scene.clone(),
            summary: s.metadata.summary.clone(),
            created_at: s.created_at,
            updated_at: s.updated_at,
        }))
    }

    async fn get_artifact(&self, id: &str, kind: ArtifactKind) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows.get(id).map(|s| s.artifacts.get(kind).to_vec()))
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<AnalysisSummary>> {
        self.check_open()?;
        let rows = self.rows.read().map_err(poisoned)?;
        let mut summaries: Vec<AnalysisSummary> = rows
            .iter()
            .map(|(id, s)| AnalysisSummary {
                id: id.clone(),
                request: s.metadata.request.clone(),
                early_image_date: s.metadata.early_scene.date().to_string(),
                late_image_date: s.metadata.late_scene.date().to_string(),
                created_at: s.created_at,
                updated_at: s.updated_at,
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        summaries.truncate(limit);
        Ok(summaries)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

//! Result persistence.
//!
//! The [`ResultStore`] trait is the persistence contract of the pipeline:
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`save`](ResultStore::save) | Upsert metadata and artifacts under an id |
//! | [`get`](ResultStore::get) | Fetch one record (without blobs) |
//! | [`get_artifact`](ResultStore::get_artifact) | Fetch one image blob |
//! | [`list_recent`](ResultStore::list_recent) | Summaries, most recently updated first |
//! | [`close`](ResultStore::close) | Release the backing connection |
//!
//! A missing record is `Ok(None)`, never an error. Connection failures
//! surface as [`AnalysisError::StoreUnavailable`](crate::error::AnalysisError::StoreUnavailable).
//!
//! Identities come from [`analysis_id`], a pure function of the request.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::models::{AnalysisMetadata, AnalysisRecord, AnalysisRequest, AnalysisSummary, ArtifactKind, Artifacts};

pub use memory::InMemoryResultStore;
pub use sqlite::SqliteResultStore;

/// Namespace tag prefixed to every analysis id.
pub const ID_PREFIX: &str = "ndvi_";

const ID_HASH_LEN: usize = 12;

/// Canonical string form of a request: `"[w, s, e, n]_{start}_{end}_{mode}"`.
pub fn canonical_request(request: &AnalysisRequest) -> String {
    let b = &request.bbox;
    format!(
        "[{:?}, {:?}, {:?}, {:?}]_{}_{}_{}",
        b.min_lon, b.min_lat, b.max_lon, b.max_lat, request.start_date, request.end_date, request.selection_mode
    )
}

/// Deterministic identity for a request.
pub fn analysis_id(request: &AnalysisRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_request(request).as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}{}", ID_PREFIX, &digest[..ID_HASH_LEN])
}

/// Current time in Unix milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert, or overwrite everything but `created_at`, and bump
    /// `updated_at`. Returns `id` unchanged.
    async fn save(&self, id: &str, metadata: &AnalysisMetadata, artifacts: &Artifacts) -> Result<String>;

    async fn get(&self, id: &str) -> Result<Option<AnalysisRecord>>;

    async fn get_artifact(&self, id: &str, kind: ArtifactKind) -> Result<Option<Vec<u8>>>;

    /// Up to `limit` summaries ordered by `updated_at` descending.
    async fn list_recent(&self, limit: usize) -> Result<Vec<AnalysisSummary>>;

    /// Release resources. Later calls fail with `StoreUnavailable`.
    async fn close(&self);
}

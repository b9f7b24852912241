//! Error taxonomy for the analysis pipeline.
//!
//! Every library operation returns [`Result<T>`] with an [`AnalysisError`].
//! Only the raster fetcher retries; every other stage fails fast on the
//! first error. A record that is not found is never an error: store
//! lookups return `Option` instead.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the selection, fetch, compute, encode and store stages.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error(
        "not enough good quality scenes: {filtered} of {total} have cloud cover <= {max_cloud_cover}% (need 2); \
         try increasing max_cloud_cover or expanding the date range"
    )]
    InsufficientData {
        total: usize,
        filtered: usize,
        max_cloud_cover: f64,
    },

    #[error(
        "no scenes found within {max_deviation_days} days of the requested dates; \
         closest scenes are {early_deviation} and {late_deviation} days away"
    )]
    NoMatchWithinTolerance {
        early_deviation: i64,
        late_deviation: i64,
        max_deviation_days: i64,
    },

    #[error("failed to fetch {location} after {attempts} attempts: {source}")]
    FetchExhausted {
        location: String,
        attempts: u32,
        #[source]
        source: Box<AnalysisError>,
    },

    #[error("image encoding failed: {0}")]
    Encode(String),

    #[error("result store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("catalog search failed: {0}")]
    Catalog(String),

    #[error("asset signing failed: {0}")]
    Signing(String),

    #[error("scene {scene_id} has no asset for band {band}")]
    MissingBand { scene_id: String, band: String },

    #[error("raster shapes differ: {left:?} vs {right:?}")]
    ShapeMismatch {
        left: (usize, usize),
        right: (usize, usize),
    },

    #[error("raster read failed: {0}")]
    Raster(String),

    #[error("request to {location} timed out after {elapsed:?}")]
    Timeout { location: String, elapsed: Duration },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AnalysisError {
    /// Number of fetch attempts recorded on a [`AnalysisError::FetchExhausted`].
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::FetchExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for AnalysisError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::StoreUnavailable(err.to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for AnalysisError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("invalid JSON column: {}", err))
    }
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, AnalysisError>;

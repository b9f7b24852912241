//! Core data models used throughout the analysis pipeline.
//!
//! Scene records flow from the catalog into the pair selector; the
//! analysis request, scene metadata and results summary flow into the
//! result store.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Bounding box `[min_lon, min_lat, max_lon, max_lat]` in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self {
            min_lon,
            min_lat,
            max_lon,
            max_lat,
        }
    }

    pub fn to_array(&self) -> [f64; 4] {
        [self.min_lon, self.min_lat, self.max_lon, self.max_lat]
    }

    /// Checks coordinate ranges and that the box has positive extent.
    pub fn validate(&self) -> Result<(), String> {
        for lon in [self.min_lon, self.max_lon] {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(format!("longitude {} out of range [-180, 180]", lon));
            }
        }
        for lat in [self.min_lat, self.max_lat] {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(format!("latitude {} out of range [-90, 90]", lat));
            }
        }
        if self.min_lon >= self.max_lon || self.min_lat >= self.max_lat {
            return Err("bbox min must be strictly less than max".to_string());
        }
        Ok(())
    }
}

impl FromStr for BBox {
    type Err = String;

    /// Parses `"min_lon,min_lat,max_lon,max_lat"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|e| format!("invalid bbox '{}': {}", s, e))?;
        if parts.len() != 4 {
            return Err(format!(
                "invalid bbox '{}': expected 4 comma-separated numbers",
                s
            ));
        }
        Ok(Self::new(parts[0], parts[1], parts[2], parts[3]))
    }
}

/// Strategy used by the pair selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    /// Seasonal matching for long spans, first/last otherwise.
    #[default]
    Smart,
    /// Closest scenes to the requested start and end dates.
    Exact,
    /// Lowest cloud cover for early, most recent for late.
    Quality,
}

impl SelectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smart => "smart",
            Self::Exact => "exact",
            Self::Quality => "quality",
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "smart" => Ok(Self::Smart),
            "exact" => Ok(Self::Exact),
            "quality" => Ok(Self::Quality),
            other => Err(format!(
                "unknown selection mode '{}'. Must be smart, exact, or quality.",
                other
            )),
        }
    }
}

/// One catalog scene, as returned by a [`CatalogClient`](crate::catalog::CatalogClient).
#[derive(Debug, Clone, PartialEq)]
pub struct SceneRecord {
    pub id: String,
    pub captured_at: DateTime<Utc>,
    /// Percentage 0–100; `None` is treated as 100 when filtering.
    pub cloud_cover_pct: Option<f64>,
    pub platform: Option<String>,
    pub instruments: Vec<String>,
    /// Band name (e.g. `B04`) → fetchable location.
    pub band_assets: HashMap<String, String>,
}

impl SceneRecord {
    /// Cloud cover used for filtering and ranking; absent means fully clouded.
    pub fn effective_cloud_cover(&self) -> f64 {
        self.cloud_cover_pct.unwrap_or(100.0)
    }

    pub fn capture_date(&self) -> NaiveDate {
        self.captured_at.date_naive()
    }

    pub fn metadata(&self) -> SceneMetadata {
        SceneMetadata {
            id: self.id.clone(),
            datetime: self.captured_at.to_rfc3339(),
            cloud_cover: self.cloud_cover_pct,
            platform: self.platform.clone(),
            instruments: self.instruments.clone(),
        }
    }
}

/// The four fields that determine an analysis identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub bbox: BBox,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub selection_mode: SelectionMode,
}

/// Persisted description of a selected scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneMetadata {
    pub id: String,
    pub datetime: String,
    pub cloud_cover: Option<f64>,
    pub platform: Option<String>,
    #[serde(default)]
    pub instruments: Vec<String>,
}

impl SceneMetadata {
    /// The capture date (first 10 characters of the RFC 3339 datetime).
    pub fn date(&self) -> &str {
        self.datetime.get(..10).unwrap_or(&self.datetime)
    }
}

/// Which branch of the selector produced the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionBranch {
    ExactMatch,
    QualityRanked,
    SeasonalMatch,
    SeasonalFallback,
    ShortSpan,
}

/// Structured explanation of how a pair was chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionRationale {
    pub mode: SelectionMode,
    pub branch: SelectionBranch,
    pub reason: String,
    /// Day distances `[early, late]` from the requested dates (exact mode only).
    pub date_deviations: Option<[i64; 2]>,
    pub total_candidates: usize,
    pub filtered_candidates: usize,
    /// True when the strategy's picks were out of order and got swapped.
    #[serde(default)]
    pub swapped: bool,
}

/// Summary statistics over the finite values of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RasterStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexStatistics {
    pub early: RasterStats,
    pub late: RasterStats,
    pub difference: RasterStats,
}

/// Colormap chosen for each artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColormapsUsed {
    pub early: String,
    pub late: String,
    pub difference: String,
}

/// Results summary persisted alongside the artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub time_gap_days: i64,
    pub mean_index_change: f64,
    pub max_vegetation_loss: f64,
    pub max_vegetation_gain: f64,
    pub statistics: IndexStatistics,
    pub selection: SelectionRationale,
    pub colormaps: ColormapsUsed,
}

/// Kind of stored image artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Early,
    Late,
    Difference,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [Self::Early, Self::Late, Self::Difference];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Early => "early",
            Self::Late => "late",
            Self::Difference => "difference",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "early" => Ok(Self::Early),
            "late" => Ok(Self::Late),
            "difference" => Ok(Self::Difference),
            other => Err(format!(
                "invalid image type '{}'. Must be early, late, or difference.",
                other
            )),
        }
    }
}

/// The three encoded images of one analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifacts {
    pub early: Vec<u8>,
    pub late: Vec<u8>,
    pub difference: Vec<u8>,
}

impl Artifacts {
    pub fn get(&self, kind: ArtifactKind) -> &[u8] {
        match kind {
            ArtifactKind::Early => &self.early,
            ArtifactKind::Late => &self.late,
            ArtifactKind::Difference => &self.difference,
        }
    }
}

/// Metadata handed to [`ResultStore::save`](crate::store::ResultStore::save).
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisMetadata {
    pub request: AnalysisRequest,
    pub early_scene: SceneMetadata,
    pub late_scene: SceneMetadata,
    pub summary: ResultsSummary,
}

/// A persisted analysis, without its image blobs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRecord {
    pub id: String,
    pub request: AnalysisRequest,
    pub early_scene: SceneMetadata,
    pub late_scene: SceneMetadata,
    pub summary: ResultsSummary,
    /// Unix milliseconds.
    pub created_at: i64,
    /// Unix milliseconds.
    pub updated_at: i64,
}

/// Row of [`ResultStore::list_recent`](crate::store::ResultStore::list_recent).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisSummary {
    pub id: String,
    pub request: AnalysisRequest,
    pub early_image_date: String,
    pub late_image_date: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Formats Unix milliseconds as ISO 8601 (UTC).
pub fn format_ts_iso(ts_millis: i64) -> String {
    DateTime::from_timestamp_millis(ts_millis)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| ts_millis.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_parse() {
        let b: BBox = "77.0, 28.4,77.3,28.7".parse().unwrap();
        assert_eq!(b.to_array(), [77.0, 28.4, 77.3, 28.7]);
        assert!(b.validate().is_ok());
    }

    #[test]
    fn test_bbox_rejects_wrong_arity_and_inverted() {
        assert!("1,2,3".parse::<BBox>().is_err());
        assert!("a,b,c,d".parse::<BBox>().is_err());
        let inverted = BBox::new(10.0, 10.0, 5.0, 20.0);
        assert!(inverted.validate().is_err());
        let out_of_range = BBox::new(-200.0, 0.0, 5.0, 20.0);
        assert!(out_of_range.validate().is_err());
    }

    #[test]
    fn test_selection_mode_roundtrip_names() {
        for mode in [SelectionMode::Smart, SelectionMode::Exact, SelectionMode::Quality] {
            assert_eq!(mode.as_str().parse::<SelectionMode>().unwrap(), mode);
        }
        assert!("fastest".parse::<SelectionMode>().is_err());
        assert_eq!(SelectionMode::default(), SelectionMode::Smart);
    }

    #[test]
    fn test_missing_cloud_cover_counts_as_full() {
        let scene = SceneRecord {
            id: "s".into(),
            captured_at: Utc::now(),
            cloud_cover_pct: None,
            platform: None,
            instruments: vec![],
            band_assets: HashMap::new(),
        };
        assert_eq!(scene.effective_cloud_cover(), 100.0);
    }

    #[test]
    fn test_format_ts_iso() {
        assert_eq!(format_ts_iso(0), "1970-01-01T00:00:00.000Z");
    }
}

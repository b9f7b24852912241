//! End-to-end change analysis.
//!
//! ```text
//! catalog.search → select → sign ×2 → fetch ×4 → index ×2 → difference
//!                → encode ×3 → store.save
//! ```
//!
//! Stages run one after another. Any error aborts the run before
//! anything is written, so a previously stored record under the same
//! identity stays untouched until a complete rerun replaces it.

use std::sync::Arc;

use crate::catalog::{signer_from_config, AssetSigner, CatalogClient, StacCatalog};
use crate::config::{BandsConfig, Config};
use crate::error::{AnalysisError, Result};
use crate::fetch::{fetch, FetchOptions, HttpGeoTiffSource, RasterSource};
use crate::index::{compute_index, difference, statistics, IndexRaster};
use crate::models::{
    AnalysisMetadata, AnalysisRequest, Artifacts, ColormapsUsed, IndexStatistics, ResultsSummary,
    SceneRecord,
};
use crate::selector::{select, SelectionCriteria};
use crate::store::{analysis_id, ResultStore};
use crate::visualize::{EncodeMode, Encoder};

/// One analysis run: the identity-bearing request plus tuning knobs that
/// do not affect identity.
#[derive(Debug, Clone)]
pub struct AnalysisParams {
    pub request: AnalysisRequest,
    pub max_cloud_cover: f64,
    pub max_dimension: u32,
    pub max_deviation_days: i64,
}

impl AnalysisParams {
    /// Params with the tuning knobs taken from configuration.
    pub fn with_defaults(request: AnalysisRequest, config: &Config) -> Self {
        Self {
            request,
            max_cloud_cover: config.analysis.max_cloud_cover,
            max_dimension: config.fetch.max_dimension,
            max_deviation_days: config.analysis.max_deviation_days,
        }
    }
}

/// What a successful run stored.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub id: String,
    pub metadata: AnalysisMetadata,
}

pub struct Pipeline {
    catalog: Arc<dyn CatalogClient>,
    signer: Arc<dyn AssetSigner>,
    source: Arc<dyn RasterSource>,
    store: Arc<dyn ResultStore>,
    encoder: Encoder,
    fetch: FetchOptions,
    bands: BandsConfig,
}

impl Pipeline {
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        signer: Arc<dyn AssetSigner>,
        source: Arc<dyn RasterSource>,
        store: Arc<dyn ResultStore>,
        encoder: Encoder,
        fetch: FetchOptions,
        bands: BandsConfig,
    ) -> Self {
        Self {
            catalog,
            signer,
            source,
            store,
            encoder,
            fetch,
            bands,
        }
    }

    /// Production wiring: STAC catalog, configured signer, HTTP GeoTIFF reads.
    pub fn from_config(config: &Config, store: Arc<dyn ResultStore>) -> Result<Self> {
        let catalog = Arc::new(StacCatalog::new(&config.catalog)?);
        let signer: Arc<dyn AssetSigner> = Arc::from(signer_from_config(&config.catalog)?);
        let source = Arc::new(HttpGeoTiffSource::new()?);
        Ok(Self::new(
            catalog,
            signer,
            source,
            store,
            Encoder::from_config(&config.render),
            FetchOptions::from(&config.fetch),
            config.bands.clone(),
        ))
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// Run every stage and persist the result.
    pub async fn run(&self, params: &AnalysisParams) -> Result<AnalysisOutcome> {
        let request = &params.request;
        let id = analysis_id(request);
        log::info!(
            "analysis {}: {:?} {}..{} ({})",
            id,
            request.bbox.to_array(),
            request.start_date,
            request.end_date,
            request.selection_mode
        );

        let scenes = self
            .catalog
            .search(&request.bbox, request.start_date, request.end_date)
            .await?;

        let selection = select(
            &scenes,
            &SelectionCriteria {
                start_date: request.start_date,
                end_date: request.end_date,
                max_cloud_cover: params.max_cloud_cover,
                mode: request.selection_mode,
                max_deviation_days: params.max_deviation_days,
            },
        )?;

        let early_signed = self.signer.sign(&selection.early).await?;
        let late_signed = self.signer.sign(&selection.late).await?;

        let opts = FetchOptions {
            max_dimension: params.max_dimension,
            ..self.fetch
        };
        let early_index = self.scene_index(&early_signed, &opts).await?;
        let late_index = self.scene_index(&late_signed, &opts).await?;
        let diff = difference(&early_index, &late_index)?;

        let stats = IndexStatistics {
            early: statistics(&early_index),
            late: statistics(&late_index),
            difference: statistics(&diff),
        };

        let early_img = self.encoder.encode(&early_index, EncodeMode::Magnitude)?;
        let late_img = self.encoder.encode(&late_index, EncodeMode::Magnitude)?;
        let diff_img = self.encoder.encode(&diff, EncodeMode::Difference)?;

        let time_gap_days = (selection.late.capture_date() - selection.early.capture_date()).num_days();
        let summary = ResultsSummary {
            time_gap_days,
            mean_index_change: stats.difference.mean,
            max_vegetation_loss: stats.difference.min,
            max_vegetation_gain: stats.difference.max,
            statistics: stats,
            selection: selection.rationale,
            colormaps: ColormapsUsed {
                early: early_img.colormap,
                late: late_img.colormap,
                difference: diff_img.colormap,
            },
        };

        log::info!(
            "analysis {}: {} days apart, mean change {:.4}",
            id,
            summary.time_gap_days,
            summary.mean_index_change
        );

        let metadata = AnalysisMetadata {
            request: request.clone(),
            early_scene: selection.early.metadata(),
            late_scene: selection.late.metadata(),
            summary,
        };
        let artifacts = Artifacts {
            early: early_img.bytes,
            late: late_img.bytes,
            difference: diff_img.bytes,
        };

        let id = self.store.save(&id, &metadata, &artifacts).await?;
        Ok(AnalysisOutcome { id, metadata })
    }

    async fn scene_index(&self, scene: &SceneRecord, opts: &FetchOptions) -> Result<IndexRaster> {
        let red_href = band_location(scene, &self.bands.red)?;
        let nir_href = band_location(scene, &self.bands.nir)?;

        let red = fetch(self.source.as_ref(), red_href, opts).await?;
        let nir = fetch(self.source.as_ref(), nir_href, opts).await?;

        log::debug!("computing index for {}", scene.id);
        compute_index(&red.data, &nir.data)
    }
}

fn band_location<'a>(scene: &'a SceneRecord, band: &str) -> Result<&'a str> {
    scene
        .band_assets
        .get(band)
        .map(String::as_str)
        .ok_or_else(|| AnalysisError::MissingBand {
            scene_id: scene.id.clone(),
            band: band.to_string(),
        })
}

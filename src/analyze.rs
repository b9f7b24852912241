//! `ndvi analyze` and `ndvi areas`.

use anyhow::{bail, Result};
use chrono::NaiveDate;
use std::sync::Arc;

use crate::aoi;
use crate::config::Config;
use crate::models::{AnalysisRequest, BBox, SelectionMode};
use crate::pipeline::{AnalysisParams, Pipeline};
use crate::store::{ResultStore, SqliteResultStore};

/// Command-line inputs for one analysis; `None` means "use config".
#[derive(Debug, Clone)]
pub struct AnalyzeArgs {
    pub bbox: Option<BBox>,
    pub area: Option<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub mode: Option<SelectionMode>,
    pub max_cloud_cover: Option<f64>,
    pub max_size: Option<u32>,
    pub max_deviation_days: Option<i64>,
}

/// Resolve CLI inputs against config defaults and the preset table.
pub fn resolve_params(args: &AnalyzeArgs, config: &Config) -> Result<AnalysisParams> {
    let bbox = match (&args.bbox, &args.area) {
        (Some(b), None) => *b,
        (None, Some(name)) => match aoi::find(name) {
            Some(p) => p.bbox(),
            None => bail!("unknown area '{}'; run `ndvi areas` to list presets", name),
        },
        (None, None) => {
            let preset = aoi::find(aoi::DEFAULT_AREA)
                .ok_or_else(|| anyhow::anyhow!("default area preset is missing"))?;
            preset.bbox()
        }
        (Some(_), Some(_)) => bail!("--bbox and --area are mutually exclusive"),
    };
    if let Err(e) = bbox.validate() {
        bail!("invalid bbox: {}", e);
    }
    if args.start > args.end {
        bail!("--start must not be after --end");
    }

    let request = AnalysisRequest {
        bbox,
        start_date: args.start,
        end_date: args.end,
        selection_mode: args.mode.unwrap_or(config.analysis.selection_mode),
    };
    let mut params = AnalysisParams::with_defaults(request, config);
    if let Some(c) = args.max_cloud_cover {
        if !(0.0..=100.0).contains(&c) {
            bail!("--max-cloud-cover must be between 0 and 100");
        }
        params.max_cloud_cover = c;
    }
    if let Some(s) = args.max_size {
        if s == 0 {
            bail!("--max-size must be > 0");
        }
        params.max_dimension = s;
    }
    if let Some(d) = args.max_deviation_days {
        if d < 0 {
            bail!("--max-deviation-days must be >= 0");
        }
        params.max_deviation_days = d;
    }
    Ok(params)
}

/// CLI entry point for `ndvi analyze`.
pub async fn run_analyze(config: &Config, args: &AnalyzeArgs) -> Result<()> {
    let params = resolve_params(args, config)?;

    let store: Arc<dyn ResultStore> = Arc::new(SqliteResultStore::open(config).await?);
    let pipeline = Pipeline::from_config(config, store.clone())?;
    let outcome = pipeline.run(&params).await;
    store.close().await;
    let outcome = outcome?;

    let summary = &outcome.metadata.summary;
    println!("Analysis {} saved.", outcome.id);
    println!(
        "  early: {} ({})",
        outcome.metadata.early_scene.date(),
        outcome.metadata.early_scene.id
    );
    println!(
        "  late:  {} ({})",
        outcome.metadata.late_scene.date(),
        outcome.metadata.late_scene.id
    );
    println!("  reason: {}", summary.selection.reason);
    println!("  time gap: {} days", summary.time_gap_days);
    println!("  mean change: {:.4}", summary.mean_index_change);
    println!(
        "  max loss / gain: {:.4} / {:.4}",
        summary.max_vegetation_loss, summary.max_vegetation_gain
    );
    Ok(())
}

/// CLI entry point for `ndvi areas`.
pub fn list_areas() {
    println!("{:<28} {:<28} {}", "AREA", "BBOX", "DESCRIPTION");
    for p in aoi::PRESETS {
        let marker = if p.name == aoi::DEFAULT_AREA { " (default)" } else { "" };
        println!(
            "{:<28} {:<28} {}{}",
            p.name,
            format!("{:?}", p.bbox),
            p.description,
            marker
        );
    }
}

//! Stored-analysis retrieval commands.
//!
//! Backs `ndvi get`, `ndvi list` and `ndvi export`. Each command opens
//! the SQLite store, runs one query and closes it again.

use anyhow::{Context, Result};
use std::path::Path;

use crate::config::Config;
use crate::models::{format_ts_iso, AnalysisRecord, ArtifactKind, RasterStats};
use crate::store::{ResultStore, SqliteResultStore};

/// Fetch one record, closing the store afterwards.
pub async fn get_analysis(config: &Config, id: &str) -> Result<Option<AnalysisRecord>> {
    let store = SqliteResultStore::open(config).await?;
    let record = store.get(id).await;
    store.close().await;
    Ok(record?)
}

fn print_stats(label: &str, s: &RasterStats) {
    println!(
        "  {:<11} min {:>7.3}  max {:>7.3}  mean {:>7.3}  std {:>6.3}",
        label, s.min, s.max, s.mean, s.std
    );
}

/// CLI entry point for `ndvi get`.
pub async fn run_get(config: &Config, id: &str, json: bool) -> Result<()> {
    let record = match get_analysis(config, id).await? {
        Some(r) => r,
        None => {
            eprintln!("Error: analysis not found: {}", id);
            std::process::exit(1);
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    let req = &record.request;
    let summary = &record.summary;

    println!("--- Analysis ---");
    println!("id:             {}", record.id);
    println!("bbox:           {:?}", req.bbox.to_array());
    println!("requested:      {} .. {}", req.start_date, req.end_date);
    println!("selection_mode: {}", req.selection_mode);
    println!("created_at:     {}", format_ts_iso(record.created_at));
    println!("updated_at:     {}", format_ts_iso(record.updated_at));
    println!();

    println!("--- Scenes ---");
    for (label, scene) in [("early", &record.early_scene), ("late", &record.late_scene)] {
        let cloud = scene
            .cloud_cover
            .map(|c| format!("{:.1}%", c))
            .unwrap_or_else(|| "n/a".to_string());
        println!("{:<6} {}  {}  cloud {}", label, scene.date(), scene.id, cloud);
    }
    println!("reason: {}", summary.selection.reason);
    if let Some([early, late]) = summary.selection.date_deviations {
        println!("date deviations: {} / {} days", early, late);
    }
    println!();

    println!("--- Change ---");
    println!("time gap:       {} days", summary.time_gap_days);
    println!("mean change:    {:.4}", summary.mean_index_change);
    println!("max loss:       {:.4}", summary.max_vegetation_loss);
    println!("max gain:       {:.4}", summary.max_vegetation_gain);
    print_stats("early", &summary.statistics.early);
    print_stats("late", &summary.statistics.late);
    print_stats("difference", &summary.statistics.difference);
    println!(
        "colormaps:      {} / {} / {}",
        summary.colormaps.early, summary.colormaps.late, summary.colormaps.difference
    );

    Ok(())
}

/// CLI entry point for `ndvi list`.
pub async fn run_list(config: &Config, limit: usize) -> Result<()> {
    let store = SqliteResultStore::open(config).await?;
    let rows = store.list_recent(limit).await;
    store.close().await;
    let rows = rows?;

    if rows.is_empty() {
        println!("No analyses.");
        return Ok(());
    }

    println!(
        "{:<18} {:<23} {:<10} {:<10} {:<8} {}",
        "ID", "UPDATED", "EARLY", "LATE", "MODE", "BBOX"
    );
    for row in rows {
        println!(
            "{:<18} {:<23} {:<10} {:<10} {:<8} {:?}",
            row.id,
            format_ts_iso(row.updated_at),
            row.early_image_date,
            row.late_image_date,
            row.request.selection_mode,
            row.request.bbox.to_array()
        );
    }
    Ok(())
}

/// CLI entry point for `ndvi export`: write one stored PNG to disk.
pub async fn run_export(config: &Config, id: &str, kind: ArtifactKind, out: &Path) -> Result<()> {
    let store = SqliteResultStore::open(config).await?;
    let bytes = store.get_artifact(id, kind).await;
    store.close().await;

    let bytes = match bytes? {
        Some(b) => b,
        None => {
            eprintln!("Error: analysis not found: {}", id);
            std::process::exit(1);
        }
    };

    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(out, &bytes).with_context(|| format!("Failed to write {}", out.display()))?;
    println!("Wrote {} image ({} bytes) to {}", kind, bytes.len(), out.display());
    Ok(())
}

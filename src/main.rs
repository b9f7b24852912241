//! # NDVI Delta CLI (`ndvi`)
//!
//! ## Usage
//!
//! ```bash
//! ndvi --config ./config/ndvi.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ndvi init` | Create the SQLite database and run schema migrations |
//! | `ndvi analyze` | Run a change analysis and store the result |
//! | `ndvi get <id>` | Show a stored analysis |
//! | `ndvi list` | List recent analyses |
//! | `ndvi export <id> <kind> --out <file>` | Write a stored PNG to disk |
//! | `ndvi areas` | List named area presets |
//! | `ndvi serve` | Start the HTTP API |
//!
//! Logging goes to stderr through `env_logger`; set `RUST_LOG=debug` for
//! per-attempt fetch details.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ndvi_delta::analyze::{self, AnalyzeArgs};
use ndvi_delta::models::{ArtifactKind, BBox, SelectionMode};
use ndvi_delta::{config, get, migrate, server};

/// NDVI Delta: vegetation change detection from Sentinel-2 imagery.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/ndvi.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "ndvi",
    about = "NDVI Delta: vegetation change detection from Sentinel-2 imagery",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ndvi.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Run a change analysis and store the result.
    ///
    /// Re-running with the same bbox, dates and mode overwrites the
    /// stored record instead of creating a new one.
    Analyze {
        /// Bounding box `min_lon,min_lat,max_lon,max_lat`.
        #[arg(long, conflicts_with = "area", allow_hyphen_values = true)]
        bbox: Option<BBox>,

        /// Named area preset (see `ndvi areas`).
        #[arg(long)]
        area: Option<String>,

        /// Start date (YYYY-MM-DD).
        #[arg(long)]
        start: NaiveDate,

        /// End date (YYYY-MM-DD).
        #[arg(long)]
        end: NaiveDate,

        /// Pair selection strategy: smart, exact or quality.
        #[arg(long)]
        mode: Option<SelectionMode>,

        /// Maximum scene cloud cover in percent.
        #[arg(long)]
        max_cloud_cover: Option<f64>,

        /// Maximum raster width/height after downsampling.
        #[arg(long)]
        max_size: Option<u32>,

        /// Tolerance in days for exact mode.
        #[arg(long)]
        max_deviation_days: Option<i64>,
    },

    /// Show a stored analysis.
    Get {
        id: String,

        /// Print the full record as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List recent analyses, most recently updated first.
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Write a stored image to a PNG file.
    Export {
        id: String,

        /// early, late or difference.
        kind: ArtifactKind,

        #[arg(long)]
        out: PathBuf,
    },

    /// List named area presets.
    Areas,

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Commands that don't require config
    if let Commands::Areas = cli.command {
        analyze::list_areas();
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Analyze {
            bbox,
            area,
            start,
            end,
            mode,
            max_cloud_cover,
            max_size,
            max_deviation_days,
        } => {
            let args = AnalyzeArgs {
                bbox,
                area,
                start,
                end,
                mode,
                max_cloud_cover,
                max_size,
                max_deviation_days,
            };
            analyze::run_analyze(&cfg, &args).await?;
        }
        Commands::Get { id, json } => {
            get::run_get(&cfg, &id, json).await?;
        }
        Commands::List { limit } => {
            get::run_list(&cfg, limit).await?;
        }
        Commands::Export { id, kind, out } => {
            get::run_export(&cfg, &id, kind, &out).await?;
        }
        Commands::Areas => unreachable!("handled before config loading"),
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

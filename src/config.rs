use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::SelectionMode;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub bands: BandsConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default = "default_catalog_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_sign_assets")]
    pub sign_assets: bool,
    #[serde(default = "default_sign_url")]
    pub sign_url: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            url: default_catalog_url(),
            collection: default_collection(),
            page_limit: default_page_limit(),
            max_items: default_max_items(),
            timeout_secs: default_catalog_timeout_secs(),
            sign_assets: default_sign_assets(),
            sign_url: default_sign_url(),
        }
    }
}

fn default_catalog_url() -> String {
    "https://planetarycomputer.microsoft.com/api/stac/v1".to_string()
}
fn default_collection() -> String {
    "sentinel-2-l2a".to_string()
}
fn default_page_limit() -> u32 {
    100
}
fn default_max_items() -> usize {
    500
}
fn default_catalog_timeout_secs() -> u64 {
    60
}
fn default_sign_assets() -> bool {
    true
}
fn default_sign_url() -> String {
    "https://planetarycomputer.microsoft.com/api/sas/v1/token".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BandsConfig {
    #[serde(default = "default_red_band")]
    pub red: String,
    #[serde(default = "default_nir_band")]
    pub nir: String,
}

impl Default for BandsConfig {
    fn default() -> Self {
        Self {
            red: default_red_band(),
            nir: default_nir_band(),
        }
    }
}

fn default_red_band() -> String {
    "B04".to_string()
}
fn default_nir_band() -> String {
    "B08".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Length of one backoff unit; attempt `n` waits `2^n` units.
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_dimension: default_max_dimension(),
            timeout_secs: default_fetch_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_unit_ms: default_backoff_unit_ms(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }
}

fn default_max_dimension() -> u32 {
    1024
}
fn default_fetch_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_unit_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_max_cloud_cover")]
    pub max_cloud_cover: f64,
    #[serde(default)]
    pub selection_mode: SelectionMode,
    #[serde(default = "default_max_deviation_days")]
    pub max_deviation_days: i64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_cloud_cover: default_max_cloud_cover(),
            selection_mode: SelectionMode::default(),
            max_deviation_days: default_max_deviation_days(),
        }
    }
}

fn default_max_cloud_cover() -> f64 {
    20.0
}
fn default_max_deviation_days() -> i64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RenderConfig {
    #[serde(default = "default_magnitude_palettes")]
    pub magnitude_palettes: Vec<String>,
    #[serde(default = "default_difference_palettes")]
    pub difference_palettes: Vec<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            magnitude_palettes: default_magnitude_palettes(),
            difference_palettes: default_difference_palettes(),
        }
    }
}

fn default_magnitude_palettes() -> Vec<String> {
    ["SUMMER", "SPRING", "JET", "HSV", "RAINBOW", "AUTUMN", "COOL", "HOT"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_difference_palettes() -> Vec<String> {
    ["JET", "HSV", "RAINBOW", "COOL", "AUTUMN", "SUMMER", "SPRING"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

impl Config {
    /// Configuration with every default, storing the database at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            catalog: CatalogConfig::default(),
            bands: BandsConfig::default(),
            fetch: FetchConfig::default(),
            analysis: AnalysisConfig::default(),
            render: RenderConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config = parse_config(&content)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate analysis defaults
    if !(0.0..=100.0).contains(&config.analysis.max_cloud_cover) {
        anyhow::bail!("analysis.max_cloud_cover must be in [0, 100]");
    }
    if config.analysis.max_deviation_days < 0 {
        anyhow::bail!("analysis.max_deviation_days must be >= 0");
    }

    // Validate fetch
    if config.fetch.max_dimension == 0 {
        anyhow::bail!("fetch.max_dimension must be > 0");
    }
    if config.fetch.max_retries == 0 {
        anyhow::bail!("fetch.max_retries must be >= 1");
    }
    if config.fetch.timeout_secs == 0 {
        anyhow::bail!("fetch.timeout_secs must be > 0");
    }

    // Validate catalog
    if config.catalog.page_limit == 0 {
        anyhow::bail!("catalog.page_limit must be >= 1");
    }
    if config.catalog.url.trim().is_empty() {
        anyhow::bail!("catalog.url must not be empty");
    }

    // Validate bands
    if config.bands.red == config.bands.nir {
        anyhow::bail!(
            "bands.red and bands.nir must differ (both are '{}')",
            config.bands.red
        );
    }

    Ok(())
}

//! # NDVI Delta
//!
//! Vegetation change detection between two satellite captures of the same
//! area.
//!
//! Given a bounding box and a date range, the pipeline finds candidate
//! Sentinel-2 scenes, picks the pair to compare, downloads the red and
//! near-infrared bands, computes and differences the normalized
//! difference vegetation index, renders three PNGs and stores everything
//! under a deterministic identity.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │ Catalog  │──▶│ Selector │──▶│  Fetch   │──▶│  Index   │──▶│Visualize │
//! │  (STAC)  │   │ (2 of N) │   │ (×4 GeoT)│   │ (NDVI,Δ) │   │ (×3 PNG) │
//! └──────────┘   └──────────┘   └──────────┘   └──────────┘   └────┬─────┘
//!                                                                  ▼
//!                        ┌──────────┐     ┌──────────┐       ┌──────────┐
//!                        │   CLI    │────▶│  Store   │◀──────│ Pipeline │
//!                        │  (ndvi)  │     │ (SQLite) │       └──────────┘
//!                        └──────────┘     └────▲─────┘
//!                                              │
//!                                         ┌──────────┐
//!                                         │   HTTP   │
//!                                         └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ndvi init
//! ndvi analyze --area gurgaon_south_delhi --start 2023-01-01 --end 2024-01-01
//! ndvi list
//! ndvi export ndvi_0123456789ab difference --out diff.png
//! ndvi serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`catalog`] | Scene search and asset signing |
//! | [`aoi`] | Named area presets |
//! | [`selector`] | Image-pair selection strategies |
//! | [`fetch`] | GeoTIFF reads with retry and downsampling |
//! | [`index`] | Vegetation index and differencing |
//! | [`visualize`] | Contrast stretch, colormaps, PNG encoding |
//! | [`store`] | Result persistence |
//! | [`pipeline`] | End-to-end orchestration |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod analyze;
pub mod aoi;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod get;
pub mod index;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod selector;
pub mod server;
pub mod store;
pub mod visualize;

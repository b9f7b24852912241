//! HTTP API over the analysis pipeline.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/api/search` | Run an analysis for a bbox and date range |
//! | `GET`  | `/api/analysis/{id}` | Stored analysis metadata |
//! | `GET`  | `/api/analysis/{id}/image/{kind}` | PNG for `early`, `late` or `difference` |
//! | `GET`  | `/api/analyses` | Recent analyses, most recently updated first |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "start_date must be YYYY-MM-DD" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `no_data` (422),
//! `upstream` (502), `store_unavailable` (503), `internal` (500).
//!
//! # Lifecycle
//!
//! The server opens the result store at startup, shares it with every
//! request through the pipeline, and closes it after a graceful shutdown
//! (Ctrl-C).

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::AnalysisError;
use crate::models::{
    AnalysisRecord, AnalysisRequest, AnalysisSummary, ArtifactKind, BBox, ResultsSummary, SelectionMode,
};
use crate::pipeline::{AnalysisParams, Pipeline};
use crate::store::{ResultStore, SqliteResultStore};

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
    defaults: Arc<Config>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, config: &Config) -> Self {
        Self {
            pipeline,
            defaults: Arc::new(config.clone()),
        }
    }

    fn store(&self) -> &Arc<dyn ResultStore> {
        self.pipeline.store()
    }
}

/// Starts the HTTP server on `[server].bind` and runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let store: Arc<dyn ResultStore> = Arc::new(SqliteResultStore::open(config).await?);
    let pipeline = Arc::new(Pipeline::from_config(config, store.clone())?);
    let app = router(AppState::new(pipeline, config));

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("NDVI server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.close().await;
    log::info!("server stopped");
    Ok(())
}

/// Build the router with CORS enabled for all origins.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/search", get(handle_search))
        .route("/api/analysis/{id}", get(handle_get_analysis))
        .route("/api/analysis/{id}/image/{kind}", get(handle_get_image))
        .route("/api/analyses", get(handle_list))
        .layer(cors)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("shutdown requested");
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &str {
        &self.code
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

impl From<AnalysisError> for AppError {
    fn from(err: AnalysisError) -> Self {
        let message = err.to_string();
        match err {
            AnalysisError::InsufficientData { .. } | AnalysisError::NoMatchWithinTolerance { .. } => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, "no_data", message)
            }
            AnalysisError::FetchExhausted { .. } => AppError::new(StatusCode::BAD_GATEWAY, "upstream", message),
            AnalysisError::StoreUnavailable(_) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", message)
            }
            other => {
                log::error!("request failed: {}", other);
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /api/search ============

/// Query string for `GET /api/search`. Optional fields fall back to config.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchQuery {
    pub start_date: String,
    pub end_date: String,
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
    pub max_cloud_cover: Option<f64>,
    pub max_size: Option<u32>,
    pub selection_mode: Option<String>,
    pub max_date_deviation_days: Option<i64>,
}

fn parse_date(field: &str, raw: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| bad_request(format!("{} must be YYYY-MM-DD, got '{}'", field, raw)))
}

/// Validate a search query into pipeline parameters.
pub fn validate_search(q: &SearchQuery, defaults: &Config) -> Result<AnalysisParams, AppError> {
    let start_date = parse_date("start_date", &q.start_date)?;
    let end_date = parse_date("end_date", &q.end_date)?;
    if start_date > end_date {
        return Err(bad_request("start_date must not be after end_date"));
    }

    let bbox = BBox::new(q.min_lon, q.min_lat, q.max_lon, q.max_lat);
    bbox.validate().map_err(bad_request)?;

    let max_cloud_cover = q.max_cloud_cover.unwrap_or(defaults.analysis.max_cloud_cover);
    if !(0.0..=100.0).contains(&max_cloud_cover) {
        return Err(bad_request("max_cloud_cover must be between 0 and 100"));
    }

    let max_dimension = q.max_size.unwrap_or(defaults.fetch.max_dimension);
    if max_dimension == 0 {
        return Err(bad_request("max_size must be > 0"));
    }

    let max_deviation_days = q
        .max_date_deviation_days
        .unwrap_or(defaults.analysis.max_deviation_days);
    if max_deviation_days < 0 {
        return Err(bad_request("max_date_deviation_days must be >= 0"));
    }

    let selection_mode = match q.selection_mode.as_deref() {
        Some(raw) => raw.parse::<SelectionMode>().map_err(bad_request)?,
        None => defaults.analysis.selection_mode,
    };

    Ok(AnalysisParams {
        request: AnalysisRequest {
            bbox,
            start_date,
            end_date,
            selection_mode,
        },
        max_cloud_cover,
        max_dimension,
        max_deviation_days,
    })
}

#[derive(Serialize)]
struct ImageUrls {
    early: String,
    late: String,
    difference: String,
}

impl ImageUrls {
    fn for_id(id: &str) -> Self {
        let url = |kind: ArtifactKind| format!("/api/analysis/{}/image/{}", id, kind);
        Self {
            early: url(ArtifactKind::Early),
            late: url(ArtifactKind::Late),
            difference: url(ArtifactKind::Difference),
        }
    }
}

#[derive(Serialize)]
struct EchoedQuery {
    start_date: NaiveDate,
    end_date: NaiveDate,
    bbox: [f64; 4],
    max_cloud_cover: f64,
    max_size: u32,
    selection_mode: SelectionMode,
    max_date_deviation_days: i64,
}

#[derive(Serialize)]
struct SearchResponse {
    status: &'static str,
    analysis_id: String,
    query: EchoedQuery,
    image_urls: ImageUrls,
    selected_dates: [String; 2],
    summary: ResultsSummary,
}

async fn handle_search(
    State(state): State<AppState>,
    Query(q): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, AppError> {
    let params = validate_search(&q, &state.defaults)?;
    let outcome = state.pipeline.run(&params).await?;

    let meta = outcome.metadata;
    Ok(Json(SearchResponse {
        status: "success",
        image_urls: ImageUrls::for_id(&outcome.id),
        analysis_id: outcome.id,
        query: EchoedQuery {
            start_date: params.request.start_date,
            end_date: params.request.end_date,
            bbox: params.request.bbox.to_array(),
            max_cloud_cover: params.max_cloud_cover,
            max_size: params.max_dimension,
            selection_mode: params.request.selection_mode,
            max_date_deviation_days: params.max_deviation_days,
        },
        selected_dates: [
            meta.early_scene.date().to_string(),
            meta.late_scene.date().to_string(),
        ],
        summary: meta.summary,
    }))
}

// ============ GET /api/analysis/{id} ============

#[derive(Serialize)]
struct AnalysisResponse {
    status: &'static str,
    analysis: AnalysisRecord,
    image_urls: ImageUrls,
}

async fn handle_get_analysis(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AnalysisResponse>, AppError> {
    let record = state
        .store()
        .get(&id)
        .await?
        .ok_or_else(|| not_found(format!("analysis not found: {}", id)))?;

    Ok(Json(AnalysisResponse {
        status: "success",
        image_urls: ImageUrls::for_id(&id),
        analysis: record,
    }))
}

// ============ GET /api/analysis/{id}/image/{kind} ============

async fn handle_get_image(
    State(state): State<AppState>,
    Path((id, kind)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let kind: ArtifactKind = kind.parse().map_err(bad_request)?;
    let bytes = state
        .store()
        .get_artifact(&id, kind)
        .await?
        .ok_or_else(|| not_found(format!("analysis not found: {}", id)))?;

    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "public, max-age=3600"),
        ],
        bytes,
    )
        .into_response())
}

// ============ GET /api/analyses ============

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct ListResponse {
    status: &'static str,
    count: usize,
    analyses: Vec<AnalysisSummary>,
}

async fn handle_list(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<ListResponse>, AppError> {
    let limit = q.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if !(1..=MAX_LIST_LIMIT).contains(&limit) {
        return Err(bad_request(format!("limit must be between 1 and {}", MAX_LIST_LIMIT)));
    }

    let analyses = state.store().list_recent(limit).await?;
    Ok(Json(ListResponse {
        status: "success",
        count: analyses.len(),
        analyses,
    }))
}

//! Scene catalog search and asset signing.
//!
//! [`CatalogClient`] returns [`SceneRecord`]s for a bounding box and date
//! range. [`StacCatalog`] implements it against a STAC API (`POST /search`,
//! following `next` links). Search is never retried here; an empty result
//! goes straight to the pair selector, which reports insufficient data.
//!
//! [`AssetSigner`] turns a selected scene's raw asset hrefs into fetchable
//! locations. [`PlanetaryComputerSigner`] appends a collection SAS token,
//! cached per collection and refetched shortly before it expires.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::CatalogConfig;
use crate::error::{AnalysisError, Result};
use crate::models::{BBox, SceneRecord};

/// Source of candidate scenes.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn search(&self, bbox: &BBox, start: NaiveDate, end: NaiveDate) -> Result<Vec<SceneRecord>>;
}

/// Makes a scene's band assets fetchable.
#[async_trait]
pub trait AssetSigner: Send + Sync {
    /// Return a copy of `scene` whose `band_assets` are signed locations.
    async fn sign(&self, scene: &SceneRecord) -> Result<SceneRecord>;
}

// ============ STAC wire types ============

/// Body for `POST /search`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchBody {
    pub bbox: Vec<f64>,
    pub datetime: String,
    pub collections: Vec<String>,
    pub limit: u32,
    /// Pagination token, set by `next` links on some catalogs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemCollection {
    #[serde(default)]
    pub features: Vec<StacItem>,
    #[serde(default)]
    pub links: Vec<StacLink>,
}

impl ItemCollection {
    fn next_link(&self) -> Option<&StacLink> {
        self.links.iter().find(|l| l.rel == "next")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StacItem {
    pub id: String,
    pub properties: ItemProperties,
    #[serde(default)]
    pub assets: HashMap<String, StacAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemProperties {
    pub datetime: Option<String>,
    #[serde(rename = "eo:cloud_cover")]
    pub cloud_cover: Option<f64>,
    pub platform: Option<String>,
    #[serde(default)]
    pub instruments: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StacAsset {
    pub href: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StacLink {
    pub rel: String,
    pub href: String,
    pub method: Option<String>,
    pub body: Option<serde_json::Value>,
    pub merge: Option<bool>,
}

/// Convert a STAC item into a scene record.
///
/// Items without a parseable `datetime` are dropped (`None`).
pub fn scene_from_item(item: StacItem) -> Option<SceneRecord> {
    let raw = item.properties.datetime.as_deref()?;
    let captured_at = match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(e) => {
            log::warn!("skipping item {}: bad datetime '{}': {}", item.id, raw, e);
            return None;
        }
    };

    let band_assets = item
        .assets
        .into_iter()
        .map(|(name, asset)| (name, asset.href))
        .collect();

    Some(SceneRecord {
        id: item.id,
        captured_at,
        cloud_cover_pct: item.properties.cloud_cover,
        platform: item.properties.platform,
        instruments: item.properties.instruments,
        band_assets,
    })
}

// ============ STAC client ============

pub struct StacCatalog {
    client: reqwest::Client,
    search_url: String,
    collection: String,
    page_limit: u32,
    max_items: usize,
}

impl StacCatalog {
    pub fn new(cfg: &CatalogConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            search_url: format!("{}/search", cfg.url.trim_end_matches('/')),
            collection: cfg.collection.clone(),
            page_limit: cfg.page_limit,
            max_items: cfg.max_items,
        })
    }

    async fn post_page(&self, url: &str, body: &serde_json::Value) -> Result<ItemCollection> {
        let resp = self.client.post(url).json(body).send().await?;
        Self::read_page(resp).await
    }

    async fn get_page(&self, url: &str) -> Result<ItemCollection> {
        let resp = self.client.get(url).send().await?;
        Self::read_page(resp).await
    }

    async fn read_page(resp: reqwest::Response) -> Result<ItemCollection> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AnalysisError::Catalog(format!(
                "HTTP {}: {}",
                status,
                body.chars().take(500).collect::<String>()
            )));
        }
        resp.json::<ItemCollection>()
            .await
            .map_err(|e| AnalysisError::Catalog(format!("invalid search response: {}", e)))
    }
}

/// Request body for a POST `next` link.
fn next_body(link: &StacLink, previous: &serde_json::Value) -> serde_json::Value {
    match (&link.body, link.merge.unwrap_or(false)) {
        (Some(body), true) => {
            let mut merged = previous.clone();
            if let (Some(base), Some(overlay)) = (merged.as_object_mut(), body.as_object()) {
                for (k, v) in overlay {
                    base.insert(k.clone(), v.clone());
                }
            }
            merged
        }
        (Some(body), false) => body.clone(),
        (None, _) => previous.clone(),
    }
}

#[async_trait]
impl CatalogClient for StacCatalog {
    async fn search(&self, bbox: &BBox, start: NaiveDate, end: NaiveDate) -> Result<Vec<SceneRecord>> {
        let body = SearchBody {
            bbox: bbox.to_array().to_vec(),
            datetime: format!("{}/{}", start, end),
            collections: vec![self.collection.clone()],
            limit: self.page_limit,
            token: None,
        };
        let mut body = serde_json::to_value(&body)
            .map_err(|e| AnalysisError::Catalog(format!("encoding search body: {}", e)))?;

        log::info!(
            "searching {} for {:?} between {} and {}",
            self.collection,
            bbox.to_array(),
            start,
            end
        );

        let mut items = Vec::new();
        let mut page = self.post_page(&self.search_url, &body).await?;
        loop {
            let next = page.next_link().cloned();
            items.extend(page.features.drain(..));
            if items.len() >= self.max_items {
                break;
            }
            let Some(link) = next else { break };

            page = if link.method.as_deref().unwrap_or("GET").eq_ignore_ascii_case("POST") {
                body = next_body(&link, &body);
                self.post_page(&link.href, &body).await?
            } else {
                self.get_page(&link.href).await?
            };
            if page.features.is_empty() {
                break;
            }
        }
        items.truncate(self.max_items);

        let scenes: Vec<SceneRecord> = items.into_iter().filter_map(scene_from_item).collect();
        log::info!("catalog returned {} scenes", scenes.len());
        Ok(scenes)
    }
}

// ============ Signing ============

/// Leaves asset locations untouched.
pub struct NoSigning;

#[async_trait]
impl AssetSigner for NoSigning {
    async fn sign(&self, scene: &SceneRecord) -> Result<SceneRecord> {
        Ok(scene.clone())
    }
}

/// A cached token is refetched once it has less than this left.
const TOKEN_REFRESH_MARGIN_MINS: i64 = 5;

/// Lifetime assumed when the token endpoint omits `msft:expiry`.
const DEFAULT_TOKEN_LIFETIME_MINS: i64 = 45;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(rename = "msft:expiry", default)]
    expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now > chrono::Duration::minutes(TOKEN_REFRESH_MARGIN_MINS)
    }
}

/// Signs Planetary Computer assets with a per-collection SAS token.
///
/// Tokens are shared across analyses for as long as the signer lives, so a
/// long-running server refetches them as they approach `msft:expiry`.
pub struct PlanetaryComputerSigner {
    client: reqwest::Client,
    token_url: String,
    collection: String,
    tokens: Mutex<HashMap<String, CachedToken>>,
}

impl PlanetaryComputerSigner {
    pub fn new(cfg: &CatalogConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            token_url: cfg.sign_url.trim_end_matches('/').to_string(),
            collection: cfg.collection.clone(),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    async fn token(&self) -> Result<String> {
        let mut tokens = self.tokens.lock().await;
        match tokens.get(&self.collection) {
            Some(cached) if cached.is_fresh(Utc::now()) => return Ok(cached.token.clone()),
            Some(cached) => log::debug!(
                "SAS token for {} expires at {}; refreshing",
                self.collection,
                cached.expires_at
            ),
            None => {}
        }

        let url = format!("{}/{}", self.token_url, self.collection);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AnalysisError::Signing(format!("token request failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(AnalysisError::Signing(format!(
                "token endpoint returned HTTP {}",
                resp.status()
            )));
        }
        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AnalysisError::Signing(format!("invalid token response: {}", e)))?;

        let expires_at = parsed
            .expiry
            .unwrap_or_else(|| Utc::now() + chrono::Duration::minutes(DEFAULT_TOKEN_LIFETIME_MINS));
        log::debug!(
            "obtained SAS token for {} (expires {})",
            self.collection,
            expires_at
        );
        tokens.insert(
            self.collection.clone(),
            CachedToken {
                token: parsed.token.clone(),
                expires_at,
            },
        );
        Ok(parsed.token)
    }
}

/// Append a query-string token to an href.
pub fn append_token(href: &str, token: &str) -> String {
    let token = token.trim_start_matches('?');
    if href.contains('?') {
        format!("{}&{}", href, token)
    } else {
        format!("{}?{}", href, token)
    }
}

#[async_trait]
impl AssetSigner for PlanetaryComputerSigner {
    async fn sign(&self, scene: &SceneRecord) -> Result<SceneRecord> {
        let token = self.token().await?;
        let mut signed = scene.clone();
        for href in signed.band_assets.values_mut() {
            *href = append_token(href, &token);
        }
        Ok(signed)
    }
}

/// Signer selected by `catalog.sign_assets`.
pub fn signer_from_config(cfg: &CatalogConfig) -> Result<Box<dyn AssetSigner>> {
    if cfg.sign_assets {
        Ok(Box::new(PlanetaryComputerSigner::new(cfg)?))
    } else {
        Ok(Box::new(NoSigning))
    }
}

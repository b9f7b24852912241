//! Raster acquisition with retry, backoff and resolution capping.
//!
//! A [`RasterSource`] reads one band from a location and returns a
//! [`RasterTile`]. [`fetch`] wraps a source with the retry policy:
//!
//! - each attempt is bounded by `timeout`; a timeout counts as one failure
//! - after failed attempt `n` (starting at 0) the fetcher waits
//!   `2^n × backoff_unit` before trying again
//! - after `max_retries` failed attempts the last error is returned inside
//!   [`AnalysisError::FetchExhausted`]
//!
//! [`HttpGeoTiffSource`] is the production source. It reads a GeoTIFF over
//! HTTP with `Range` requests, so only the header, the IFD chain and the
//! chosen image level are transferred, and decodes it with
//! [`decode_geotiff_from`], which caps the output at `max_dimension` on both
//! axes. Servers that ignore `Range` get a single full download instead.

use async_trait::async_trait;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;

use crate::config::FetchConfig;
use crate::error::{AnalysisError, Result};

const MODEL_PIXEL_SCALE_TAG: u16 = 33550;
const MODEL_TIEPOINT_TAG: u16 = 33922;

/// Affine georeference of a raster grid.
///
/// ```text
/// x = origin_x + col * pixel_width + row * row_rotation
/// y = origin_y + col * col_rotation + row * pixel_height
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    /// Usually negative for north-up rasters.
    pub pixel_height: f64,
    pub row_rotation: f64,
    pub col_rotation: f64,
}

impl GeoTransform {
    pub fn new(origin_x: f64, origin_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
            row_rotation: 0.0,
            col_rotation: 0.0,
        }
    }

    /// Identity transform: pixel coordinates are map coordinates.
    pub fn identity() -> Self {
        Self::new(0.0, 0.0, 1.0, 1.0)
    }

    /// Transform for the same extent sampled with pixels `factor_x`/`factor_y`
    /// times larger. Downsampling by scale `s` uses a factor of `1 / s`.
    pub fn scaled(&self, factor_x: f64, factor_y: f64) -> Self {
        Self {
            origin_x: self.origin_x,
            origin_y: self.origin_y,
            pixel_width: self.pixel_width * factor_x,
            pixel_height: self.pixel_height * factor_y,
            row_rotation: self.row_rotation * factor_y,
            col_rotation: self.col_rotation * factor_x,
        }
    }
}

/// One decoded band: raw values (row-major, `[rows, cols]`) plus georeference.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterTile {
    pub data: Array2<f32>,
    pub transform: GeoTransform,
}

impl RasterTile {
    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }
}

/// Reads a single band from a location.
#[async_trait]
pub trait RasterSource: Send + Sync {
    /// One read attempt. No retrying; [`fetch`] handles that.
    async fn read(&self, location: &str, max_dimension: u32) -> Result<RasterTile>;
}

/// Retry and resolution settings for [`fetch`].
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub max_dimension: u32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_unit: Duration,
}

impl From<&FetchConfig> for FetchOptions {
    fn from(cfg: &FetchConfig) -> Self {
        Self {
            max_dimension: cfg.max_dimension,
            timeout: cfg.timeout(),
            max_retries: cfg.max_retries,
            backoff_unit: cfg.backoff_unit(),
        }
    }
}

/// Location with any query string (e.g. a SAS token) removed, for logs and errors.
pub fn display_location(location: &str) -> &str {
    location.split('?').next().unwrap_or(location)
}

/// Read a band with bounded retries and exponential backoff.
pub async fn fetch(
    source: &dyn RasterSource,
    location: &str,
    opts: &FetchOptions,
) -> Result<RasterTile> {
    let shown = display_location(location);
    let attempts = opts.max_retries.max(1);
    let mut last_err = None;

    for attempt in 0..attempts {
        log::debug!("reading {} (attempt {}/{})", shown, attempt + 1, attempts);

        let outcome = tokio::time::timeout(opts.timeout, source.read(location, opts.max_dimension)).await;

        let err = match outcome {
            Ok(Ok(tile)) => {
                log::info!(
                    "read {} as {}x{} after {} attempt(s)",
                    shown,
                    tile.width(),
                    tile.height(),
                    attempt + 1
                );
                return Ok(tile);
            }
            Ok(Err(e)) => e,
            Err(_) => AnalysisError::Timeout {
                location: shown.to_string(),
                elapsed: opts.timeout,
            },
        };

        if attempt + 1 < attempts {
            let delay = opts.backoff_unit * 2u32.saturating_pow(attempt.min(16));
            log::warn!(
                "attempt {} for {} failed: {}; retrying in {:?}",
                attempt + 1,
                shown,
                err,
                delay
            );
            last_err = Some(err);
            tokio::time::sleep(delay).await;
        } else {
            log::warn!("all {} attempts for {} failed: {}", attempts, shown, err);
            last_err = Some(err);
        }
    }

    Err(AnalysisError::FetchExhausted {
        location: shown.to_string(),
        attempts,
        source: Box::new(
            last_err.unwrap_or_else(|| AnalysisError::Raster("no attempt was made".to_string())),
        ),
    })
}

/// Default size of one ranged read.
pub const DEFAULT_BLOCK_SIZE: u64 = 1 << 20;

/// Upper bound on blocks coalesced into a single request.
const MAX_BLOCKS_PER_REQUEST: u64 = 16;

/// Reads GeoTIFF files over HTTP(S) with byte-range requests.
pub struct HttpGeoTiffSource {
    client: reqwest::Client,
    block_size: u64,
}

impl HttpGeoTiffSource {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            block_size: DEFAULT_BLOCK_SIZE,
        })
    }

    /// Use `block_size` bytes per ranged read (minimum 1).
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size.max(1);
        self
    }
}

#[async_trait]
impl RasterSource for HttpGeoTiffSource {
    async fn read(&self, location: &str, max_dimension: u32) -> Result<RasterTile> {
        let shown = display_location(location);
        let resp = self
            .client
            .get(location)
            .header(RANGE, format!("bytes=0-{}", self.block_size - 1))
            .send()
            .await?;
        let status = resp.status();

        if status == StatusCode::OK {
            let bytes = resp.bytes().await?;
            log::debug!(
                "server ignored Range; downloaded {:.1} MB from {}",
                bytes.len() as f64 / (1024.0 * 1024.0),
                shown
            );
            return decode_blocking(move || decode_geotiff(&bytes, max_dimension)).await;
        }
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(AnalysisError::Raster(format!(
                "HTTP {} fetching {}",
                status, shown
            )));
        }

        let len = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| {
                AnalysisError::Raster(format!("missing or invalid Content-Range from {}", shown))
            })?;
        let head = resp.bytes().await?.to_vec();

        let reader = RangeReader::new(
            self.client.clone(),
            location.to_string(),
            len,
            self.block_size,
            head,
            tokio::runtime::Handle::current(),
        )?;
        let fetched = reader.fetched.clone();
        // A timed-out attempt drops this future; stop the blocking reader too.
        let _cancel = CancelOnDrop(reader.cancelled.clone());

        let tile = decode_blocking(move || decode_geotiff_from(reader, max_dimension)).await?;
        log::debug!(
            "read {:.1} of {:.1} MB from {}",
            fetched.load(Ordering::Relaxed) as f64 / (1024.0 * 1024.0),
            len as f64 / (1024.0 * 1024.0),
            shown
        );
        Ok(tile)
    }
}

// Decoding is CPU-bound; keep it off the async workers.
async fn decode_blocking<F>(decode: F) -> Result<RasterTile>
where
    F: FnOnce() -> Result<RasterTile> + Send + 'static,
{
    tokio::task::spawn_blocking(decode)
        .await
        .map_err(|e| AnalysisError::Raster(format!("decode task failed: {}", e)))?
}

/// Total length from a `Content-Range` value such as `bytes 0-1023/52428`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let spec = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = spec.split_once('/')?;
    total.trim().parse().ok()
}

struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Synchronous `Read + Seek` view of a remote file.
///
/// Runs on a blocking thread and drives ranged GETs through the runtime
/// handle. Fetched blocks are shared between clones, so re-opening the
/// decoder does not download the header twice.
#[derive(Clone)]
struct RangeReader {
    client: reqwest::Client,
    url: String,
    len: u64,
    pos: u64,
    block_size: u64,
    handle: tokio::runtime::Handle,
    blocks: Arc<Mutex<HashMap<u64, Arc<Vec<u8>>>>>,
    fetched: Arc<AtomicU64>,
    cancelled: Arc<AtomicBool>,
}

impl RangeReader {
    fn new(
        client: reqwest::Client,
        url: String,
        len: u64,
        block_size: u64,
        head: Vec<u8>,
        handle: tokio::runtime::Handle,
    ) -> Result<Self> {
        if head.len() as u64 != block_size.min(len) {
            return Err(AnalysisError::Raster(format!(
                "first range of {} returned {} bytes, expected {}",
                display_location(&url),
                head.len(),
                block_size.min(len)
            )));
        }
        let fetched = Arc::new(AtomicU64::new(head.len() as u64));
        let mut blocks = HashMap::new();
        blocks.insert(0, Arc::new(head));
        Ok(Self {
            client,
            url,
            len,
            pos: 0,
            block_size,
            handle,
            blocks: Arc::new(Mutex::new(blocks)),
            fetched,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    fn cache(&self) -> io::Result<std::sync::MutexGuard<'_, HashMap<u64, Arc<Vec<u8>>>>> {
        self.blocks
            .lock()
            .map_err(|_| io::Error::other("block cache poisoned"))
    }

    /// Block `index`, fetching it together with any uncached blocks up to
    /// the one holding byte `want_until - 1`.
    fn block(&self, index: u64, want_until: u64) -> io::Result<Arc<Vec<u8>>> {
        let last_wanted = (want_until.saturating_sub(1) / self.block_size)
            .min(index + MAX_BLOCKS_PER_REQUEST - 1);
        let mut last = index;
        {
            let cache = self.cache()?;
            if let Some(block) = cache.get(&index) {
                return Ok(block.clone());
            }
            while last < last_wanted && !cache.contains_key(&(last + 1)) {
                last += 1;
            }
        }

        if self.cancelled.load(Ordering::Relaxed) {
            return Err(io::Error::other("read cancelled"));
        }

        let start = index * self.block_size;
        let end = ((last + 1) * self.block_size).min(self.len);
        let body = self.handle.block_on(self.fetch_range(start, end))?;
        if body.len() as u64 != end - start {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {}-{} returned {} bytes", start, end - 1, body.len()),
            ));
        }
        self.fetched.fetch_add(body.len() as u64, Ordering::Relaxed);

        let mut cache = self.cache()?;
        for (i, chunk) in body.chunks(self.block_size as usize).enumerate() {
            cache
                .entry(index + i as u64)
                .or_insert_with(|| Arc::new(chunk.to_vec()));
        }
        cache
            .get(&index)
            .cloned()
            .ok_or_else(|| io::Error::other("block missing after fetch"))
    }

    async fn fetch_range(&self, start: u64, end: u64) -> io::Result<Vec<u8>> {
        log::debug!(
            "range {}-{} of {}",
            start,
            end - 1,
            display_location(&self.url)
        );
        let resp = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={}-{}", start, end - 1))
            .send()
            .await
            .map_err(io::Error::other)?;
        if resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(io::Error::other(format!(
                "range request returned HTTP {}",
                resp.status()
            )));
        }
        let bytes = resp.bytes().await.map_err(io::Error::other)?;
        Ok(bytes.to_vec())
    }
}

impl Read for RangeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.len {
            return Ok(0);
        }
        let index = self.pos / self.block_size;
        let want_until = (self.pos + buf.len() as u64).min(self.len);
        let block = self.block(index, want_until)?;

        let offset = (self.pos - index * self.block_size) as usize;
        let n = block.len().saturating_sub(offset).min(buf.len());
        buf[..n].copy_from_slice(&block[offset..offset + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for RangeReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let next = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        let next = next.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of file")
        })?;
        self.pos = next;
        Ok(next)
    }
}

/// Output size for a `width × height` source capped at `max_dimension`.
///
/// Returns the source size when it already fits; otherwise scales both
/// axes by `min(max/width, max/height)`.
pub fn target_size(width: usize, height: usize, max_dimension: u32) -> (usize, usize) {
    let max = max_dimension as f64;
    if width as f64 <= max && height as f64 <= max {
        return (width, height);
    }
    let scale = (max / width as f64).min(max / height as f64);
    let w = ((width as f64 * scale) as usize).max(1);
    let h = ((height as f64 * scale) as usize).max(1);
    (w, h)
}

/// Decode the first band of a GeoTIFF, downsampled to fit `max_dimension`.
///
/// If the file carries reduced-resolution images (COG overviews), the
/// smallest one still at least as large as the target is decoded instead
/// of the full-resolution image. The returned transform is always derived
/// from the full-resolution georeference.
pub fn decode_geotiff(bytes: &[u8], max_dimension: u32) -> Result<RasterTile> {
    decode_geotiff_from(Cursor::new(bytes), max_dimension)
}

/// [`decode_geotiff`] over any seekable reader. The reader is cloned to
/// re-open the file after the IFD walk, so clones should share any buffering.
pub fn decode_geotiff_from<R>(reader: R, max_dimension: u32) -> Result<RasterTile>
where
    R: Read + Seek + Clone,
{
    let mut decoder = open_decoder(reader.clone())?;

    let (w0, h0) = decoder.dimensions().map_err(tiff_err)?;
    let (w0, h0) = (w0 as usize, h0 as usize);
    let base_transform = read_geotransform(&mut decoder).unwrap_or_else(|| {
        log::debug!("no georeference tags; using identity transform");
        GeoTransform::identity()
    });

    let (tw, th) = target_size(w0, h0, max_dimension);

    // Walk the IFD chain for the smallest usable level.
    let mut level = 0usize;
    let mut index = 0usize;
    while decoder.more_images() {
        decoder.next_image().map_err(tiff_err)?;
        index += 1;
        let (w, h) = decoder.dimensions().map_err(tiff_err)?;
        let single_band = matches!(decoder.colortype(), Ok(tiff::ColorType::Gray(_)));
        if single_band && (w as usize) >= tw && (h as usize) >= th && (w as usize) < w0 {
            level = index;
        }
    }

    let mut decoder = open_decoder(reader)?;
    for _ in 0..level {
        decoder.next_image().map_err(tiff_err)?;
    }
    if level > 0 {
        log::debug!("using overview level {}", level);
    }

    let data = read_band(&mut decoder)?;
    let data = if data.dim() == (th, tw) {
        data
    } else {
        log::info!(
            "downsampling from {}x{} to {}x{}",
            data.ncols(),
            data.nrows(),
            tw,
            th
        );
        downsample_area(&data, th, tw)
    };

    let transform = base_transform.scaled(w0 as f64 / tw as f64, h0 as f64 / th as f64);

    Ok(RasterTile { data, transform })
}

fn open_decoder<R: Read + Seek>(reader: R) -> Result<Decoder<R>> {
    Decoder::new(reader)
        .map(|d| d.with_limits(Limits::unlimited()))
        .map_err(tiff_err)
}

fn tiff_err(e: tiff::TiffError) -> AnalysisError {
    AnalysisError::Raster(format!("TIFF decode error: {}", e))
}

fn read_band<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Array2<f32>> {
    let (w, h) = decoder.dimensions().map_err(tiff_err)?;
    let (cols, rows) = (w as usize, h as usize);

    let samples = match decoder.colortype().map_err(tiff_err)? {
        tiff::ColorType::Gray(_) => 1,
        tiff::ColorType::GrayA(_) => 2,
        tiff::ColorType::RGB(_) => 3,
        tiff::ColorType::RGBA(_) => 4,
        other => {
            return Err(AnalysisError::Raster(format!(
                "unsupported color type: {:?}",
                other
            )))
        }
    };

    let values: Vec<f32> = match decoder.read_image().map_err(tiff_err)? {
        DecodingResult::U8(buf) => buf.into_iter().step_by(samples).map(f32::from).collect(),
        DecodingResult::U16(buf) => buf.into_iter().step_by(samples).map(f32::from).collect(),
        DecodingResult::U32(buf) => buf.into_iter().step_by(samples).map(|v| v as f32).collect(),
        DecodingResult::U64(buf) => buf.into_iter().step_by(samples).map(|v| v as f32).collect(),
        DecodingResult::I8(buf) => buf.into_iter().step_by(samples).map(f32::from).collect(),
        DecodingResult::I16(buf) => buf.into_iter().step_by(samples).map(f32::from).collect(),
        DecodingResult::I32(buf) => buf.into_iter().step_by(samples).map(|v| v as f32).collect(),
        DecodingResult::I64(buf) => buf.into_iter().step_by(samples).map(|v| v as f32).collect(),
        DecodingResult::F32(buf) => buf.into_iter().step_by(samples).collect(),
        DecodingResult::F64(buf) => buf.into_iter().step_by(samples).map(|v| v as f32).collect(),
        #[allow(unreachable_patterns)]
        _ => {
            return Err(AnalysisError::Raster(
                "unsupported TIFF sample format".to_string(),
            ))
        }
    };

    Array2::from_shape_vec((rows, cols), values)
        .map_err(|e| AnalysisError::Raster(format!("pixel count does not match {}x{}: {}", cols, rows, e)))
}

/// ModelPixelScale + ModelTiepoint → north-up transform.
fn read_geotransform<R: Read + Seek>(
    decoder: &mut Decoder<R>,
) -> Option<GeoTransform> {
    let scale = decoder
        .get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE_TAG))
        .ok()?;
    let tiepoint = decoder
        .get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_TIEPOINT_TAG))
        .ok()?;

    if scale.len() < 2 || tiepoint.len() < 6 {
        return None;
    }

    // tiepoint: [I, J, K, X, Y, Z]
    let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
    let origin_y = tiepoint[4] + tiepoint[1] * scale[1];
    Some(GeoTransform::new(origin_x, origin_y, scale[0], -scale[1]))
}

/// Per output cell: `(source index, weight)` pairs covering its footprint.
fn area_weights(src_len: usize, dst_len: usize) -> Vec<Vec<(usize, f32)>> {
    let ratio = src_len as f64 / dst_len as f64;
    (0..dst_len)
        .map(|i| {
            let start = i as f64 * ratio;
            let end = (i + 1) as f64 * ratio;
            let first = start.floor() as usize;
            let last = (end.ceil() as usize).min(src_len);
            (first..last)
                .filter_map(|j| {
                    let overlap = (end.min((j + 1) as f64) - start.max(j as f64)) / ratio;
                    (overlap > 0.0).then_some((j, overlap as f32))
                })
                .collect()
        })
        .collect()
}

/// Area-average resample to `rows × cols` (separable box filter with
/// fractional edge weights).
pub fn downsample_area(src: &Array2<f32>, rows: usize, cols: usize) -> Array2<f32> {
    let col_weights = area_weights(src.ncols(), cols);
    let row_weights = area_weights(src.nrows(), rows);

    let mut horizontal = Array2::<f32>::zeros((src.nrows(), cols));
    for (r, src_row) in src.outer_iter().enumerate() {
        for (c, weights) in col_weights.iter().enumerate() {
            horizontal[[r, c]] = weights.iter().map(|&(j, w)| src_row[j] * w).sum();
        }
    }

    let mut out = Array2::<f32>::zeros((rows, cols));
    for (r, weights) in row_weights.iter().enumerate() {
        for c in 0..cols {
            out[[r, c]] = weights.iter().map(|&(j, w)| horizontal[[j, c]] * w).sum();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;
    use tiff::encoder::{colortype, TiffEncoder};

    /// Fails the first `failures` reads, then returns a 2×2 tile.
    struct FlakySource {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakySource {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl RasterSource for FlakySource {
        async fn read(&self, _location: &str, _max_dimension: u32) -> Result<RasterTile> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(AnalysisError::Raster(format!("transient failure {}", n)));
            }
            Ok(RasterTile {
                data: Array2::from_elem((2, 2), 1234.0),
                transform: GeoTransform::identity(),
            })
        }
    }

    struct HangingSource;

    #[async_trait]
    impl RasterSource for HangingSource {
        async fn read(&self, _location: &str, _max_dimension: u32) -> Result<RasterTile> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!("the fetch timeout should fire first")
        }
    }

    fn opts(max_retries: u32) -> FetchOptions {
        FetchOptions {
            max_dimension: 1024,
            timeout: Duration::from_secs(5),
            max_retries,
            backoff_unit: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let k = 2;
        let source = FlakySource::new(k);
        let started = Instant::now();

        let tile = fetch(&source, "https://example.test/B04.tif?sig=secret", &opts(4))
            .await
            .unwrap();

        assert_eq!(tile.data[[0, 0]], 1234.0);
        assert_eq!(source.calls.load(Ordering::SeqCst), k + 1);
        // 2^0 + 2^1 units of 10 ms
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_attempts() {
        let source = FlakySource::new(u32::MAX);
        let err = fetch(&source, "https://example.test/B08.tif?sig=secret", &opts(3))
            .await
            .unwrap_err();

        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts(), Some(3));
        match err {
            AnalysisError::FetchExhausted {
                location, source, ..
            } => {
                assert_eq!(location, "https://example.test/B08.tif");
                assert!(source.to_string().contains("transient failure 2"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failed_attempt() {
        let mut o = opts(2);
        o.timeout = Duration::from_millis(20);
        let err = fetch(&HangingSource, "https://example.test/slow.tif", &o)
            .await
            .unwrap_err();
        assert_eq!(err.attempts(), Some(2));
        assert!(err.to_string().contains("timed out after 20ms"), "got {}", err);
    }

    #[test]
    fn test_target_size() {
        assert_eq!(target_size(500, 400, 1024), (500, 400));
        assert_eq!(target_size(1024, 1024, 1024), (1024, 1024));
        assert_eq!(target_size(10980, 10980, 1024), (1024, 1024));
        assert_eq!(target_size(4000, 2000, 1000), (1000, 500));
        assert_eq!(target_size(2000, 4000, 1000), (500, 1000));
    }

    #[test]
    fn test_downsample_area_averages_blocks() {
        let src = Array2::from_shape_fn((4, 4), |(r, c)| if r < 2 && c < 2 { 4.0 } else { 0.0 });
        let out = downsample_area(&src, 2, 2);
        assert_eq!(out.dim(), (2, 2));
        assert!((out[[0, 0]] - 4.0).abs() < 1e-6);
        assert!(out[[0, 1]].abs() < 1e-6);
        assert!(out[[1, 1]].abs() < 1e-6);
    }

    #[test]
    fn test_downsample_fractional_preserves_mean() {
        let src = Array2::from_shape_fn((7, 5), |(r, c)| (r * 5 + c) as f32);
        let out = downsample_area(&src, 3, 2);
        let src_mean = src.mean().unwrap();
        let out_mean = out.mean().unwrap();
        assert!((src_mean - out_mean).abs() < 1e-3);
    }

    #[test]
    fn test_transform_scaling_consistent() {
        let t = GeoTransform::new(500000.0, 4200000.0, 10.0, -10.0);
        // 10980 px downsampled by scale 1024/10980
        let scale = 1024.0 / 10980.0;
        let s = t.scaled(1.0 / scale, 1.0 / scale);
        assert!((s.pixel_width - 10.0 / scale).abs() < 1e-9);
        assert!((s.pixel_height + 10.0 / scale).abs() < 1e-9);
        assert_eq!(s.origin_x, t.origin_x);
        // Extent is preserved.
        assert!((s.pixel_width * 1024.0 - t.pixel_width * 10980.0).abs() < 1e-6);
    }

    fn encode_test_tiff(width: u32, height: u32, data: &[u16]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut buf).unwrap();
            let mut image = encoder
                .new_image::<colortype::Gray16>(width, height)
                .unwrap();
            image
                .encoder()
                .write_tag(Tag::Unknown(MODEL_PIXEL_SCALE_TAG), &[10.0f64, 10.0, 0.0][..])
                .unwrap();
            image
                .encoder()
                .write_tag(
                    Tag::Unknown(MODEL_TIEPOINT_TAG),
                    &[0.0f64, 0.0, 0.0, 300000.0, 3100000.0, 0.0][..],
                )
                .unwrap();
            image.write_data(data).unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn test_decode_geotiff_native_resolution() {
        let data: Vec<u16> = (0..12).map(|v| v * 100).collect();
        let bytes = encode_test_tiff(4, 3, &data);

        let tile = decode_geotiff(&bytes, 1024).unwrap();
        assert_eq!(tile.data.dim(), (3, 4));
        assert_eq!(tile.data[[1, 2]], 600.0);
        assert_eq!(tile.transform.origin_x, 300000.0);
        assert_eq!(tile.transform.origin_y, 3100000.0);
        assert_eq!(tile.transform.pixel_width, 10.0);
        assert_eq!(tile.transform.pixel_height, -10.0);
    }

    #[test]
    fn test_decode_geotiff_downsamples_and_scales_transform() {
        let data = vec![2000u16; 8 * 4];
        let bytes = encode_test_tiff(8, 4, &data);

        let tile = decode_geotiff(&bytes, 4).unwrap();
        assert_eq!(tile.data.dim(), (2, 4));
        assert!(tile.data.iter().all(|v| (v - 2000.0).abs() < 1e-3));
        assert!((tile.transform.pixel_width - 20.0).abs() < 1e-9);
        assert!((tile.transform.pixel_height + 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_geotiff(b"definitely not a tiff", 16),
            Err(AnalysisError::Raster(_))
        ));
    }

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-1023/52428"), Some(52428));
        assert_eq!(parse_content_range_total("bytes */1234"), Some(1234));
        assert_eq!(parse_content_range_total("bytes 0-1023/*"), None);
        assert_eq!(parse_content_range_total("items 0-1/2"), None);
    }

    /// Serves `body` at `/ranged.tif` honouring `Range`, and at `/plain.tif`
    /// ignoring it. Returns the base URL and the ranged request counter.
    async fn serve_tiff(body: Vec<u8>) -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        use axum::http::{header, HeaderMap, StatusCode as HttpStatus};
        use axum::response::IntoResponse;
        use axum::routing::get;
        use axum::Router;

        let body = Arc::new(body);
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let ranged_body = body.clone();
        let counter = hits.clone();
        let ranged = move |headers: HeaderMap| {
            let body = ranged_body.clone();
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let range = headers
                    .get(header::RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("bytes="))
                    .and_then(|v| v.split_once('-'))
                    .map(|(a, b)| (a.parse::<usize>().unwrap(), b.parse::<usize>().unwrap()));
                match range {
                    Some((start, end)) => {
                        let end = end.min(body.len() - 1);
                        (
                            HttpStatus::PARTIAL_CONTENT,
                            [(
                                header::CONTENT_RANGE,
                                format!("bytes {}-{}/{}", start, end, body.len()),
                            )],
                            body[start..=end].to_vec(),
                        )
                            .into_response()
                    }
                    None => body.to_vec().into_response(),
                }
            }
        };
        let plain_body = body.clone();
        let plain = move || {
            let body = plain_body.clone();
            async move { body.to_vec() }
        };

        let app = Router::new()
            .route("/ranged.tif", get(ranged))
            .route("/plain.tif", get(plain));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), hits)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_http_source_reads_with_ranges() {
        let data: Vec<u16> = (0..64 * 32).map(|v| (v % 1000) as u16).collect();
        let bytes = encode_test_tiff(64, 32, &data);
        let expected = decode_geotiff(&bytes, 1024).unwrap();
        let total = bytes.len();

        let (base, hits) = serve_tiff(bytes).await;
        let source = HttpGeoTiffSource::new().unwrap().with_block_size(256);

        let tile = source
            .read(&format!("{}/ranged.tif?sig=abc", base), 1024)
            .await
            .unwrap();
        assert_eq!(tile, expected);

        let requests = hits.load(Ordering::SeqCst);
        assert!(requests > 1, "expected several range requests, got {}", requests);
        // Coalescing keeps the request count well under one per block.
        assert!(requests <= total / 256 + 2, "got {} requests", requests);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_http_source_falls_back_when_range_ignored() {
        let data = vec![1500u16; 16 * 8];
        let bytes = encode_test_tiff(16, 8, &data);

        let (base, _) = serve_tiff(bytes).await;
        let source = HttpGeoTiffSource::new().unwrap().with_block_size(64);

        let tile = source.read(&format!("{}/plain.tif", base), 1024).await.unwrap();
        assert_eq!(tile.data.dim(), (8, 16));
        assert!(tile.data.iter().all(|&v| v == 1500.0));
    }

    #[test]
    fn test_display_location_strips_query() {
        assert_eq!(
            display_location("https://a.b/c.tif?st=1&sig=abc"),
            "https://a.b/c.tif"
        );
        assert_eq!(display_location("/local/file.tif"), "/local/file.tif");
    }
}

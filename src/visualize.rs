//! Visualization encoder: index rasters → colored PNG bytes.
//!
//! Two normalizations feed the color step:
//!
//! - **magnitude**: [`percentile_stretch`] clips to the 2nd/98th percentile
//!   and rescales to `0..=255`
//! - **difference**: [`normalize_difference`] centres on zero using the
//!   raster's own maximum absolute value, so no change lands on 127
//!
//! The color step walks a prioritized chain of [`ColorMapper`]s. Named
//! palettes come from configuration and may be unsupported, in which case
//! they fail and the next one is tried. The chain always ends with a
//! synthesized [`Gradient`] that cannot fail.

use ndarray::Array2;

use crate::config::RenderConfig;
use crate::error::{AnalysisError, Result};

/// Gray value representing "no change" after difference normalization.
pub const MIDPOINT: u8 = 127;

const LOWER_PERCENTILE: f64 = 2.0;
const UPPER_PERCENTILE: f64 = 98.0;

/// Which normalization and fallback gradient to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMode {
    /// A single-scene index raster.
    Magnitude,
    /// A signed change raster.
    Difference,
}

impl EncodeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Magnitude => "magnitude",
            Self::Difference => "difference",
        }
    }
}

/// RGB color, 0..=255 per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// A color stop: position in `[0, 1]` and its color.
#[derive(Debug, Clone, Copy)]
pub struct ColorStop {
    pub t: f64,
    pub color: Rgb,
}

impl ColorStop {
    pub const fn new(t: f64, r: u8, g: u8, b: u8) -> Self {
        Self {
            t,
            color: Rgb::new(r, g, b),
        }
    }
}

/// Error from a single mapper; the encoder moves on to the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColormapError(pub String);

impl std::fmt::Display for ColormapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps 8-bit gray values to RGB pixels.
pub trait ColorMapper: Send + Sync {
    /// Name recorded in the results summary.
    fn name(&self) -> &str;

    /// Interleaved RGB bytes, three per input pixel, in row-major order.
    fn apply(&self, gray: &Array2<u8>) -> std::result::Result<Vec<u8>, ColormapError>;
}

// ============ Named palettes ============

const AUTUMN: &[ColorStop] = &[ColorStop::new(0.0, 255, 0, 0), ColorStop::new(1.0, 255, 255, 0)];

const SPRING: &[ColorStop] = &[ColorStop::new(0.0, 255, 0, 255), ColorStop::new(1.0, 255, 255, 0)];

const SUMMER: &[ColorStop] = &[ColorStop::new(0.0, 0, 128, 102), ColorStop::new(1.0, 255, 255, 102)];

const COOL: &[ColorStop] = &[ColorStop::new(0.0, 0, 255, 255), ColorStop::new(1.0, 255, 0, 255)];

const HOT: &[ColorStop] = &[
    ColorStop::new(0.0, 0, 0, 0),
    ColorStop::new(1.0 / 3.0, 255, 0, 0),
    ColorStop::new(2.0 / 3.0, 255, 255, 0),
    ColorStop::new(1.0, 255, 255, 255),
];

const JET: &[ColorStop] = &[
    ColorStop::new(0.0, 0, 0, 128),
    ColorStop::new(0.125, 0, 0, 255),
    ColorStop::new(0.375, 0, 255, 255),
    ColorStop::new(0.625, 255, 255, 0),
    ColorStop::new(0.875, 255, 0, 0),
    ColorStop::new(1.0, 128, 0, 0),
];

const HSV: &[ColorStop] = &[
    ColorStop::new(0.0, 255, 0, 0),
    ColorStop::new(1.0 / 6.0, 255, 255, 0),
    ColorStop::new(2.0 / 6.0, 0, 255, 0),
    ColorStop::new(3.0 / 6.0, 0, 255, 255),
    ColorStop::new(4.0 / 6.0, 0, 0, 255),
    ColorStop::new(5.0 / 6.0, 255, 0, 255),
    ColorStop::new(1.0, 255, 0, 0),
];

const RAINBOW: &[ColorStop] = &[
    ColorStop::new(0.0, 255, 0, 0),
    ColorStop::new(0.2, 255, 128, 0),
    ColorStop::new(0.4, 255, 255, 0),
    ColorStop::new(0.6, 0, 255, 0),
    ColorStop::new(0.8, 0, 0, 255),
    ColorStop::new(1.0, 128, 0, 255),
];

/// Stops for a palette name (case-insensitive), if this build provides it.
pub fn palette_stops(name: &str) -> Option<&'static [ColorStop]> {
    let stops = match name.to_ascii_uppercase().as_str() {
        "AUTUMN" => AUTUMN,
        "SPRING" => SPRING,
        "SUMMER" => SUMMER,
        "COOL" => COOL,
        "HOT" => HOT,
        "JET" => JET,
        "HSV" => HSV,
        "RAINBOW" => RAINBOW,
        _ => return None,
    };
    Some(stops)
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

fn lerp_color(c1: Rgb, c2: Rgb, t: f64) -> Rgb {
    Rgb::new(
        lerp(c1.r as f64, c2.r as f64, t).round() as u8,
        lerp(c1.g as f64, c2.g as f64, t).round() as u8,
        lerp(c1.b as f64, c2.b as f64, t).round() as u8,
    )
}

fn multi_stop(stops: &[ColorStop], t: f64) -> Rgb {
    if t <= stops[0].t {
        return stops[0].color;
    }
    for pair in stops.windows(2) {
        if t <= pair[1].t {
            let ratio = (t - pair[0].t) / (pair[1].t - pair[0].t);
            return lerp_color(pair[0].color, pair[1].color, ratio);
        }
    }
    stops[stops.len() - 1].color
}

fn build_lut(stops: &[ColorStop]) -> [Rgb; 256] {
    let mut lut = [Rgb::new(0, 0, 0); 256];
    for (i, slot) in lut.iter_mut().enumerate() {
        *slot = multi_stop(stops, i as f64 / 255.0);
    }
    lut
}

fn apply_lut(lut: &[Rgb; 256], gray: &Array2<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(gray.len() * 3);
    for &v in gray.iter() {
        let c = lut[v as usize];
        out.extend_from_slice(&[c.r, c.g, c.b]);
    }
    out
}

/// A palette looked up by name when applied.
///
/// Unknown names fail at application time, not at construction.
pub struct NamedPalette {
    name: String,
}

impl NamedPalette {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl ColorMapper for NamedPalette {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, gray: &Array2<u8>) -> std::result::Result<Vec<u8>, ColormapError> {
        let stops = palette_stops(&self.name)
            .ok_or_else(|| ColormapError(format!("palette '{}' is not available", self.name)))?;
        Ok(apply_lut(&build_lut(stops), gray))
    }
}

// ============ Synthesized gradients ============

/// Hand-built gradients used when no named palette applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gradient {
    /// Brown → yellow → green keyed on intensity thresholds 0.3 and 0.7.
    Vegetation,
    /// Red (loss) → gray (127) → green (gain).
    Diverging,
}

impl Gradient {
    pub fn for_mode(mode: EncodeMode) -> Self {
        match mode {
            EncodeMode::Magnitude => Self::Vegetation,
            EncodeMode::Difference => Self::Diverging,
        }
    }

    pub fn color(&self, v: u8) -> Rgb {
        match self {
            Self::Vegetation => vegetation_color(v),
            Self::Diverging => diverging_color(v),
        }
    }
}

fn channel(x: f64) -> u8 {
    x.clamp(0.0, 255.0) as u8
}

fn vegetation_color(v: u8) -> Rgb {
    let i = v as f64 / 255.0;
    if i < 0.3 {
        Rgb::new(
            channel(150.0 + 100.0 * i),
            channel(50.0 + 150.0 * i),
            channel(50.0 + 100.0 * i),
        )
    } else if i < 0.7 {
        let t = (i - 0.3) / 0.4;
        Rgb::new(
            channel(200.0 * (1.0 - t)),
            channel(150.0 + 100.0 * t),
            channel(50.0 * (1.0 - t)),
        )
    } else {
        let t = (i - 0.7) / 0.3;
        Rgb::new(
            channel(50.0 * (1.0 - t)),
            channel(200.0 + 55.0 * t),
            channel(50.0 * (1.0 - t)),
        )
    }
}

fn diverging_color(v: u8) -> Rgb {
    match v.cmp(&MIDPOINT) {
        std::cmp::Ordering::Less => {
            let i = (MIDPOINT - v) as f64 / 127.0;
            Rgb::new(channel(255.0 * i + 100.0), channel(100.0 * i), channel(100.0 * i))
        }
        std::cmp::Ordering::Greater => {
            let i = (v - MIDPOINT) as f64 / 128.0;
            Rgb::new(
                channel(100.0 * (1.0 - i)),
                channel(255.0 * i + 100.0),
                channel(100.0 * (1.0 - i)),
            )
        }
        std::cmp::Ordering::Equal => Rgb::new(128, 128, 128),
    }
}

impl ColorMapper for Gradient {
    fn name(&self) -> &str {
        match self {
            Self::Vegetation => "CUSTOM_VEGETATION",
            Self::Diverging => "CUSTOM_DIVERGING",
        }
    }

    fn apply(&self, gray: &Array2<u8>) -> std::result::Result<Vec<u8>, ColormapError> {
        let mut lut = [Rgb::new(0, 0, 0); 256];
        for (v, slot) in lut.iter_mut().enumerate() {
            *slot = self.color(v as u8);
        }
        Ok(apply_lut(&lut, gray))
    }
}

// ============ Normalization ============

/// Percentile with linear interpolation between closest ranks.
fn percentile(sorted: &[f32], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] as f64 + (sorted[hi] as f64 - sorted[lo] as f64) * frac
}

/// Clip to the 2nd/98th percentile and rescale to `0..=255` (truncating).
///
/// Percentiles are taken over finite values; non-finite pixels and
/// rasters with zero percentile range map to 0.
pub fn percentile_stretch(raster: &Array2<f32>) -> Array2<u8> {
    let mut finite: Vec<f32> = raster.iter().copied().filter(|v| v.is_finite()).collect();
    finite.sort_by(|a, b| a.total_cmp(b));

    let lower = percentile(&finite, LOWER_PERCENTILE);
    let upper = percentile(&finite, UPPER_PERCENTILE);
    let range = upper - lower;

    raster.mapv(|v| {
        if !v.is_finite() || range <= 0.0 {
            return 0;
        }
        let clipped = (v as f64).clamp(lower, upper);
        ((clipped - lower) / range * 255.0) as u8
    })
}

/// Map `[-absmax, absmax]` onto `0..=255` so zero lands on the midpoint.
///
/// `absmax` is the raster's own largest magnitude, so two rasters get
/// different scales. An all-zero raster maps entirely to [`MIDPOINT`].
pub fn normalize_difference(raster: &Array2<f32>) -> Array2<u8> {
    let abs_max = raster
        .iter()
        .filter(|v| v.is_finite())
        .fold(0.0f64, |acc, &v| acc.max((v as f64).abs()));

    raster.mapv(|v| {
        if !v.is_finite() || abs_max == 0.0 {
            return MIDPOINT;
        }
        ((v as f64 + abs_max) / (2.0 * abs_max) * 255.0) as u8
    })
}

// ============ Encoder ============

/// PNG bytes plus the name of the palette that produced them.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub colormap: String,
    pub width: u32,
    pub height: u32,
}

/// Turns index rasters into PNG images.
pub struct Encoder {
    magnitude_chain: Vec<Box<dyn ColorMapper>>,
    difference_chain: Vec<Box<dyn ColorMapper>>,
}

impl Encoder {
    /// Build chains from explicit mappers; the synthesized gradient is
    /// always appended last.
    pub fn new(
        mut magnitude_chain: Vec<Box<dyn ColorMapper>>,
        mut difference_chain: Vec<Box<dyn ColorMapper>>,
    ) -> Self {
        magnitude_chain.push(Box::new(Gradient::Vegetation));
        difference_chain.push(Box::new(Gradient::Diverging));
        Self {
            magnitude_chain,
            difference_chain,
        }
    }

    pub fn from_config(cfg: &RenderConfig) -> Self {
        let named = |names: &[String]| -> Vec<Box<dyn ColorMapper>> {
            names
                .iter()
                .map(|n| Box::new(NamedPalette::new(n.clone())) as Box<dyn ColorMapper>)
                .collect()
        };
        Self::new(
            named(&cfg.magnitude_palettes),
            named(&cfg.difference_palettes),
        )
    }

    /// Normalize, color and PNG-encode a raster.
    pub fn encode(&self, raster: &Array2<f32>, mode: EncodeMode) -> Result<EncodedImage> {
        let (gray, chain) = match mode {
            EncodeMode::Magnitude => (percentile_stretch(raster), &self.magnitude_chain),
            EncodeMode::Difference => (normalize_difference(raster), &self.difference_chain),
        };

        let (rgb, colormap) = colorize(&gray, chain, mode);
        let (height, width) = gray.dim();
        let bytes = encode_png(&rgb, width as u32, height as u32)?;

        log::debug!(
            "encoded {} raster {}x{} with {} ({} bytes)",
            mode.as_str(),
            width,
            height,
            colormap,
            bytes.len()
        );

        Ok(EncodedImage {
            bytes,
            colormap,
            width: width as u32,
            height: height as u32,
        })
    }
}

fn colorize(gray: &Array2<u8>, chain: &[Box<dyn ColorMapper>], mode: EncodeMode) -> (Vec<u8>, String) {
    for mapper in chain {
        match mapper.apply(gray) {
            Ok(rgb) => return (rgb, mapper.name().to_string()),
            Err(e) => log::warn!("colormap {} failed: {}", mapper.name(), e),
        }
    }
    // Chains end in a gradient, so this is not reached in practice.
    let gradient = Gradient::for_mode(mode);
    let rgb = gray
        .iter()
        .flat_map(|&v| {
            let c = gradient.color(v);
            [c.r, c.g, c.b]
        })
        .collect();
    (rgb, gradient.name().to_string())
}

fn encode_png(rgb: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    if width == 0 || height == 0 {
        return Err(AnalysisError::Encode(format!(
            "cannot encode an empty {}x{} image",
            width, height
        )));
    }

    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, width, height);
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder
            .write_header()
            .map_err(|e| AnalysisError::Encode(e.to_string()))?;
        writer
            .write_image_data(rgb)
            .map_err(|e| AnalysisError::Encode(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| AnalysisError::Encode(e.to_string()))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    struct Broken;

    impl ColorMapper for Broken {
        fn name(&self) -> &str {
            "BROKEN"
        }
        fn apply(&self, _gray: &Array2<u8>) -> std::result::Result<Vec<u8>, ColormapError> {
            Err(ColormapError("unsupported".into()))
        }
    }

    fn decode_png(bytes: &[u8]) -> (u32, u32, Vec<u8>) {
        let decoder = png::Decoder::new(bytes);
        let mut reader = decoder.read_info().unwrap();
        let mut buf = vec![0; reader.output_buffer_size()];
        let info = reader.next_frame(&mut buf).unwrap();
        buf.truncate(info.buffer_size());
        (info.width, info.height, buf)
    }

    #[test]
    fn test_difference_midpoint_is_per_raster() {
        // min -0.4, max 0.6: zero maps to the middle of the scale.
        let diff = array![[-0.4f32, 0.0], [0.6, 0.3]];
        let n = normalize_difference(&diff);
        assert_eq!(n[[0, 1]], MIDPOINT);
        assert_eq!(n[[1, 0]], 255);
        assert_eq!(n[[0, 0]], 42);

        // A raster with a smaller range rescales: 0.3 is now the top.
        let narrower = array![[-0.1f32, 0.0], [0.3, 0.15]];
        let m = normalize_difference(&narrower);
        assert_eq!(m[[0, 1]], MIDPOINT);
        assert_eq!(m[[1, 0]], 255);
        assert_ne!(n[[1, 1]], m[[1, 0]]);
    }

    #[test]
    fn test_difference_all_zero_is_midpoint() {
        let n = normalize_difference(&Array2::zeros((2, 3)));
        assert!(n.iter().all(|&v| v == MIDPOINT));
    }

    #[test]
    fn test_percentile_stretch_clips_outliers() {
        // 100 values 0..99 plus one extreme outlier.
        let mut values: Vec<f32> = (0..100).map(|v| v as f32 / 100.0).collect();
        values.push(50.0);
        let raster = Array2::from_shape_vec((1, values.len()), values).unwrap();
        let s = percentile_stretch(&raster);
        assert_eq!(s[[0, 0]], 0);
        assert_eq!(s[[0, 100]], 255);
        // The outlier does not compress the rest of the range.
        assert!(s[[0, 50]] > 100 && s[[0, 50]] < 160);
    }

    #[test]
    fn test_percentile_stretch_constant_raster() {
        let s = percentile_stretch(&Array2::from_elem((3, 3), 0.42));
        assert!(s.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_percentile_interpolates() {
        let sorted = [0.0f32, 10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&sorted, 50.0), 20.0);
        assert!((percentile(&sorted, 2.0) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_named_palette_endpoints() {
        let gray = array![[0u8, 255]];
        let rgb = NamedPalette::new("JET").apply(&gray).unwrap();
        assert_eq!(&rgb[..3], &[0, 0, 128]);
        assert_eq!(&rgb[3..], &[128, 0, 0]);
        let lower = NamedPalette::new("summer").apply(&gray).unwrap();
        assert_eq!(&lower[..3], &[0, 128, 102]);
    }

    #[test]
    fn test_unknown_palette_fails() {
        assert!(NamedPalette::new("VIRIDIS").apply(&array![[1u8]]).is_err());
    }

    #[test]
    fn test_encoder_falls_through_to_first_working_palette() {
        let enc = Encoder::new(
            vec![Box::new(Broken), Box::new(NamedPalette::new("NOPE")), Box::new(NamedPalette::new("HOT"))],
            vec![],
        );
        let img = enc.encode(&array![[0.1f32, 0.5], [0.7, 0.9]], EncodeMode::Magnitude).unwrap();
        assert_eq!(img.colormap, "HOT");
        assert_eq!((img.width, img.height), (2, 2));
        assert_eq!(&img.bytes[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn test_encoder_uses_gradient_when_every_palette_fails() {
        let enc = Encoder::new(vec![Box::new(Broken)], vec![Box::new(Broken)]);
        let raster = array![[-0.5f32, 0.0, 0.5]];

        let diff = enc.encode(&raster, EncodeMode::Difference).unwrap();
        assert_eq!(diff.colormap, "CUSTOM_DIVERGING");
        let (w, h, pixels) = decode_png(&diff.bytes);
        assert_eq!((w, h), (3, 1));
        // loss is red, no change gray, gain green
        assert_eq!(&pixels[0..3], &[255, 100, 100]);
        assert_eq!(&pixels[3..6], &[128, 128, 128]);
        assert_eq!(&pixels[6..9], &[0, 255, 0]);

        let mag = enc.encode(&raster, EncodeMode::Magnitude).unwrap();
        assert_eq!(mag.colormap, "CUSTOM_VEGETATION");
    }

    #[test]
    fn test_vegetation_gradient_stops() {
        assert_eq!(vegetation_color(0), Rgb::new(150, 50, 50));
        assert_eq!(vegetation_color(255), Rgb::new(0, 255, 0));
        // Just past 0.7 the green branch starts.
        let c = vegetation_color(180);
        assert!(c.g >= 200 && c.r < 50);
    }

    #[test]
    fn test_default_config_chain() {
        let enc = Encoder::from_config(&RenderConfig::default());
        let img = enc.encode(&array![[0.2f32, 0.4]], EncodeMode::Magnitude).unwrap();
        assert_eq!(img.colormap, "SUMMER");
        let img = enc.encode(&array![[-0.2f32, 0.4]], EncodeMode::Difference).unwrap();
        assert_eq!(img.colormap, "JET");
    }

    #[test]
    fn test_empty_raster_is_encode_error() {
        let enc = Encoder::from_config(&RenderConfig::default());
        let err = enc.encode(&Array2::zeros((0, 0)), EncodeMode::Magnitude).unwrap_err();
        assert!(matches!(err, AnalysisError::Encode(_)));
    }
}

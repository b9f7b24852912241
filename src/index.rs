//! Vegetation index computation and differencing.
//!
//! Raw band values are integer surface reflectance scaled by
//! [`REFLECTANCE_SCALE`]. The index is the normalized difference
//! `(nir - red) / (nir + red + ε)`, clipped to `[-1, 1]`; every raster the
//! rest of the pipeline consumes satisfies that bound.

use ndarray::{Array2, Zip};

use crate::error::{AnalysisError, Result};
use crate::models::RasterStats;

/// Multiplier converting raw sensor integers into reflectance.
pub const REFLECTANCE_SCALE: f32 = 0.0001;

/// Guards the denominator when both bands are zero.
pub const EPSILON: f32 = 1e-10;

/// Single-band vegetation index, or a difference of two.
pub type IndexRaster = Array2<f32>;

fn check_shapes(a: &Array2<f32>, b: &Array2<f32>) -> Result<()> {
    if a.dim() != b.dim() {
        return Err(AnalysisError::ShapeMismatch {
            left: a.dim(),
            right: b.dim(),
        });
    }
    Ok(())
}

/// Compute the clipped normalized-difference index from raw red and NIR bands.
pub fn compute_index(red: &Array2<f32>, nir: &Array2<f32>) -> Result<IndexRaster> {
    check_shapes(red, nir)?;

    let index = Zip::from(red).and(nir).map_collect(|&r, &n| {
        let r = r * REFLECTANCE_SCALE;
        let n = n * REFLECTANCE_SCALE;
        ((n - r) / (n + r + EPSILON)).clamp(-1.0, 1.0)
    });

    Ok(index)
}

/// Signed change `late - early`: positive is a gain, negative a loss.
pub fn difference(early: &IndexRaster, late: &IndexRaster) -> Result<IndexRaster> {
    check_shapes(early, late)?;
    Ok(late - early)
}

/// Min, max, mean and population standard deviation over finite values.
///
/// An empty or all-NaN raster yields all zeros.
pub fn statistics(raster: &Array2<f32>) -> RasterStats {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut sum = 0.0f64;
    let mut count = 0usize;

    for &v in raster.iter().filter(|v| v.is_finite()) {
        let v = v as f64;
        min = min.min(v);
        max = max.max(v);
        sum += v;
        count += 1;
    }

    if count == 0 {
        return RasterStats {
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            std: 0.0,
        };
    }

    let mean = sum / count as f64;
    let var = raster
        .iter()
        .filter(|v| v.is_finite())
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / count as f64;

    RasterStats {
        min,
        max,
        mean,
        std: var.sqrt(),
    }
}

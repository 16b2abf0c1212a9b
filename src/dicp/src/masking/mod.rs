//! Mask-weighted preprocessing.
//!
//! Turns a learned confidence mask into per-point ICP weights:
//! 1. Look up each point in the mask (nearest pixel or nearest polar bin)
//! 2. Zero points outside the mask, beyond the range limit, or below threshold
//! 3. Optionally binarize surviving weights (inference)
//!
//! The pixel each point read from is kept so that dL/dw can be scattered back
//! onto the mask with [`scatter_gradient`].

pub mod detector;
pub mod grid;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::point_set::{PointSet, WeightStats};

pub use detector::{fft_threshold_mask, polar_to_cartesian, DEFAULT_FFT_FACTOR};
pub use grid::ConfidenceMask;

/// Default Cartesian mask resolution in metres per pixel.
pub const DEFAULT_CARTESIAN_RESOLUTION: f64 = 0.2384;

/// Default Cartesian mask width in pixels.
pub const DEFAULT_CARTESIAN_WIDTH: usize = 640;

/// Default polar range bin width in metres.
pub const DEFAULT_POLAR_RESOLUTION: f64 = 0.0596;

/// Mask substituted for the learned one in baseline runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MaskOverride {
    /// Every point inside the mask extent gets weight 1.
    Ones,

    /// An externally supplied mask (e.g. a classical detector's output).
    External { mask: ConfidenceMask },
}

/// How mask values become point weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskingConfig {
    /// Weights strictly below this become 0.
    pub threshold: f64,

    /// Surviving non-zero weights become 1.
    pub binary: bool,

    /// Points farther than this from the sensor get weight 0.
    pub range_limit: Option<f64>,

    /// Replace the learned mask.
    #[serde(rename = "override")]
    pub mask_override: Option<MaskOverride>,
}

impl Default for MaskingConfig {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            binary: false,
            range_limit: None,
            mask_override: None,
        }
    }
}

/// Weighted points together with where each weight came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaskedPointSet {
    pub point_set: PointSet,

    /// Mask pixel each point's weight was read from; `None` when the point
    /// was gated out or thresholded away.
    pub pixel_indices: Vec<Option<(usize, usize)>>,

    /// Shape of the mask the indices refer to.
    pub mask_shape: (usize, usize),

    /// Whether an override replaced the learned mask.
    pub overridden: bool,

    pub stats: WeightStats,
}

/// Anything that assigns confidence weights to a point set.
pub trait PointWeighter {
    fn weigh(&self, points: &PointSet) -> Result<MaskedPointSet>;
}

/// A fixed mask plus the rules for applying it.
#[derive(Debug, Clone)]
pub struct MaskWeighter {
    pub mask: ConfidenceMask,
    pub config: MaskingConfig,
}

impl PointWeighter for MaskWeighter {
    fn weigh(&self, points: &PointSet) -> Result<MaskedPointSet> {
        apply_mask(points, &self.mask, &self.config)
    }
}

/// Weight each point by the mask value under it.
///
/// Existing weights on `points` are replaced; normals are kept.
///
/// # Arguments
/// * `points` - Raw scan points in the sensor frame
/// * `mask` - Learned confidence mask
/// * `config` - Threshold, binarization, range gate and override
pub fn apply_mask(
    points: &PointSet,
    mask: &ConfidenceMask,
    config: &MaskingConfig,
) -> Result<MaskedPointSet> {
    if !(config.threshold.is_finite() && config.threshold >= 0.0) {
        return Err(Error::InvalidMask(format!(
            "threshold must be non-negative, got {}",
            config.threshold
        )));
    }

    let ones;
    let source = match &config.mask_override {
        None => mask,
        Some(MaskOverride::Ones) => {
            ones = mask.ones_like();
            &ones
        }
        Some(MaskOverride::External { mask }) => mask,
    };

    let mut weights = Vec::with_capacity(points.len());
    let mut pixel_indices = Vec::with_capacity(points.len());
    for p in points.points() {
        let in_range = config
            .range_limit
            .map_or(true, |limit| p.x.hypot(p.y) <= limit);
        let hit = source
            .lookup(p)
            .filter(|&(_, value)| in_range && value > 0.0 && value >= config.threshold);

        match hit {
            Some((pixel, value)) => {
                weights.push(if config.binary { 1.0 } else { value });
                pixel_indices.push(Some(pixel));
            }
            None => {
                weights.push(0.0);
                pixel_indices.push(None);
            }
        }
    }

    let stats = WeightStats::from_weights(&weights);
    let point_set = points.clone().with_weights(weights)?;

    Ok(MaskedPointSet {
        point_set,
        pixel_indices,
        mask_shape: source.shape(),
        overridden: config.mask_override.is_some(),
        stats,
    })
}

/// Accumulate per-point gradients onto mask pixels.
///
/// Points with no pixel contribute nothing. Several points reading the same
/// pixel add up.
///
/// # Errors
/// If the gradient and index lengths differ or an index is out of `shape`.
pub fn scatter_gradient(
    point_grads: &[f64],
    pixel_indices: &[Option<(usize, usize)>],
    shape: (usize, usize),
) -> Result<DMatrix<f64>> {
    if point_grads.len() != pixel_indices.len() {
        return Err(Error::InvalidMask(format!(
            "{} gradients for {} pixel indices",
            point_grads.len(),
            pixel_indices.len()
        )));
    }

    let mut out = DMatrix::zeros(shape.0, shape.1);
    for (&g, pixel) in point_grads.iter().zip(pixel_indices) {
        let Some((r, c)) = *pixel else { continue };
        if r >= shape.0 || c >= shape.1 {
            return Err(Error::InvalidMask(format!(
                "pixel ({r}, {c}) outside a {}x{} mask",
                shape.0, shape.1
            )));
        }
        out[(r, c)] += g;
    }
    Ok(out)
}

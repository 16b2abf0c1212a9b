//! Weighted point sets.
//!
//! A [`PointSet`] is the unit the aligner consumes: 3-D points (2-D radar
//! returns use z = 0), optional unit normals, and a confidence weight in
//! [0, 1] per point. Zero-weight points are treated as absent by every
//! downstream stage.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::correspondence::search::estimate_normals;
use crate::error::{Error, Result};

/// Ordered set of weighted points with optional normals.
///
/// Deserialization goes through the same checks as [`PointSet::with_weights`]
/// and [`PointSet::with_normals`]; a missing `weights` field means all ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPointSet")]
pub struct PointSet {
    points: Vec<Vector3<f64>>,
    normals: Option<Vec<Vector3<f64>>>,
    weights: Vec<f64>,
}

#[derive(Deserialize)]
struct RawPointSet {
    points: Vec<Vector3<f64>>,
    #[serde(default)]
    normals: Option<Vec<Vector3<f64>>>,
    #[serde(default)]
    weights: Option<Vec<f64>>,
}

impl TryFrom<RawPointSet> for PointSet {
    type Error = Error;

    fn try_from(raw: RawPointSet) -> Result<Self> {
        let mut set = PointSet::new(raw.points);
        set.check_finite()?;
        if let Some(weights) = raw.weights {
            set = set.with_weights(weights)?;
        }
        if let Some(normals) = raw.normals {
            set = set.with_normals(normals)?;
        }
        Ok(set)
    }
}

impl PointSet {
    /// Create a point set with all weights set to 1.
    pub fn new(points: Vec<Vector3<f64>>) -> Self {
        let weights = vec![1.0; points.len()];
        Self {
            points,
            normals: None,
            weights,
        }
    }

    /// Create from raw `[x, y, z]` triples.
    pub fn from_xyz(points: &[[f64; 3]]) -> Self {
        Self::new(points.iter().map(|p| Vector3::new(p[0], p[1], p[2])).collect())
    }

    /// Create from planar `[x, y]` pairs (z = 0).
    pub fn from_xy(points: &[[f64; 2]]) -> Self {
        Self::new(points.iter().map(|p| Vector3::new(p[0], p[1], 0.0)).collect())
    }

    /// Replace the weights.
    ///
    /// # Errors
    /// If the length differs from the point count or any weight is outside [0, 1].
    pub fn with_weights(mut self, weights: Vec<f64>) -> Result<Self> {
        if weights.len() != self.points.len() {
            return Err(Error::InvalidPointSet(format!(
                "{} weights for {} points",
                weights.len(),
                self.points.len()
            )));
        }
        if let Some((i, w)) = weights
            .iter()
            .enumerate()
            .find(|(_, w)| !w.is_finite() || **w < 0.0 || **w > 1.0)
        {
            return Err(Error::InvalidPointSet(format!(
                "weight {w} at index {i} is outside [0, 1]"
            )));
        }
        self.weights = weights;
        Ok(self)
    }

    /// Attach per-point normals. Normals are re-normalized to unit length.
    ///
    /// # Errors
    /// If the length differs from the point count or a normal is zero/non-finite.
    pub fn with_normals(mut self, normals: Vec<Vector3<f64>>) -> Result<Self> {
        if normals.len() != self.points.len() {
            return Err(Error::InvalidPointSet(format!(
                "{} normals for {} points",
                normals.len(),
                self.points.len()
            )));
        }
        let mut unit = Vec::with_capacity(normals.len());
        for (i, n) in normals.iter().enumerate() {
            let norm = n.norm();
            if !norm.is_finite() || norm < 1e-12 {
                return Err(Error::InvalidPointSet(format!(
                    "normal at index {i} is degenerate"
                )));
            }
            unit.push(n / norm);
        }
        self.normals = Some(unit);
        Ok(self)
    }

    /// Estimate normals from the `k` nearest neighbours of every point.
    pub fn with_estimated_normals(self, k: usize) -> Result<Self> {
        let normals = estimate_normals(&self.points, k)?;
        self.with_normals(normals)
    }

    /// Reject non-finite coordinates.
    ///
    /// # Errors
    /// `Error::InvalidPointSet` naming the first offending index.
    pub fn check_finite(&self) -> Result<()> {
        match self.points.iter().position(|p| p.iter().any(|x| !x.is_finite())) {
            Some(i) => Err(Error::InvalidPointSet(format!(
                "point at index {i} is not finite"
            ))),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Vector3<f64>] {
        &self.points
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn normals(&self) -> Option<&[Vector3<f64>]> {
        self.normals.as_deref()
    }

    pub fn has_normals(&self) -> bool {
        self.normals.is_some()
    }

    /// Indices of points with non-zero weight.
    pub fn active_indices(&self) -> Vec<usize> {
        self.weights
            .iter()
            .enumerate()
            .filter(|(_, &w)| w > 0.0)
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of points with non-zero weight.
    pub fn num_active(&self) -> usize {
        self.weights.iter().filter(|&&w| w > 0.0).count()
    }

    /// Weight statistics for training diagnostics.
    pub fn weight_stats(&self) -> WeightStats {
        WeightStats::from_weights(&self.weights)
    }
}

/// Summary of a weight vector.
///
/// `min`, `max` and `mean` are taken over non-zero weights and are 0 when
/// every weight is zero. `mean_all` averages over every point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightStats {
    pub num_points: usize,
    pub num_nonzero: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub mean_all: f64,
}

impl WeightStats {
    pub fn from_weights(weights: &[f64]) -> Self {
        let nonzero: Vec<f64> = weights.iter().copied().filter(|&w| w > 0.0).collect();
        let sum: f64 = nonzero.iter().sum();

        let (min, max, mean) = if nonzero.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            (
                nonzero.iter().copied().fold(f64::INFINITY, f64::min),
                nonzero.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                sum / nonzero.len() as f64,
            )
        };

        Self {
            num_points: weights.len(),
            num_nonzero: nonzero.len(),
            min,
            max,
            mean,
            mean_all: if weights.is_empty() {
                0.0
            } else {
                sum / weights.len() as f64
            },
        }
    }
}

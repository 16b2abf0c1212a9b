//! Correspondence search between a weighted source and a target.
//!
//! For every active source point (weight > 0) the current estimate is applied
//! and the nearest active target point is looked up. Matches farther than the
//! cutoff are kept but flagged invalid so that counts stay observable.
//!
//! Search is a discrete choice: it runs on `f64` values and never carries
//! derivative information.
//!
//! # Example
//!
//! ```ignore
//! let index = TargetIndex::build(&target, 64);
//! let set = find_correspondences(&source, &index, &pose, Some(2.0));
//! println!("fitness={:.3} rmse={:.3}", set.fitness(), set.inlier_rmse());
//! ```

#[cfg(feature = "cuda")]
mod gpu;
#[cfg(feature = "cuda")]
mod kernels;
pub mod search;

#[cfg(feature = "cuda")]
pub use gpu::{search_batch_gpu, GpuNearestNeighbor};
pub use search::{estimate_normals, Neighbor, SearchBackend, TargetIndex};

use nalgebra::{Matrix4, Vector3};
use rayon::prelude::*;
use serde::Serialize;

use crate::point_set::PointSet;
use crate::se3;

/// Match of one active source point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Correspondence {
    /// Index into the source point set.
    pub source_index: usize,
    /// Index into the target point set, `None` if the target has no active points.
    pub target_index: Option<usize>,
    /// Squared distance between the transformed source point and the match.
    pub distance_sq: f64,
    /// Whether the match is within the cutoff.
    pub valid: bool,
}

/// Correspondences of all active source points for one estimate.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorrespondenceSet {
    correspondences: Vec<Correspondence>,
    num_points: usize,
}

impl CorrespondenceSet {
    /// A set where no active point found a match.
    pub(crate) fn unmatched(source: &PointSet, active: Vec<usize>) -> Self {
        let correspondences = active
            .into_iter()
            .map(|source_index| Correspondence {
                source_index,
                target_index: None,
                distance_sq: f64::INFINITY,
                valid: false,
            })
            .collect();
        Self {
            correspondences,
            num_points: source.len(),
        }
    }

    /// Assemble from per-query neighbours, applying the cutoff.
    pub(crate) fn from_neighbors(
        source: &PointSet,
        active: &[usize],
        neighbors: impl Iterator<Item = Option<Neighbor>>,
        cutoff: Option<f64>,
    ) -> Self {
        let cutoff_sq = cutoff.map(|c| c * c);
        let correspondences = active
            .iter()
            .zip(neighbors)
            .map(|(&source_index, nn)| match nn {
                Some(nn) => Correspondence {
                    source_index,
                    target_index: Some(nn.index),
                    distance_sq: nn.distance_sq,
                    valid: cutoff_sq.map_or(true, |c| nn.distance_sq <= c),
                },
                None => Correspondence {
                    source_index,
                    target_index: None,
                    distance_sq: f64::INFINITY,
                    valid: false,
                },
            })
            .collect();
        Self {
            correspondences,
            num_points: source.len(),
        }
    }

    /// All correspondences, valid or not, in source order.
    pub fn iter(&self) -> impl Iterator<Item = &Correspondence> {
        self.correspondences.iter()
    }

    /// Valid correspondences only.
    pub fn valid(&self) -> impl Iterator<Item = &Correspondence> {
        self.correspondences.iter().filter(|c| c.valid)
    }

    pub fn num_valid(&self) -> usize {
        self.valid().count()
    }

    /// Active source points with no match or a match beyond the cutoff.
    pub fn num_invalid(&self) -> usize {
        self.num_active() - self.num_valid()
    }

    /// Source points that took part in the search.
    pub fn num_active(&self) -> usize {
        self.correspondences.len()
    }

    /// Source points skipped because their weight is zero.
    pub fn num_inactive(&self) -> usize {
        self.num_points - self.num_active()
    }

    /// Fraction of active source points with a valid match.
    pub fn fitness(&self) -> f64 {
        if self.correspondences.is_empty() {
            0.0
        } else {
            self.num_valid() as f64 / self.num_active() as f64
        }
    }

    /// Root mean squared distance over valid matches.
    pub fn inlier_rmse(&self) -> f64 {
        let (sum, count) = self
            .valid()
            .fold((0.0, 0usize), |(s, n), c| (s + c.distance_sq, n + 1));
        if count == 0 {
            0.0
        } else {
            (sum / count as f64).sqrt()
        }
    }
}

/// Active source indices and their positions under `pose`.
pub(crate) fn active_queries(
    source: &PointSet,
    pose: &Matrix4<f64>,
) -> (Vec<usize>, Vec<Vector3<f64>>) {
    let active = source.active_indices();
    let transformed = active
        .iter()
        .map(|&i| se3::transform_point(pose, &source.points()[i]))
        .collect();
    (active, transformed)
}

/// Find the nearest target for every active source point under `pose`.
///
/// # Arguments
/// * `source` - Weighted source points
/// * `target` - Search index over the target
/// * `pose` - Current source-to-target estimate
/// * `cutoff` - Maximum match distance, `None` for unlimited
pub fn find_correspondences(
    source: &PointSet,
    target: &TargetIndex,
    pose: &Matrix4<f64>,
    cutoff: Option<f64>,
) -> CorrespondenceSet {
    let (active, transformed) = active_queries(source, pose);
    if target.is_empty() {
        return CorrespondenceSet::unmatched(source, active);
    }

    let neighbors = transformed.iter().map(|p| target.nearest(p));
    CorrespondenceSet::from_neighbors(source, &active, neighbors, cutoff)
}

/// [`find_correspondences`] for every batch element, in parallel.
pub fn search_batch(
    elements: &[(&PointSet, &TargetIndex, Matrix4<f64>)],
    cutoff: Option<f64>,
) -> Vec<CorrespondenceSet> {
    elements
        .par_iter()
        .map(|(source, target, pose)| find_correspondences(source, target, pose, cutoff))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square() -> PointSet {
        PointSet::from_xy(&[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]])
    }

    fn translation(x: f64, y: f64) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m[(0, 3)] = x;
        m[(1, 3)] = y;
        m
    }

    #[test]
    fn test_identity_matches_itself() {
        let target = square();
        let index = TargetIndex::build(&target, 64);
        let set = find_correspondences(&square(), &index, &Matrix4::identity(), None);

        assert_eq!(set.num_active(), 4);
        assert_eq!(set.num_valid(), 4);
        for c in set.iter() {
            assert_eq!(c.target_index, Some(c.source_index));
            assert_eq!(c.distance_sq, 0.0);
        }
        assert_eq!(set.fitness(), 1.0);
        assert_eq!(set.inlier_rmse(), 0.0);
    }

    #[test]
    fn test_pose_is_applied_before_search() {
        let target = square();
        let index = TargetIndex::build(&target, 64);
        let source = PointSet::from_xy(&[[-1.0, 0.0]]);

        let set = find_correspondences(&source, &index, &translation(1.0, 0.0), None);
        let c = set.iter().next().unwrap();
        assert_eq!(c.target_index, Some(0));
        assert_relative_eq!(c.distance_sq, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_cutoff_marks_invalid() {
        let target = square();
        let index = TargetIndex::build(&target, 64);
        let source = PointSet::from_xy(&[[0.1, 0.0], [5.0, 5.0]]);

        let set = find_correspondences(&source, &index, &Matrix4::identity(), Some(1.0));
        assert_eq!(set.num_active(), 2);
        assert_eq!(set.num_valid(), 1);
        assert_eq!(set.num_invalid(), 1);
        assert_relative_eq!(set.fitness(), 0.5);
        assert_relative_eq!(set.inlier_rmse(), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_weight_sources_never_searched() {
        let target = square();
        let index = TargetIndex::build(&target, 64);
        let source = square().with_weights(vec![1.0, 0.0, 0.0, 0.5]).unwrap();

        let set = find_correspondences(&source, &index, &Matrix4::identity(), None);
        assert_eq!(set.num_active(), 2);
        assert_eq!(set.num_inactive(), 2);
        let ids: Vec<usize> = set.iter().map(|c| c.source_index).collect();
        assert_eq!(ids, vec![0, 3]);
    }

    #[test]
    fn test_empty_target_yields_no_matches() {
        let target = square().with_weights(vec![0.0; 4]).unwrap();
        let index = TargetIndex::build(&target, 64);
        let set = find_correspondences(&square(), &index, &Matrix4::identity(), None);

        assert_eq!(set.num_active(), 4);
        assert_eq!(set.num_valid(), 0);
        assert!(set.iter().all(|c| c.target_index.is_none()));
        assert_eq!(set.fitness(), 0.0);
    }

    #[test]
    fn test_search_batch_is_per_element() {
        let target = square();
        let index = TargetIndex::build(&target, 64);
        let a = square();
        let b = square().with_weights(vec![0.0; 4]).unwrap();

        let sets = search_batch(
            &[
                (&a, &index, Matrix4::identity()),
                (&b, &index, Matrix4::identity()),
            ],
            None,
        );
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].num_valid(), 4);
        assert_eq!(sets[1].num_active(), 0);
        assert_eq!(sets[1].fitness(), 0.0);
    }
}

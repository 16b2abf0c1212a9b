//! Nearest-neighbour search over target points.
//!
//! Targets above [`IcpConfig::brute_force_threshold`](crate::IcpConfig) points
//! are indexed with an immutable KD-tree; smaller ones are scanned linearly,
//! which is faster than walking a tree for a few dozen points.
//!
//! Only target points with non-zero weight are indexed. Every index returned
//! by a query refers to the position in the original target [`PointSet`].

use kiddo::immutable::float::kdtree::ImmutableKdTree;
use kiddo::SquaredEuclidean;
use nalgebra::{Matrix2, Matrix3, SymmetricEigen, Vector3};

use crate::error::{ConfigError, Result};
use crate::point_set::PointSet;

/// Bucket size for the KD-tree.
///
/// Radar scans are planar (z = 0 everywhere), so many points share one
/// coordinate. The default bucket of 32 overflows on such input.
const BUCKET_SIZE: usize = 256;

/// Search structure used by a [`TargetIndex`].
pub enum SearchBackend {
    /// KD-tree over the active target points.
    /// Generic args: A=f64 (coordinate type), T=u64 (item/index type), K=3, B=bucket size
    KdTree(ImmutableKdTree<f64, u64, 3, BUCKET_SIZE>),

    /// Linear scan.
    BruteForce,
}

impl std::fmt::Debug for SearchBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchBackend::KdTree(tree) => write!(f, "KdTree(size={})", tree.size()),
            SearchBackend::BruteForce => write!(f, "BruteForce"),
        }
    }
}

/// Result of a nearest-neighbour query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Index into the original target point set.
    pub index: usize,
    /// Squared Euclidean distance to the query.
    pub distance_sq: f64,
}

/// Searchable view of the active points of a target [`PointSet`].
#[derive(Debug)]
pub struct TargetIndex {
    /// Active target points (weight > 0).
    points: Vec<Vector3<f64>>,
    /// Position of each active point in the original target set.
    original: Vec<usize>,
    backend: SearchBackend,
}

impl TargetIndex {
    /// Build a search index over the active points of `target`.
    ///
    /// # Arguments
    /// * `target` - Target point set
    /// * `brute_force_threshold` - Below this many active points, use a linear scan
    pub fn build(target: &PointSet, brute_force_threshold: usize) -> Self {
        let original = target.active_indices();
        let points: Vec<Vector3<f64>> = original.iter().map(|&i| target.points()[i]).collect();

        let backend = if points.is_empty() || points.len() < brute_force_threshold {
            SearchBackend::BruteForce
        } else {
            SearchBackend::KdTree(build_tree(&points))
        };

        Self {
            points,
            original,
            backend,
        }
    }

    /// Nearest active target point to `query`, or `None` if the index is empty.
    pub fn nearest(&self, query: &Vector3<f64>) -> Option<Neighbor> {
        if self.points.is_empty() {
            return None;
        }

        let (local, distance_sq) = match &self.backend {
            SearchBackend::KdTree(tree) => {
                let nn = tree.nearest_one::<SquaredEuclidean>(&[query.x, query.y, query.z]);
                (nn.item as usize, nn.distance)
            }
            SearchBackend::BruteForce => {
                let mut best = (0, f64::INFINITY);
                for (i, p) in self.points.iter().enumerate() {
                    let d = (p - query).norm_squared();
                    if d < best.1 {
                        best = (i, d);
                    }
                }
                best
            }
        };

        Some(Neighbor {
            index: self.original[local],
            distance_sq,
        })
    }

    /// All active target points within `radius` of `query`, nearest first.
    pub fn within(&self, query: &Vector3<f64>, radius: f64) -> Vec<Neighbor> {
        let radius_sq = radius * radius;
        match &self.backend {
            SearchBackend::KdTree(tree) => tree
                .within::<SquaredEuclidean>(&[query.x, query.y, query.z], radius_sq)
                .iter()
                .map(|nn| Neighbor {
                    index: self.original[nn.item as usize],
                    distance_sq: nn.distance,
                })
                .collect(),
            SearchBackend::BruteForce => {
                let mut found: Vec<Neighbor> = self
                    .points
                    .iter()
                    .enumerate()
                    .filter_map(|(i, p)| {
                        let d = (p - query).norm_squared();
                        (d <= radius_sq).then_some(Neighbor {
                            index: self.original[i],
                            distance_sq: d,
                        })
                    })
                    .collect();
                found.sort_by(|a, b| a.distance_sq.total_cmp(&b.distance_sq));
                found
            }
        }
    }

    /// Number of indexed (active) target points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn backend(&self) -> &SearchBackend {
        &self.backend
    }

    /// Flattened `[x0, y0, z0, x1, ...]` active points, for GPU upload.
    pub fn flat_points(&self) -> Vec<f32> {
        self.points
            .iter()
            .flat_map(|p| [p.x as f32, p.y as f32, p.z as f32])
            .collect()
    }

    /// Map a position in the active point list back to the target set.
    pub fn original_index(&self, local: usize) -> usize {
        self.original[local]
    }
}

fn build_tree(points: &[Vector3<f64>]) -> ImmutableKdTree<f64, u64, 3, BUCKET_SIZE> {
    let coords: Vec<[f64; 3]> = points.iter().map(|p| [p.x, p.y, p.z]).collect();
    // Item value is the slice index.
    (&*coords).into()
}

/// Estimate a unit normal for every point from its `k` nearest neighbours.
///
/// The normal is the eigenvector of the smallest eigenvalue of the local
/// covariance. When every point lies in the z = 0 plane the estimate is made
/// in 2-D, giving in-plane line normals (a 3-D estimate would return ±z for
/// every point). Normals are oriented towards the sensor origin.
///
/// # Errors
/// `ConfigError::TooFewNormalNeighbors` if `k < 3`.
pub fn estimate_normals(points: &[Vector3<f64>], k: usize) -> Result<Vec<Vector3<f64>>> {
    if k < 3 {
        return Err(ConfigError::TooFewNormalNeighbors(k).into());
    }
    if points.is_empty() {
        return Ok(Vec::new());
    }

    let planar = points.iter().all(|p| p.z == 0.0);
    let tree = (points.len() > k).then(|| build_tree(points));
    let radius0 = initial_radius(points, k);

    let normals = points
        .iter()
        .map(|query| {
            let neighbors: Vec<Vector3<f64>> = match &tree {
                Some(tree) => k_nearest(tree, points, query, k, radius0),
                None => points.to_vec(),
            };
            let normal = if planar {
                planar_normal(&neighbors)
            } else {
                spatial_normal(&neighbors)
            };
            if normal.dot(query) > 0.0 {
                -normal
            } else {
                normal
            }
        })
        .collect();

    Ok(normals)
}

/// Starting radius for neighbourhood growth: the spacing a uniform spread of
/// points over the bounding box would have, scaled to hold about `k` of them.
fn initial_radius(points: &[Vector3<f64>], k: usize) -> f64 {
    let mut lo = points[0];
    let mut hi = points[0];
    for p in points {
        lo = lo.inf(p);
        hi = hi.sup(p);
    }
    let diagonal = (hi - lo).norm();
    (diagonal * (k as f64 / points.len() as f64).sqrt()).max(1e-6)
}

/// The `k` nearest points, found by doubling a radius query until it holds enough.
fn k_nearest(
    tree: &ImmutableKdTree<f64, u64, 3, BUCKET_SIZE>,
    points: &[Vector3<f64>],
    query: &Vector3<f64>,
    k: usize,
    radius0: f64,
) -> Vec<Vector3<f64>> {
    let q = [query.x, query.y, query.z];
    let mut radius = radius0;
    loop {
        let found = tree.within::<SquaredEuclidean>(&q, radius * radius);
        // Once the radius covers the whole cloud there is nothing left to gain.
        if found.len() >= k || found.len() == points.len() {
            return found
                .iter()
                .take(k)
                .map(|nn| points[nn.item as usize])
                .collect();
        }
        radius *= 2.0;
    }
}

fn spatial_normal(neighbors: &[Vector3<f64>]) -> Vector3<f64> {
    let n = neighbors.len() as f64;
    let mean = neighbors.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;
    let mut cov = Matrix3::zeros();
    for p in neighbors {
        let d = p - mean;
        cov += d * d.transpose();
    }

    let eigen = SymmetricEigen::new(cov);
    let smallest = eigen.eigenvalues.imin();
    let normal: Vector3<f64> = eigen.eigenvectors.column(smallest).into_owned();
    normal.try_normalize(1e-12).unwrap_or_else(Vector3::z)
}

fn planar_normal(neighbors: &[Vector3<f64>]) -> Vector3<f64> {
    let n = neighbors.len() as f64;
    let mean = neighbors.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;
    let mut cov = Matrix2::zeros();
    for p in neighbors {
        let d = (p - mean).xy();
        cov += d * d.transpose();
    }

    let eigen = SymmetricEigen::new(cov);
    let smallest = eigen.eigenvalues.imin();
    let v = eigen.eigenvectors.column(smallest);
    Vector3::new(v[0], v[1], 0.0)
        .try_normalize(1e-12)
        .unwrap_or_else(Vector3::x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn line_points(n: usize) -> PointSet {
        let pts: Vec<[f64; 2]> = (0..n).map(|i| [i as f64, 0.0]).collect();
        PointSet::from_xy(&pts)
    }

    #[test]
    fn test_backend_selection() {
        let small = TargetIndex::build(&line_points(10), 64);
        assert!(matches!(small.backend(), SearchBackend::BruteForce));

        let large = TargetIndex::build(&line_points(100), 64);
        assert!(matches!(large.backend(), SearchBackend::KdTree(_)));
        assert_eq!(large.len(), 100);
    }

    #[test]
    fn test_nearest_agrees_between_backends() {
        let target = line_points(100);
        let tree = TargetIndex::build(&target, 0);
        let scan = TargetIndex::build(&target, usize::MAX);

        for q in [
            Vector3::new(3.2, 0.5, 0.0),
            Vector3::new(-4.0, 1.0, 0.0),
            Vector3::new(57.9, -2.0, 1.0),
        ] {
            let a = tree.nearest(&q).unwrap();
            let b = scan.nearest(&q).unwrap();
            assert_eq!(a.index, b.index);
            assert_relative_eq!(a.distance_sq, b.distance_sq, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_zero_weight_targets_are_not_indexed() {
        let target = PointSet::from_xy(&[[0.0, 0.0], [1.0, 0.0], [5.0, 0.0]])
            .with_weights(vec![1.0, 0.0, 1.0])
            .unwrap();
        let index = TargetIndex::build(&target, 64);
        assert_eq!(index.len(), 2);

        // Closest overall would be index 1, which is inactive.
        let nn = index.nearest(&Vector3::new(1.1, 0.0, 0.0)).unwrap();
        assert_eq!(nn.index, 0);
        assert_relative_eq!(nn.distance_sq, 1.21, epsilon = 1e-12);
    }

    #[test]
    fn test_empty_index() {
        let target = PointSet::from_xy(&[[0.0, 0.0]]).with_weights(vec![0.0]).unwrap();
        let index = TargetIndex::build(&target, 64);
        assert!(index.is_empty());
        assert!(index.nearest(&Vector3::zeros()).is_none());
    }

    #[test]
    fn test_within_sorted() {
        let target = line_points(10);
        for threshold in [0, 64] {
            let index = TargetIndex::build(&target, threshold);
            let found = index.within(&Vector3::new(2.1, 0.0, 0.0), 1.5);
            let ids: Vec<usize> = found.iter().map(|n| n.index).collect();
            assert_eq!(ids, vec![2, 3, 1]);
        }
    }

    #[test]
    fn test_estimate_normals_rejects_small_k() {
        let pts = vec![Vector3::zeros(); 4];
        assert!(estimate_normals(&pts, 2).is_err());
    }

    #[test]
    fn test_planar_normals_of_line() {
        // Horizontal line at y = 2: normals are ±y, oriented towards the origin.
        let pts: Vec<Vector3<f64>> = (0..20)
            .map(|i| Vector3::new(i as f64 * 0.1, 2.0, 0.0))
            .collect();
        let normals = estimate_normals(&pts, 5).unwrap();
        for n in &normals {
            assert_relative_eq!(n.y, -1.0, epsilon = 1e-9);
            assert_relative_eq!(n.x, 0.0, epsilon = 1e-9);
            assert_eq!(n.z, 0.0);
        }
    }

    #[test]
    fn test_spatial_normals_of_tilted_plane() {
        // Plane z = 1 + 0.5x.
        let pts: Vec<Vector3<f64>> = (0..10)
            .flat_map(|i| {
                (0..10).map(move |j| {
                    let x = i as f64 * 0.2;
                    let y = j as f64 * 0.2;
                    Vector3::new(x, y, 1.0 + 0.5 * x)
                })
            })
            .collect();
        let expected = Vector3::new(-0.5, 0.0, 1.0).normalize();
        let normals = estimate_normals(&pts, 8).unwrap();
        for n in &normals {
            assert_relative_eq!(n.dot(&expected).abs(), 1.0, epsilon = 1e-9);
            // Oriented towards the origin.
            assert!(n.z < 0.0);
        }
    }
}

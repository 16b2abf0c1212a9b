//! Test utilities.
//!
//! Deterministic synthetic point clouds and pose helpers for testing
//! alignment with known ground truth. Randomness comes from a 64-bit LCG so
//! the clouds are identical on every platform.

use nalgebra::{Matrix3, Matrix4, Vector3};

use crate::se3;

/// Advance the LCG and return a uniform sample in [0, 1].
pub fn lcg_uniform(state: &mut u64) -> f64 {
    *state = state
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1);
    ((*state >> 33) as f64) / (u32::MAX as f64)
}

/// Points sampled on the perimeter of the unit square in the XY plane.
///
/// Point `k` lies on edge `k % 4` (bottom, right, top, left, in that order)
/// at a random position along the edge.
///
/// # Arguments
/// * `n` - Number of points
/// * `seed` - LCG seed
pub fn make_unit_square_perimeter(n: usize, seed: u64) -> Vec<[f64; 3]> {
    let mut state = seed;
    (0..n)
        .map(|k| {
            let u = lcg_uniform(&mut state);
            match k % 4 {
                0 => [u, 0.0, 0.0],
                1 => [1.0, u, 0.0],
                2 => [1.0 - u, 1.0, 0.0],
                _ => [0.0, 1.0 - u, 0.0],
            }
        })
        .collect()
}

/// Generate a half-cubic point cloud: three orthogonal planes (XY, YZ, ZX)
/// meeting at the origin.
///
/// # Arguments
/// * `length` - Side length of each plane
/// * `interval` - Grid spacing between points
///
/// # Returns
/// Vector of 3D points, `3 * (length/interval + 1)²` points.
pub fn make_half_cubic_pcd(length: f64, interval: f64) -> Vec<[f64; 3]> {
    let num_points_per_line = ((length / interval).round() as usize) + 1;
    let mut points = Vec::with_capacity(3 * num_points_per_line * num_points_per_line);

    for i in 0..num_points_per_line {
        for j in 0..num_points_per_line {
            let u = interval * (j as f64);
            let v = interval * (i as f64);

            // XY plane (z=0)
            points.push([u, v, 0.0]);

            // YZ plane (x=0)
            points.push([0.0, u, v]);

            // ZX plane (y=0)
            points.push([u, 0.0, v]);
        }
    }

    points
}

/// Outward-facing axis normals matching [`make_half_cubic_pcd`] point order.
pub fn half_cubic_normals(length: f64, interval: f64) -> Vec<Vector3<f64>> {
    let num_points_per_line = ((length / interval).round() as usize) + 1;
    (0..num_points_per_line * num_points_per_line)
        .flat_map(|_| [Vector3::z(), Vector3::x(), Vector3::y()])
        .collect()
}

/// Grid on an XY plane with uniform noise of amplitude `noise` added to z.
///
/// # Arguments
/// * `size` - Side length of the square plane
/// * `interval` - Grid spacing between points
/// * `noise` - Maximum absolute z offset
/// * `seed` - LCG seed
pub fn make_noisy_xy_plane(size: f64, interval: f64, noise: f64, seed: u64) -> Vec<[f64; 3]> {
    let num_points = ((size / interval).round() as usize) + 1;
    let mut state = seed;
    let mut points = Vec::with_capacity(num_points * num_points);

    for i in 0..num_points {
        for j in 0..num_points {
            let x = interval * (j as f64);
            let y = interval * (i as f64);
            let z = noise * (2.0 * lcg_uniform(&mut state) - 1.0);
            points.push([x, y, z]);
        }
    }

    points
}

/// Homogeneous transform from a translation and a rotation about Z.
pub fn make_transform(x: f64, y: f64, z: f64, yaw: f64) -> Matrix4<f64> {
    let (s, c) = yaw.sin_cos();
    let rotation = Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0);
    se3::from_parts(&rotation, &Vector3::new(x, y, z))
}

/// Apply a transform to raw points.
pub fn transform_points(transform: &Matrix4<f64>, points: &[[f64; 3]]) -> Vec<[f64; 3]> {
    points
        .iter()
        .map(|p| {
            let q = se3::transform_point(transform, &Vector3::new(p[0], p[1], p[2]));
            [q.x, q.y, q.z]
        })
        .collect()
}

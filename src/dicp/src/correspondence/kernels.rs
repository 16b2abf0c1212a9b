//! GPU kernels for correspondence search using CubeCL.

use cubecl::prelude::*;

/// Brute-force nearest neighbour.
///
/// Each thread handles one query point and scans every target point,
/// writing the index of the closest target and its squared distance.
#[cube(launch_unchecked)]
pub fn nearest_neighbor_kernel<F: Float>(
    queries: &Array<F>,         // [x0, y0, z0, x1, ...] transformed source points
    targets: &Array<F>,         // [x0, y0, z0, x1, ...] active target points
    num_queries: u32,
    num_targets: u32,
    out_index: &mut Array<u32>, // Nearest target per query
    out_dist_sq: &mut Array<F>, // Squared distance to that target
) {
    let idx = ABSOLUTE_POS;

    if idx < num_queries {
        let qbase = idx * 3;
        let qx = queries[qbase];
        let qy = queries[qbase + 1];
        let qz = queries[qbase + 2];

        let mut best_dist = F::new(3.0e38);
        let mut best_idx = 0u32;

        for t in 0..num_targets {
            let tbase = t * 3;
            let dx = targets[tbase] - qx;
            let dy = targets[tbase + 1] - qy;
            let dz = targets[tbase + 2] - qz;
            let d = dx * dx + dy * dy + dz * dz;

            if d < best_dist {
                best_dist = d;
                best_idx = t;
            }
        }

        out_index[idx] = best_idx;
        out_dist_sq[idx] = best_dist;
    }
}

//! GPU-accelerated nearest-neighbour search.
//!
//! Brute force on the device: one thread per query, each scanning the whole
//! target. This beats the KD-tree once a batch holds many thousands of query
//! points against a few thousand targets. Distances are computed in `f32`.

use cubecl::cuda::{CudaDevice, CudaRuntime};
use cubecl::prelude::*;
use nalgebra::Matrix4;

use super::kernels::nearest_neighbor_kernel;
use super::search::TargetIndex;
use super::{active_queries, CorrespondenceSet};
use crate::error::{Error, Result};
use crate::point_set::PointSet;

const BLOCK_SIZE: u32 = 256;

type CudaClient = cubecl::client::ComputeClient<<CudaRuntime as Runtime>::Server>;

/// Device-side brute-force nearest-neighbour search.
pub struct GpuNearestNeighbor {
    client: CudaClient,
}

impl GpuNearestNeighbor {
    /// Create a searcher on CUDA device 0.
    pub fn new() -> Result<Self> {
        let device = CudaDevice::new(0);
        let client = CudaRuntime::client(&device);
        Ok(Self { client })
    }

    /// Nearest target for each query.
    ///
    /// # Arguments
    /// * `queries` - Flattened query points `[x0, y0, z0, ...]`
    /// * `targets` - Flattened target points `[x0, y0, z0, ...]`
    ///
    /// # Returns
    /// `(target index, squared distance)` per query.
    pub fn nearest(&self, queries: &[f32], targets: &[f32]) -> Result<Vec<(u32, f32)>> {
        if queries.len() % 3 != 0 || targets.len() % 3 != 0 {
            return Err(Error::Gpu(format!(
                "flattened point buffers must hold xyz triples (got {} and {})",
                queries.len(),
                targets.len()
            )));
        }
        let num_queries = (queries.len() / 3) as u32;
        let num_targets = (targets.len() / 3) as u32;
        if num_queries == 0 {
            return Ok(Vec::new());
        }
        if num_targets == 0 {
            return Err(Error::Gpu("target buffer is empty".to_string()));
        }

        let queries_gpu = self.client.create(f32::as_bytes(queries));
        let targets_gpu = self.client.create(f32::as_bytes(targets));
        let index_gpu = self
            .client
            .empty(num_queries as usize * std::mem::size_of::<u32>());
        let dist_gpu = self
            .client
            .empty(num_queries as usize * std::mem::size_of::<f32>());

        let cube_count = num_queries.div_ceil(BLOCK_SIZE);
        unsafe {
            nearest_neighbor_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                CubeCount::Static(cube_count, 1, 1),
                CubeDim::new(BLOCK_SIZE, 1, 1),
                ArrayArg::from_raw_parts::<f32>(&queries_gpu, queries.len(), 1),
                ArrayArg::from_raw_parts::<f32>(&targets_gpu, targets.len(), 1),
                ScalarArg::new(num_queries),
                ScalarArg::new(num_targets),
                ArrayArg::from_raw_parts::<u32>(&index_gpu, num_queries as usize, 1),
                ArrayArg::from_raw_parts::<f32>(&dist_gpu, num_queries as usize, 1),
            );
        }

        let index_bytes = self.client.read_one(index_gpu);
        let dist_bytes = self.client.read_one(dist_gpu);
        let indices = u32::from_bytes(&index_bytes);
        let dists = f32::from_bytes(&dist_bytes);

        Ok(indices.iter().copied().zip(dists.iter().copied()).collect())
    }

    /// Correspondences for one source/target pair at `pose`.
    pub fn find_correspondences(
        &self,
        source: &PointSet,
        target: &TargetIndex,
        pose: &Matrix4<f64>,
        cutoff: Option<f64>,
    ) -> Result<CorrespondenceSet> {
        let (active, transformed) = active_queries(source, pose);
        if target.is_empty() || active.is_empty() {
            return Ok(CorrespondenceSet::unmatched(source, active));
        }

        let flat: Vec<f32> = transformed
            .iter()
            .flat_map(|p| [p.x as f32, p.y as f32, p.z as f32])
            .collect();
        let matches = self.nearest(&flat, &target.flat_points())?;

        let neighbors = matches.iter().map(|&(local, dist_sq)| {
            Some(super::search::Neighbor {
                index: target.original_index(local as usize),
                distance_sq: dist_sq as f64,
            })
        });
        Ok(CorrespondenceSet::from_neighbors(
            source, &active, neighbors, cutoff,
        ))
    }
}

/// Correspondences for every batch element, searched on the GPU.
///
/// Elements are launched one after another on the single device client.
pub fn search_batch_gpu(
    gpu: &GpuNearestNeighbor,
    elements: &[(&PointSet, &TargetIndex, Matrix4<f64>)],
    cutoff: Option<f64>,
) -> Result<Vec<CorrespondenceSet>> {
    elements
        .iter()
        .map(|(source, target, pose)| gpu.find_correspondences(source, target, pose, cutoff))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correspondence::find_correspondences;

    #[test]
    #[ignore] // Requires CUDA device
    fn test_gpu_matches_cpu() {
        let target = PointSet::from_xy(
            &(0..500)
                .map(|i| [(i % 25) as f64 * 0.4, (i / 25) as f64 * 0.4])
                .collect::<Vec<_>>(),
        );
        let source = PointSet::from_xy(
            &(0..200)
                .map(|i| [(i % 20) as f64 * 0.37 + 0.05, (i / 20) as f64 * 0.41])
                .collect::<Vec<_>>(),
        );
        let index = TargetIndex::build(&target, 64);
        let pose = Matrix4::identity();

        let gpu = GpuNearestNeighbor::new().unwrap();
        let on_gpu = gpu
            .find_correspondences(&source, &index, &pose, Some(1.0))
            .unwrap();
        let on_cpu = find_correspondences(&source, &index, &pose, Some(1.0));

        assert_eq!(on_gpu.num_valid(), on_cpu.num_valid());
        for (a, b) in on_gpu.iter().zip(on_cpu.iter()) {
            assert_eq!(a.target_index, b.target_index);
        }
    }
}

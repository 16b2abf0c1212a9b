//! Differentiable, batched weighted ICP on SE(3).
//!
//! This library aligns weighted source point sets to target point sets with
//! Iterative Closest Point and returns the sensitivity of every final pose to
//! the per-point weights, so that a learned confidence mask can be trained
//! through the alignment.
//!
//! # Architecture
//!
//! The alignment is split into stages:
//! - Masking: confidence mask → per-point weights (zero weight = absent)
//! - Correspondence: nearest target for each active source point
//! - Normal equations: weighted H = ΣwJᵀJ, g = ΣwJᵀr
//! - Solve: Cholesky with a regularized fallback, T ← exp(δ)·T
//!
//! Every numerical stage is generic over [`IcpScalar`]; running it on dual
//! numbers yields d(pose)/d(weights) in forward mode.
//!
//! # Usage
//!
//! ```ignore
//! use dicp::{apply_mask, Batch, BatchElement, IcpAligner, MaskingConfig};
//! use nalgebra::Matrix4;
//!
//! let aligner = IcpAligner::builder().max_iterations(8).build()?;
//!
//! // Weight the scan by the learned mask
//! let masked = apply_mask(&scan, &mask, &MaskingConfig::default())?;
//!
//! let batch = Batch::new(vec![BatchElement::new(masked.point_set, map, Matrix4::identity())]);
//! let results = aligner.align_differentiable(&batch);
//!
//! // dL/dw, then dL/dmask
//! let dl_dw = results[0].vjp(&dl_dpose);
//! let dl_dmask = dicp::scatter_gradient(dl_dw.as_slice(), &masked.pixel_indices, masked.mask_shape)?;
//! ```

pub mod batch;
pub mod correspondence;
pub mod error;
pub mod icp;
pub mod masking;
pub mod optimization;
pub mod point_set;
pub mod scalar;
pub mod se3;
pub mod test_utils;

pub use batch::{Batch, BatchElement};
pub use correspondence::{
    estimate_normals, find_correspondences, search_batch, Correspondence, CorrespondenceSet,
    SearchBackend, TargetIndex,
};
pub use error::{ConfigError, Error, Result};
pub use masking::{
    apply_mask, fft_threshold_mask, polar_to_cartesian, scatter_gradient, ConfidenceMask,
    MaskOverride, MaskWeighter, MaskedPointSet, MaskingConfig, PointWeighter,
};
pub use optimization::{
    AlignmentDebug, ConvergenceStatus, Dimension, IcpConfig, IcpOptimizer, IcpResult,
    IterationDebug, IterationStrategy, ResidualMode, RobustKernel,
};
pub use point_set::{PointSet, WeightStats};
pub use scalar::IcpScalar;

// High-level API (recommended for most users)
pub use icp::{DifferentiableResult, IcpAligner, IcpAlignerBuilder, PoseLoss, WeightGradient};

// GPU nearest-neighbour search (optional)
#[cfg(feature = "cuda")]
pub use correspondence::{search_batch_gpu, GpuNearestNeighbor};

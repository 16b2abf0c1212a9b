//! Error types for the alignment core.
//!
//! Only construction-time problems are errors. Per-element numerical failures
//! (degenerate systems, missing correspondences) are reported through
//! [`ConvergenceStatus`](crate::optimization::ConvergenceStatus) so that one
//! bad sample never aborts a batch.

use thiserror::Error;

/// Invalid alignment configuration, raised before any computation starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("unknown residual mode '{0}' (expected \"pt2pt\" or \"pt2pl\")")]
    InvalidMode(String),

    #[error("max_iterations must be positive")]
    ZeroIterations,

    #[error("correspondence cutoff must be positive and finite, got {0}")]
    InvalidCutoff(f64),

    #[error("convergence threshold must be non-negative and finite, got {0}")]
    InvalidThreshold(f64),

    #[error("degenerate reciprocal condition threshold must be in [0, 1), got {0}")]
    InvalidConditionThreshold(f64),

    #[error("regularization must be non-negative and finite, got {0}")]
    InvalidRegularization(f64),

    #[error("huber scale must be positive and finite, got {0}")]
    InvalidRobustScale(f64),

    #[error("normal estimation needs at least 3 neighbors, got {0}")]
    TooFewNormalNeighbors(usize),
}

/// Errors returned by the alignment core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid point set: {0}")]
    InvalidPointSet(String),

    #[error("invalid mask: {0}")]
    InvalidMask(String),

    #[error("point-to-plane residuals need target normals ({0})")]
    MissingNormals(String),

    #[error("{what}: expected {expected} entries, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[cfg(feature = "cuda")]
    #[error("gpu error: {0}")]
    Gpu(String),
}

pub type Result<T> = std::result::Result<T, Error>;

//! Type definitions for ICP optimization.

use std::fmt;
use std::str::FromStr;

use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};

use super::debug::AlignmentDebug;
use crate::error::ConfigError;
use crate::scalar::{matrix_value, IcpScalar};

/// Residual used in the least-squares update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResidualMode {
    /// Point-to-point: r = p' - q.
    #[default]
    #[serde(rename = "pt2pt")]
    Pt2Pt,

    /// Point-to-plane: r = nᵀ(p' - q). Needs target normals.
    #[serde(rename = "pt2pl")]
    Pt2Pl,
}

impl FromStr for ResidualMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pt2pt" => Ok(ResidualMode::Pt2Pt),
            "pt2pl" => Ok(ResidualMode::Pt2Pl),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for ResidualMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResidualMode::Pt2Pt => write!(f, "pt2pt"),
            ResidualMode::Pt2Pl => write!(f, "pt2pl"),
        }
    }
}

/// How batch elements decide when to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IterationStrategy {
    /// Every element runs exactly `max_iterations` iterations, so all
    /// elements have the same computation depth.
    #[default]
    FixedIterations,

    /// Each element stops once its update norm drops below
    /// `convergence_threshold`, independently of the others.
    EarlyExit,
}

/// Degrees of freedom solved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Dimension {
    /// Full 6-DOF update.
    #[default]
    Spatial,

    /// Only (x, y, yaw); z, roll and pitch updates are zero.
    Planar,
}

impl Dimension {
    /// Tangent-space indices that are solved for.
    pub fn active_dofs(&self) -> &'static [usize] {
        match self {
            Dimension::Spatial => &[0, 1, 2, 3, 4, 5],
            Dimension::Planar => &[0, 1, 5],
        }
    }
}

/// Robust loss applied to residual norms (IRLS reweighting).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RobustKernel {
    /// Plain least squares.
    #[default]
    None,

    /// Huber loss: quadratic below `scale`, linear above.
    Huber { scale: f64 },
}

/// Configuration for weighted ICP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcpConfig {
    /// Residual type.
    pub mode: ResidualMode,

    /// Maximum number of iterations (exact count under `FixedIterations`).
    pub max_iterations: usize,

    /// Correspondences farther than this are discarded. `None` keeps all.
    pub correspondence_cutoff: Option<f64>,

    /// Update norm below which an element counts as converged.
    pub convergence_threshold: f64,

    /// Batch-uniform or per-element termination.
    pub iteration_strategy: IterationStrategy,

    /// Full 6-DOF or planar update.
    pub dimension: Dimension,

    /// Optional robust kernel.
    pub robust_kernel: RobustKernel,

    /// Relative diagonal loading λ for the fallback solve: H + λ·max(diag H)·I.
    pub regularization: f64,

    /// Reciprocal condition number of H below which the element holds its
    /// estimate as `UnderConstrained`. 0 steps through null spaces with the
    /// regularized solve instead.
    pub degenerate_rcond: f64,

    /// Targets with fewer active points than this are searched linearly.
    pub brute_force_threshold: usize,

    /// Neighbourhood size for normal estimation (point-to-plane only).
    pub normal_neighbors: usize,

    /// Record per-iteration [`AlignmentDebug`] data.
    pub collect_debug: bool,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            mode: ResidualMode::Pt2Pt,
            max_iterations: 8,
            correspondence_cutoff: None,
            convergence_threshold: 1e-6,
            iteration_strategy: IterationStrategy::FixedIterations,
            dimension: Dimension::Spatial,
            robust_kernel: RobustKernel::None,
            regularization: 1e-6,
            degenerate_rcond: 1e-12,
            brute_force_threshold: 64,
            normal_neighbors: 10,
            collect_debug: false,
        }
    }
}

impl IcpConfig {
    /// Check every field before any computation starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if let Some(cutoff) = self.correspondence_cutoff {
            if !cutoff.is_finite() || cutoff <= 0.0 {
                return Err(ConfigError::InvalidCutoff(cutoff));
            }
        }
        if !self.convergence_threshold.is_finite() || self.convergence_threshold < 0.0 {
            return Err(ConfigError::InvalidThreshold(self.convergence_threshold));
        }
        if !self.regularization.is_finite() || self.regularization < 0.0 {
            return Err(ConfigError::InvalidRegularization(self.regularization));
        }
        if !(0.0..1.0).contains(&self.degenerate_rcond) {
            return Err(ConfigError::InvalidConditionThreshold(self.degenerate_rcond));
        }
        if let RobustKernel::Huber { scale } = self.robust_kernel {
            if !scale.is_finite() || scale <= 0.0 {
                return Err(ConfigError::InvalidRobustScale(scale));
            }
        }
        if self.mode == ResidualMode::Pt2Pl && self.normal_neighbors < 3 {
            return Err(ConfigError::TooFewNormalNeighbors(self.normal_neighbors));
        }
        Ok(())
    }

    /// Fewest valid correspondences that constrain every solved DOF.
    pub fn min_constraints(&self) -> usize {
        match (self.mode, self.dimension) {
            (ResidualMode::Pt2Pt, Dimension::Spatial) => 3,
            (ResidualMode::Pt2Pt, Dimension::Planar) => 2,
            (ResidualMode::Pt2Pl, Dimension::Spatial) => 6,
            (ResidualMode::Pt2Pl, Dimension::Planar) => 3,
        }
    }
}

/// Status of ICP convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceStatus {
    /// Update norm fell below the threshold.
    Converged,

    /// Iteration cap reached without convergence.
    MaxIterations,

    /// Too few constraints or a singular system; estimate was held.
    UnderConstrained,

    /// No active source point found a valid match; estimate was held.
    NoValidCorrespondences,

    /// The element's inputs could not be prepared (e.g. normal estimation
    /// failed); the initial guess is returned untouched.
    Failed,
}

impl ConvergenceStatus {
    /// Check if the optimization converged successfully.
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceStatus::Converged)
    }

    /// Check if the result is usable (converged or max iterations).
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            ConvergenceStatus::Converged | ConvergenceStatus::MaxIterations
        )
    }

    /// Whether the element hit a degenerate or empty system.
    pub fn is_degenerate(&self) -> bool {
        !self.is_usable()
    }
}

impl fmt::Display for ConvergenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConvergenceStatus::Converged => "converged",
            ConvergenceStatus::MaxIterations => "max_iterations",
            ConvergenceStatus::UnderConstrained => "under_constrained",
            ConvergenceStatus::NoValidCorrespondences => "no_valid_correspondences",
            ConvergenceStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Result of aligning one batch element.
#[derive(Debug, Clone)]
pub struct IcpResult<T: IcpScalar> {
    /// Final source-to-target transform.
    pub transform: Matrix4<T>,

    /// Convergence status.
    pub status: ConvergenceStatus,

    /// Number of iterations performed.
    pub iterations: usize,

    /// Valid correspondences in the final iteration.
    pub num_valid: usize,

    /// Source points with non-zero weight.
    pub num_active: usize,

    /// Valid / active in the final iteration.
    pub fitness: f64,

    /// RMS distance of valid correspondences in the final iteration.
    pub inlier_rmse: f64,

    /// Per-iteration convergence flags (update norm below threshold).
    pub converged_flags: Vec<bool>,

    /// Iterations whose update came from the regularized solve.
    pub regularized_steps: usize,

    /// Iteration history, when `collect_debug` is set.
    pub debug: Option<AlignmentDebug>,
}

impl<T: IcpScalar> IcpResult<T> {
    /// Create a result indicating no valid correspondences were found.
    pub fn no_correspondences(initial: Matrix4<T>, num_active: usize) -> Self {
        Self {
            transform: initial,
            status: ConvergenceStatus::NoValidCorrespondences,
            iterations: 0,
            num_valid: 0,
            num_active,
            fitness: 0.0,
            inlier_rmse: 0.0,
            converged_flags: Vec::new(),
            regularized_steps: 0,
            debug: None,
        }
    }

    /// Result for an element that could not be aligned at all.
    pub fn failed(initial: Matrix4<T>, num_active: usize) -> Self {
        Self {
            status: ConvergenceStatus::Failed,
            ..Self::no_correspondences(initial, num_active)
        }
    }

    /// Final transform stripped of derivative information.
    pub fn transform_value(&self) -> Matrix4<f64> {
        matrix_value(&self.transform)
    }

    /// Split into a plain `f64` result and the scalar-typed final transform.
    pub fn split_transform(self) -> (IcpResult<f64>, Matrix4<T>) {
        let value = matrix_value(&self.transform);
        let plain = IcpResult {
            transform: value,
            status: self.status,
            iterations: self.iterations,
            num_valid: self.num_valid,
            num_active: self.num_active,
            fitness: self.fitness,
            inlier_rmse: self.inlier_rmse,
            converged_flags: self.converged_flags,
            regularized_steps: self.regularized_steps,
            debug: self.debug,
        };
        (plain, self.transform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = IcpConfig::default();
        assert_eq!(config.mode, ResidualMode::Pt2Pt);
        assert_eq!(config.max_iterations, 8);
        assert_eq!(config.brute_force_threshold, 64);
        assert!(config.correspondence_cutoff.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("pt2pt".parse::<ResidualMode>(), Ok(ResidualMode::Pt2Pt));
        assert_eq!("pt2pl".parse::<ResidualMode>(), Ok(ResidualMode::Pt2Pl));
        assert_eq!(
            "p2p".parse::<ResidualMode>(),
            Err(ConfigError::InvalidMode("p2p".to_string()))
        );
        assert_eq!(ResidualMode::Pt2Pl.to_string(), "pt2pl");
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let bad = [
            IcpConfig {
                max_iterations: 0,
                ..Default::default()
            },
            IcpConfig {
                correspondence_cutoff: Some(0.0),
                ..Default::default()
            },
            IcpConfig {
                correspondence_cutoff: Some(f64::NAN),
                ..Default::default()
            },
            IcpConfig {
                convergence_threshold: -1.0,
                ..Default::default()
            },
            IcpConfig {
                regularization: f64::INFINITY,
                ..Default::default()
            },
            IcpConfig {
                degenerate_rcond: 1.5,
                ..Default::default()
            },
            IcpConfig {
                robust_kernel: RobustKernel::Huber { scale: 0.0 },
                ..Default::default()
            },
            IcpConfig {
                mode: ResidualMode::Pt2Pl,
                normal_neighbors: 2,
                ..Default::default()
            },
        ];
        for config in &bad {
            assert!(config.validate().is_err(), "{config:?} should be rejected");
        }
    }

    #[test]
    fn test_min_constraints() {
        let mut config = IcpConfig::default();
        assert_eq!(config.min_constraints(), 3);
        config.dimension = Dimension::Planar;
        assert_eq!(config.min_constraints(), 2);
        config.mode = ResidualMode::Pt2Pl;
        assert_eq!(config.min_constraints(), 3);
        config.dimension = Dimension::Spatial;
        assert_eq!(config.min_constraints(), 6);
    }

    #[test]
    fn test_config_json() {
        let json = r#"{"mode": "pt2pl", "max_iterations": 12, "robust_kernel": {"type": "huber", "scale": 0.5}}"#;
        let config: IcpConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.mode, ResidualMode::Pt2Pl);
        assert_eq!(config.max_iterations, 12);
        assert_eq!(config.robust_kernel, RobustKernel::Huber { scale: 0.5 });
        // Unspecified fields keep their defaults.
        assert_eq!(config.brute_force_threshold, 64);
    }

    #[test]
    fn test_convergence_status() {
        assert!(ConvergenceStatus::Converged.is_converged());
        assert!(!ConvergenceStatus::MaxIterations.is_converged());

        assert!(ConvergenceStatus::Converged.is_usable());
        assert!(ConvergenceStatus::MaxIterations.is_usable());
        assert!(!ConvergenceStatus::UnderConstrained.is_usable());
        assert!(ConvergenceStatus::NoValidCorrespondences.is_degenerate());
        assert!(ConvergenceStatus::Failed.is_degenerate());
        assert_eq!(ConvergenceStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_no_correspondences_holds_initial() {
        let mut initial = Matrix4::identity();
        initial[(0, 3)] = 2.0;
        let result = IcpResult::<f64>::no_correspondences(initial, 0);
        assert_eq!(result.transform_value(), initial);
        assert_eq!(result.status, ConvergenceStatus::NoValidCorrespondences);
        assert_eq!(result.iterations, 0);

        let failed = IcpResult::<f64>::failed(initial, 5);
        assert_eq!(failed.status, ConvergenceStatus::Failed);
        assert_eq!(failed.transform, initial);
        assert_eq!(failed.num_active, 5);
        assert_eq!(failed.regularized_steps, 0);
    }
}

//! ICP refinement loop.
//!
//! Each iteration:
//! 1. Transform active source points with the current estimate (values only)
//! 2. Find correspondences in the target index
//! 3. Accumulate the weighted normal equations (generic scalar)
//! 4. Solve δ = -H⁻¹g and apply T ← exp(δ)·T, then re-orthonormalize
//! 5. Record convergence and decide whether to continue
//!
//! A system with a null space on the solved degrees of freedom (collinear
//! points, or a planar scan solved in 6-DOF) stops the element with
//! `UnderConstrained` and the estimate reached so far.
//!
//! The loop is generic over [`IcpScalar`]. Running it on dual numbers seeded
//! on the source weights yields d(final transform)/d(weights) through every
//! iteration; index selection, cutoff gating and convergence tests are
//! discrete and use plain values.

use nalgebra::Matrix4;
use tracing::{debug, warn};

use super::debug::{AlignmentDebug, IterationDebug};
use super::normal_equations::accumulate;
use super::solver::solve_step;
use super::types::{ConvergenceStatus, IcpConfig, IcpResult, IterationStrategy, ResidualMode};
use crate::correspondence::{find_correspondences, CorrespondenceSet, TargetIndex};
use crate::error::{Error, Result};
use crate::point_set::PointSet;
use crate::scalar::{lift_matrix, matrix_value, IcpScalar};
use crate::se3;

/// Weighted ICP optimizer.
#[derive(Debug, Clone)]
pub struct IcpOptimizer {
    config: IcpConfig,
}

impl IcpOptimizer {
    /// Create a new optimizer, validating the configuration.
    pub fn new(config: IcpConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Create a new optimizer with default configuration.
    pub fn with_defaults() -> Self {
        Self {
            config: IcpConfig::default(),
        }
    }

    /// Get the current configuration.
    pub fn config(&self) -> &IcpConfig {
        &self.config
    }

    /// Align a source to a target using the source's own weights.
    pub fn align(
        &self,
        source: &PointSet,
        target: &PointSet,
        index: &TargetIndex,
        initial_guess: &Matrix4<f64>,
    ) -> Result<IcpResult<f64>> {
        self.align_weighted(source, source.weights(), target, index, initial_guess, 0)
    }

    /// Align a source to a target with weights in the scalar type `T`.
    ///
    /// `weights` must hold one entry per source point and carry the same
    /// values as `source.weights()`; the point set decides which points are
    /// active, `weights` is what flows into the normal equations.
    ///
    /// # Arguments
    /// * `source` - Source point set
    /// * `weights` - Per-point weights in the scalar type
    /// * `target` - Target point set (needs normals for point-to-plane)
    /// * `index` - Search index built over `target`
    /// * `initial_guess` - Initial source-to-target transform
    /// * `element` - Position in the batch, for logging
    ///
    /// # Errors
    /// `Error::InvalidPointSet` on a weight length mismatch,
    /// `Error::MissingNormals` for point-to-plane without target normals.
    pub fn align_weighted<T: IcpScalar>(
        &self,
        source: &PointSet,
        weights: &[T],
        target: &PointSet,
        index: &TargetIndex,
        initial_guess: &Matrix4<f64>,
        element: usize,
    ) -> Result<IcpResult<T>> {
        if weights.len() != source.len() {
            return Err(Error::InvalidPointSet(format!(
                "{} weights for {} source points",
                weights.len(),
                source.len()
            )));
        }
        if self.config.mode == ResidualMode::Pt2Pl && !target.has_normals() {
            return Err(Error::MissingNormals(format!("batch element {element}")));
        }

        let config = &self.config;
        let num_active = source.num_active();
        let mut pose: Matrix4<T> = lift_matrix(initial_guess);
        let mut status = ConvergenceStatus::MaxIterations;
        let mut iterations = 0;
        let mut converged_flags = Vec::with_capacity(config.max_iterations);
        let mut regularized_steps = 0;
        let mut last_set = CorrespondenceSet::default();
        let mut debug_record = config.collect_debug.then(|| {
            let mut record = AlignmentDebug::new(element);
            record.set_initial_pose(initial_guess);
            record.num_source_points = source.len();
            record.num_active_points = num_active;
            record
        });

        for iteration in 0..config.max_iterations {
            let pose_value = matrix_value(&pose);
            let set = find_correspondences(source, index, &pose_value, config.correspondence_cutoff);
            let num_valid = set.num_valid();

            if num_valid == 0 {
                warn!(element, iteration, num_active, "no valid correspondences, holding estimate");
                status = ConvergenceStatus::NoValidCorrespondences;
                last_set = set;
                break;
            }
            if num_valid < config.min_constraints() {
                warn!(
                    element,
                    iteration,
                    num_valid,
                    required = config.min_constraints(),
                    "too few correspondences, holding estimate"
                );
                status = ConvergenceStatus::UnderConstrained;
                last_set = set;
                break;
            }

            let eq = accumulate(
                config.mode,
                &config.robust_kernel,
                source,
                weights,
                target,
                &set,
                &pose,
            );
            let outcome = solve_step(
                &eq,
                config.dimension,
                config.regularization,
                config.degenerate_rcond,
            );
            let Some(step) = outcome.step() else {
                warn!(element, iteration, num_valid, "degenerate normal equations, holding estimate");
                status = ConvergenceStatus::UnderConstrained;
                last_set = set;
                break;
            };
            if outcome.is_regularized() {
                warn!(element, iteration, "cholesky failed, using regularized step");
                regularized_steps += 1;
            }

            let step_value = step.map(|x| x.value());
            let step_norm = step_value.norm();
            pose = se3::orthonormalize(&se3::left_update(step, &pose));
            iterations += 1;

            let converged = step_norm < config.convergence_threshold;
            converged_flags.push(converged);
            status = if converged {
                ConvergenceStatus::Converged
            } else {
                ConvergenceStatus::MaxIterations
            };

            debug!(
                element,
                iteration,
                num_valid,
                cost = eq.cost,
                step_norm,
                converged,
                "icp iteration"
            );

            if let Some(record) = debug_record.as_mut() {
                let mut iter_debug = IterationDebug::new(iteration);
                iter_debug.set_pose(&pose_value);
                iter_debug.cost = eq.cost;
                iter_debug.set_gradient(&eq.gradient_value());
                iter_debug.set_hessian(&eq.hessian_value());
                iter_debug.set_step(&step_value);
                iter_debug.regularized = outcome.is_regularized();
                iter_debug.num_valid = num_valid;
                iter_debug.num_active = set.num_active();
                iter_debug.inlier_rmse = set.inlier_rmse();
                iter_debug.converged = converged;
                iter_debug.set_pose_after(&matrix_value(&pose));
                record.iterations.push(iter_debug);
            }

            last_set = set;

            if converged && config.iteration_strategy == IterationStrategy::EarlyExit {
                break;
            }
        }

        let fitness = last_set.fitness();
        let inlier_rmse = last_set.inlier_rmse();
        if let Some(record) = debug_record.as_mut() {
            record.set_final_pose(&matrix_value(&pose));
            record.convergence_status = status.to_string();
            record.total_iterations = iterations;
            record.final_fitness = fitness;
            record.final_rmse = inlier_rmse;
            debug!("{}", record.to_log());
        }

        Ok(IcpResult {
            transform: pose,
            status,
            iterations,
            num_valid: last_set.num_valid(),
            num_active,
            fitness,
            inlier_rmse,
            converged_flags,
            regularized_steps,
            debug: debug_record,
        })
    }
}

//! High-level batched alignment API.
//!
//! # Example
//!
//! ```ignore
//! use dicp::{Batch, BatchElement, IcpAligner, ResidualMode};
//!
//! let aligner = IcpAligner::builder()
//!     .mode(ResidualMode::Pt2Pt)
//!     .max_iterations(8)
//!     .build()?;
//!
//! // Plain alignment
//! let results = aligner.align(&batch);
//!
//! // Final poses with d(pose)/d(weights) attached
//! let grads = aligner.align_differentiable(&batch);
//! let dl_dw = grads[0].vjp(&dl_dpose);
//! ```

use std::borrow::Cow;

use nalgebra::{DVector, Matrix4};
use num_dual::DualDVec64;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::batch::{Batch, BatchElement};
use crate::correspondence::{search_batch, CorrespondenceSet, TargetIndex};
use crate::error::Result;
use crate::optimization::{
    Dimension, IcpConfig, IcpOptimizer, IcpResult, IterationStrategy, ResidualMode, RobustKernel,
};
use crate::point_set::PointSet;
use crate::scalar::{
    gradient, lift_matrix, matrix_jacobian, scatter_active, seed_active_weights, IcpScalar,
};

/// Scalar loss on a final transform, evaluated inside the differentiable pass.
///
/// Implementations must be written generically so the same code runs on
/// plain values and on dual numbers.
pub trait PoseLoss: Sync {
    fn evaluate<T: IcpScalar>(&self, element: usize, transform: &Matrix4<T>) -> T;
}

/// Final pose of one element with its sensitivity to the source weights.
#[derive(Debug, Clone)]
pub struct DifferentiableResult {
    /// Alignment summary with the final transform as plain values.
    pub result: IcpResult<f64>,

    /// `pose_jacobian[k][(i, j)]` = ∂T_ij / ∂w_k, one matrix per source point.
    pub pose_jacobian: Vec<Matrix4<f64>>,
}

impl DifferentiableResult {
    pub fn transform(&self) -> &Matrix4<f64> {
        &self.result.transform
    }

    /// dL/dw given dL/dT.
    pub fn vjp(&self, upstream: &Matrix4<f64>) -> DVector<f64> {
        DVector::from_iterator(
            self.pose_jacobian.len(),
            self.pose_jacobian.iter().map(|j| upstream.dot(j)),
        )
    }
}

/// Loss value and its gradient with respect to one element's source weights.
#[derive(Debug, Clone)]
pub struct WeightGradient {
    pub loss: f64,
    pub gradient: DVector<f64>,
    pub result: IcpResult<f64>,
}

/// Builder for [`IcpAligner`].
#[derive(Debug, Clone, Default)]
pub struct IcpAlignerBuilder {
    config: IcpConfig,
}

impl IcpAlignerBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the residual type.
    pub fn mode(mut self, mode: ResidualMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set maximum iterations.
    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    /// Set the maximum correspondence distance.
    pub fn correspondence_cutoff(mut self, cutoff: f64) -> Self {
        self.config.correspondence_cutoff = Some(cutoff);
        self
    }

    /// Set the update norm below which an iteration counts as converged.
    pub fn convergence_threshold(mut self, threshold: f64) -> Self {
        self.config.convergence_threshold = threshold;
        self
    }

    pub fn iteration_strategy(mut self, strategy: IterationStrategy) -> Self {
        self.config.iteration_strategy = strategy;
        self
    }

    pub fn dimension(mut self, dimension: Dimension) -> Self {
        self.config.dimension = dimension;
        self
    }

    pub fn robust_kernel(mut self, kernel: RobustKernel) -> Self {
        self.config.robust_kernel = kernel;
        self
    }

    /// Set the relative diagonal loading of the fallback solve.
    pub fn regularization(mut self, regularization: f64) -> Self {
        self.config.regularization = regularization;
        self
    }

    /// Set the reciprocal condition number below which H is treated as degenerate.
    pub fn degenerate_rcond(mut self, rcond: f64) -> Self {
        self.config.degenerate_rcond = rcond;
        self
    }

    /// Targets smaller than this are searched by brute force.
    pub fn brute_force_threshold(mut self, threshold: usize) -> Self {
        self.config.brute_force_threshold = threshold;
        self
    }

    /// Neighbourhood size for target normal estimation.
    pub fn normal_neighbors(mut self, k: usize) -> Self {
        self.config.normal_neighbors = k;
        self
    }

    /// Record per-iteration debug information.
    pub fn collect_debug(mut self, enabled: bool) -> Self {
        self.config.collect_debug = enabled;
        self
    }

    /// Validate the configuration and build the aligner.
    pub fn build(self) -> Result<IcpAligner> {
        IcpAligner::new(self.config)
    }
}

/// Batched weighted ICP aligner.
///
/// Every batch element is aligned independently and in parallel; nothing
/// computed for one element influences another. An element whose inputs
/// cannot be used (e.g. a non-finite point) comes back as
/// [`ConvergenceStatus::Failed`](crate::ConvergenceStatus::Failed) holding
/// its initial guess, with zero sensitivity to its weights.
#[derive(Debug, Clone)]
pub struct IcpAligner {
    optimizer: IcpOptimizer,
}

/// Target with normals ready for the configured residual, plus its index.
struct PreparedTarget<'a> {
    target: Cow<'a, PointSet>,
    index: TargetIndex,
}

impl IcpAligner {
    /// Create an aligner, validating the configuration.
    pub fn new(config: IcpConfig) -> Result<Self> {
        Ok(Self {
            optimizer: IcpOptimizer::new(config)?,
        })
    }

    /// Create a builder for configuring the aligner.
    pub fn builder() -> IcpAlignerBuilder {
        IcpAlignerBuilder::new()
    }

    /// Get the current configuration.
    pub fn config(&self) -> &IcpConfig {
        self.optimizer.config()
    }

    /// Estimate target normals when point-to-plane needs them, and index the target.
    fn prepare<'a>(&self, element: &'a BatchElement) -> Result<PreparedTarget<'a>> {
        let config = self.config();
        element.source.check_finite()?;
        element.target.check_finite()?;
        let target = if config.mode == ResidualMode::Pt2Pl && !element.target.has_normals() {
            Cow::Owned(
                element
                    .target
                    .clone()
                    .with_estimated_normals(config.normal_neighbors)?,
            )
        } else {
            Cow::Borrowed(&element.target)
        };
        let index = TargetIndex::build(&target, config.brute_force_threshold);
        Ok(PreparedTarget { target, index })
    }

    /// Align one element, turning any per-element error into a `Failed` result.
    fn align_element<T: IcpScalar>(
        &self,
        index: usize,
        element: &BatchElement,
        weights: &[T],
    ) -> IcpResult<T> {
        let aligned = self.prepare(element).and_then(|prepared| {
            self.optimizer.align_weighted(
                &element.source,
                weights,
                &prepared.target,
                &prepared.index,
                &element.initial_guess,
                index,
            )
        });
        aligned.unwrap_or_else(|err| {
            warn!(element = index, error = %err, "alignment failed, keeping initial guess");
            IcpResult::failed(lift_matrix(&element.initial_guess), element.source.num_active())
        })
    }

    /// Align every element with its own source weights.
    ///
    /// # Returns
    /// One result per element, in batch order.
    pub fn align(&self, batch: &Batch) -> Vec<IcpResult<f64>> {
        let results: Vec<_> = batch
            .elements()
            .par_iter()
            .enumerate()
            .map(|(i, element)| self.align_element(i, element, element.source.weights()))
            .collect();

        log_summary(&results);
        results
    }

    /// Align on dual numbers seeded on the active source weights.
    ///
    /// Returns the split result, the dual transform and the seeded indices;
    /// derivative vectors are indexed by position in that list.
    fn align_dual(
        &self,
        index: usize,
        element: &BatchElement,
    ) -> (IcpResult<f64>, Matrix4<DualDVec64>, Vec<usize>) {
        let active = element.source.active_indices();
        let weights = seed_active_weights(element.source.weights(), &active);
        let (result, dual) = self.align_element(index, element, &weights).split_transform();
        (result, dual, active)
    }

    /// Align every element and return ∂T/∂w alongside the final transform.
    ///
    /// Zero-weight points never enter the solve, so their sensitivities are zero.
    pub fn align_differentiable(&self, batch: &Batch) -> Vec<DifferentiableResult> {
        let results: Vec<_> = batch
            .elements()
            .par_iter()
            .enumerate()
            .map(|(i, element)| {
                let (result, dual, active) = self.align_dual(i, element);
                let reduced = matrix_jacobian(&dual, active.len());
                DifferentiableResult {
                    result,
                    pose_jacobian: scatter_active(
                        &reduced,
                        &active,
                        element.source.len(),
                        Matrix4::zeros(),
                    ),
                }
            })
            .collect();

        let plain: Vec<_> = results.iter().map(|r| r.result.clone()).collect();
        log_summary(&plain);
        results
    }

    /// Evaluate `loss` on each element's final transform and differentiate it
    /// with respect to that element's source weights.
    pub fn align_with<F: PoseLoss>(&self, batch: &Batch, loss: &F) -> Vec<WeightGradient> {
        batch
            .elements()
            .par_iter()
            .enumerate()
            .map(|(i, element)| {
                let (result, dual, active) = self.align_dual(i, element);
                let value = loss.evaluate(i, &dual);
                let reduced = gradient(&value, active.len());
                WeightGradient {
                    loss: value.value(),
                    gradient: DVector::from_vec(scatter_active(
                        reduced.as_slice(),
                        &active,
                        element.source.len(),
                        0.0,
                    )),
                    result,
                }
            })
            .collect()
    }

    /// Correspondences of every element at its initial guess.
    pub fn correspondences(&self, batch: &Batch) -> Result<Vec<CorrespondenceSet>> {
        let prepared = batch
            .elements()
            .iter()
            .map(|element| self.prepare(element))
            .collect::<Result<Vec<_>>>()?;
        let queries: Vec<_> = batch
            .elements()
            .iter()
            .zip(&prepared)
            .map(|(element, p)| (&element.source, &p.index, element.initial_guess))
            .collect();
        Ok(search_batch(&queries, self.config().correspondence_cutoff))
    }

    /// [`Self::correspondences`] with the nearest-neighbour search on the GPU.
    #[cfg(feature = "cuda")]
    pub fn correspondences_gpu(
        &self,
        gpu: &crate::correspondence::GpuNearestNeighbor,
        batch: &Batch,
    ) -> Result<Vec<CorrespondenceSet>> {
        let prepared = batch
            .elements()
            .iter()
            .map(|element| self.prepare(element))
            .collect::<Result<Vec<_>>>()?;
        let queries: Vec<_> = batch
            .elements()
            .iter()
            .zip(&prepared)
            .map(|(element, p)| (&element.source, &p.index, element.initial_guess))
            .collect();
        crate::correspondence::search_batch_gpu(gpu, &queries, self.config().correspondence_cutoff)
    }
}

fn log_summary(results: &[IcpResult<f64>]) {
    let converged = results.iter().filter(|r| r.status.is_converged()).count();
    let degenerate = results.iter().filter(|r| r.status.is_degenerate()).count();
    let iterations: usize = results.iter().map(|r| r.iterations).sum();
    info!(
        elements = results.len(),
        converged,
        degenerate,
        mean_iterations = iterations as f64 / results.len().max(1) as f64,
        "batch aligned"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::optimization::ConvergenceStatus;
    use crate::scalar::seed_weights;
    use crate::se3;
    use crate::test_utils::{
        lcg_uniform, make_noisy_xy_plane, make_transform, make_unit_square_perimeter,
        transform_points,
    };
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Uniform};

    fn square_problem(n: usize, seed: u64, truth: &Matrix4<f64>) -> (PointSet, PointSet) {
        let source_pts = make_unit_square_perimeter(n, seed);
        let target_pts = transform_points(truth, &source_pts);
        (PointSet::from_xyz(&source_pts), PointSet::from_xyz(&target_pts))
    }

    /// Square perimeter problem whose target carries small noise, so that
    /// the optimum depends on the weights.
    fn noisy_problem() -> BatchElement {
        let truth = make_transform(0.05, -0.03, 0.0, 2f64.to_radians());
        let source_pts = make_unit_square_perimeter(40, 3);
        let mut state = 11;
        let target_pts: Vec<[f64; 3]> = transform_points(&truth, &source_pts)
            .into_iter()
            .map(|p| {
                let dx = 0.01 * (2.0 * lcg_uniform(&mut state) - 1.0);
                let dy = 0.01 * (2.0 * lcg_uniform(&mut state) - 1.0);
                [p[0] + dx, p[1] + dy, 0.0]
            })
            .collect();

        let mut rng = StdRng::seed_from_u64(7);
        let dist = Uniform::new(0.5, 1.0);
        let weights: Vec<f64> = (0..source_pts.len()).map(|_| dist.sample(&mut rng)).collect();
        let source = PointSet::from_xyz(&source_pts).with_weights(weights).unwrap();
        BatchElement::new(source, PointSet::from_xyz(&target_pts), Matrix4::identity())
    }

    fn with_weight(element: &BatchElement, k: usize, value: f64) -> Batch {
        let mut weights = element.source.weights().to_vec();
        weights[k] = value;
        let source = element.source.clone().with_weights(weights).unwrap();
        Batch::new(vec![BatchElement::new(
            source,
            element.target.clone(),
            element.initial_guess,
        )])
    }

    /// Frobenius product with a fixed matrix.
    struct Projection(Matrix4<f64>);

    impl PoseLoss for Projection {
        fn evaluate<T: IcpScalar>(&self, _element: usize, transform: &Matrix4<T>) -> T {
            let mut sum = T::constant(0.0);
            for i in 0..4 {
                for j in 0..4 {
                    sum += transform[(i, j)].clone() * T::constant(self.0[(i, j)]);
                }
            }
            sum
        }
    }

    fn projection() -> Matrix4<f64> {
        let mut m = Matrix4::zeros();
        m[(0, 3)] = 1.0;
        m[(1, 3)] = -2.0;
        m[(1, 0)] = 3.0;
        m
    }

    #[test]
    fn test_builder_validates() {
        let err = IcpAligner::builder().max_iterations(0).build();
        assert!(matches!(err, Err(Error::Config(_))));

        let aligner = IcpAligner::builder()
            .mode(ResidualMode::Pt2Pl)
            .max_iterations(4)
            .collect_debug(true)
            .build()
            .unwrap();
        assert_eq!(aligner.config().mode, ResidualMode::Pt2Pl);
        assert_eq!(aligner.config().max_iterations, 4);
    }

    #[test]
    fn test_end_to_end_square() {
        let truth = make_transform(0.1, 0.2, 0.0, 5f64.to_radians());
        let (source, target) = square_problem(100, 42, &truth);
        let batch = Batch::new(vec![BatchElement::new(source, target, Matrix4::identity())]);
        let aligner = IcpAligner::builder().max_iterations(10).build().unwrap();

        let result = &aligner.align(&batch)[0];
        assert!(result.iterations <= 10);
        assert_relative_eq!(se3::yaw(&result.transform), 5f64.to_radians(), epsilon = 1e-3);
        assert_relative_eq!(result.transform[(0, 3)], 0.1, epsilon = 1e-3);
        assert_relative_eq!(result.transform[(1, 3)], 0.2, epsilon = 1e-3);
        assert_relative_eq!(result.transform[(2, 3)], 0.0, epsilon = 1e-3);
    }

    #[test]
    fn test_zero_weight_element_is_isolated() {
        let truth = make_transform(0.1, 0.2, 0.0, 5f64.to_radians());
        let (source, target) = square_problem(100, 42, &truth);
        let good = BatchElement::new(source.clone(), target.clone(), Matrix4::identity());
        let guess = make_transform(0.5, 0.5, 0.0, 0.2);
        let dead = BatchElement::new(
            source.clone().with_weights(vec![0.0; 100]).unwrap(),
            target,
            guess,
        );
        let aligner = IcpAligner::builder().max_iterations(10).build().unwrap();

        let solo = aligner.align(&Batch::new(vec![good.clone()]));
        let mixed = aligner.align(&Batch::new(vec![dead, good]));

        assert_eq!(mixed[0].status, ConvergenceStatus::NoValidCorrespondences);
        assert_eq!(mixed[0].transform, guess);
        assert_eq!(mixed[1].transform, solo[0].transform);
        assert_eq!(mixed[1].iterations, solo[0].iterations);
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let element = noisy_problem();
        let aligner = IcpAligner::builder().max_iterations(8).build().unwrap();
        let loss = Projection(projection());
        let batch = Batch::new(vec![element.clone()]);

        let analytic = &aligner.align_with(&batch, &loss)[0];
        let value = |b: &Batch| loss.evaluate(0, &aligner.align(b)[0].transform);
        assert_relative_eq!(analytic.loss, value(&batch), epsilon = 1e-12);

        let h = 1e-6;
        for k in [0, 5, 17, 38] {
            let w = element.source.weights()[k];
            let numeric = (value(&with_weight(&element, k, w + h))
                - value(&with_weight(&element, k, w - h)))
                / (2.0 * h);
            assert_relative_eq!(analytic.gradient[k], numeric, epsilon = 1e-5, max_relative = 1e-4);
        }
        assert!(analytic.gradient.norm() > 1e-6);
    }

    #[test]
    fn test_vjp_matches_loss_gradient() {
        let element = noisy_problem();
        let aligner = IcpAligner::builder().max_iterations(8).build().unwrap();
        let batch = Batch::new(vec![element]);

        let diff = &aligner.align_differentiable(&batch)[0];
        let via_loss = &aligner.align_with(&batch, &Projection(projection()))[0];
        let via_vjp = diff.vjp(&projection());

        assert_eq!(diff.pose_jacobian.len(), 40);
        for k in 0..40 {
            assert_relative_eq!(via_vjp[k], via_loss.gradient[k], epsilon = 1e-10);
        }
        assert_relative_eq!(*diff.transform(), via_loss.result.transform, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_weight_points_have_zero_sensitivity() {
        let element = noisy_problem();
        let mut weights = element.source.weights().to_vec();
        weights[3] = 0.0;
        weights[20] = 0.0;
        let source = element.source.clone().with_weights(weights).unwrap();
        let batch = Batch::new(vec![BatchElement::new(
            source,
            element.target.clone(),
            Matrix4::identity(),
        )]);
        let aligner = IcpAligner::builder().max_iterations(8).build().unwrap();

        let diff = &aligner.align_differentiable(&batch)[0];
        assert_eq!(diff.pose_jacobian[3], Matrix4::zeros());
        assert_eq!(diff.pose_jacobian[20], Matrix4::zeros());
        assert!(diff.pose_jacobian[4].norm() > 0.0);
    }

    #[test]
    fn test_active_seeding_matches_full_seeding() {
        let element = noisy_problem();
        let mut weights = element.source.weights().to_vec();
        for k in [1, 8, 9, 30] {
            weights[k] = 0.0;
        }
        let source = element.source.clone().with_weights(weights).unwrap();
        let element = BatchElement::new(source, element.target.clone(), Matrix4::identity());
        let aligner = IcpAligner::builder().max_iterations(8).build().unwrap();
        let loss = Projection(projection());

        let narrow = &aligner.align_with(&Batch::new(vec![element.clone()]), &loss)[0];

        let prepared = aligner.prepare(&element).unwrap();
        let wide = aligner
            .optimizer
            .align_weighted(
                &element.source,
                &seed_weights(element.source.weights()),
                &prepared.target,
                &prepared.index,
                &element.initial_guess,
                0,
            )
            .unwrap();
        let reference = gradient(&loss.evaluate(0, &wide.transform), 40);

        assert_eq!(narrow.gradient.len(), 40);
        for k in 0..40 {
            assert_relative_eq!(narrow.gradient[k], reference[k], epsilon = 1e-10);
        }
        for k in [1, 8, 9, 30] {
            assert_eq!(narrow.gradient[k], 0.0);
        }
        assert!(narrow.gradient.norm() > 1e-6);
    }

    #[test]
    fn test_non_finite_element_fails_alone() {
        let truth = make_transform(0.1, 0.2, 0.0, 5f64.to_radians());
        let (source, target) = square_problem(100, 42, &truth);
        let good = BatchElement::new(source.clone(), target.clone(), Matrix4::identity());
        let mut points = target.points().to_vec();
        points[7].x = f64::NAN;
        let guess = make_transform(0.2, 0.0, 0.0, 0.1);
        let poisoned = BatchElement::new(source, PointSet::new(points), guess);
        let aligner = IcpAligner::builder().max_iterations(10).build().unwrap();

        let solo = aligner.align(&Batch::new(vec![good.clone()]));
        let mixed = aligner.align(&Batch::new(vec![poisoned.clone(), good.clone()]));
        assert_eq!(mixed[0].status, ConvergenceStatus::Failed);
        assert!(mixed[0].status.is_degenerate());
        assert_eq!(mixed[0].transform, guess);
        assert_eq!(mixed[1].transform, solo[0].transform);

        let loss = Projection(projection());
        let grads = aligner.align_with(&Batch::new(vec![poisoned.clone(), good.clone()]), &loss);
        assert_eq!(grads[0].result.status, ConvergenceStatus::Failed);
        assert_eq!(grads[0].gradient, DVector::zeros(100));
        assert_relative_eq!(grads[0].loss, loss.evaluate(0, &guess), epsilon = 1e-12);
        assert!(grads[1].result.status.is_usable());

        let diff = aligner.align_differentiable(&Batch::new(vec![poisoned, good]));
        assert_eq!(diff[0].pose_jacobian.len(), 100);
        assert!(diff[0].pose_jacobian.iter().all(|j| *j == Matrix4::zeros()));
    }

    #[test]
    fn test_point_to_plane_differs_on_noisy_plane() {
        let source_pts = make_noisy_xy_plane(1.0, 0.1, 0.01, 1);
        let target_pts: Vec<[f64; 3]> = make_noisy_xy_plane(1.0, 0.1, 0.01, 2)
            .into_iter()
            .map(|p| [p[0], p[1], p[2] + 0.05])
            .collect();
        let batch = Batch::new(vec![BatchElement::new(
            PointSet::from_xyz(&source_pts),
            PointSet::from_xyz(&target_pts),
            Matrix4::identity(),
        )]);

        let run = |mode| {
            let aligner = IcpAligner::builder()
                .mode(mode)
                .max_iterations(1)
                .build()
                .unwrap();
            aligner.align(&batch)[0].transform
        };
        let pt2pt = run(ResidualMode::Pt2Pt);
        let pt2pl = run(ResidualMode::Pt2Pl);

        assert!((pt2pt - pt2pl).norm() > 1e-6);
        assert!(pt2pt.iter().all(|x| x.is_finite()));
        assert!(pt2pl.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_correspondences_at_initial_guess() {
        let truth = make_transform(0.1, 0.2, 0.0, 5f64.to_radians());
        let (source, target) = square_problem(20, 5, &truth);
        let masked = source
            .clone()
            .with_weights((0..20).map(|i| if i < 5 { 0.0 } else { 1.0 }).collect())
            .unwrap();
        let batch = Batch::new(vec![
            BatchElement::new(source, target.clone(), truth),
            BatchElement::new(masked, target, truth),
        ]);
        let aligner = IcpAligner::builder().build().unwrap();

        let sets = aligner.correspondences(&batch).unwrap();
        assert_eq!(sets[0].num_valid(), 20);
        assert_eq!(sets[1].num_active(), 15);
        assert_eq!(sets[1].num_inactive(), 5);
    }
}

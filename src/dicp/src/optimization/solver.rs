//! Gauss-Newton step for the weighted ICP system.
//!
//! The step solves H·δ = -g with Cholesky on the solved degrees of freedom.
//! A value-only H whose reciprocal condition number is below
//! `degenerate_rcond` has a null space (collinear points, a planar scan
//! solved in 6-DOF) and is reported as degenerate, so the caller holds its
//! estimate. When H passes that test but Cholesky still fails, a solve on
//! H + λ·max(diag H)·I is tried before giving up. A threshold of 0 lets
//! every system through to that regularized solve.

use nalgebra::{DMatrix, DVector, Matrix6, SymmetricEigen, Vector6};

use super::normal_equations::NormalEquations;
use super::types::Dimension;
use crate::scalar::IcpScalar;

/// Outcome of one update solve.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome<T: IcpScalar> {
    /// Plain Cholesky solve succeeded.
    Solved(Vector6<T>),

    /// Only the diagonally loaded system could be solved.
    Regularized(Vector6<T>),

    /// No usable step; the estimate must be held.
    Degenerate,
}

impl<T: IcpScalar> StepOutcome<T> {
    /// The step, or `None` if degenerate.
    pub fn step(&self) -> Option<&Vector6<T>> {
        match self {
            StepOutcome::Solved(d) | StepOutcome::Regularized(d) => Some(d),
            StepOutcome::Degenerate => None,
        }
    }

    pub fn is_regularized(&self) -> bool {
        matches!(self, StepOutcome::Regularized(_))
    }
}

/// Reciprocal condition number (smallest / largest eigenvalue) of a
/// symmetric positive semi-definite matrix.
///
/// # Returns
/// A value in [0, 1]; 0 when the matrix is zero or has a non-positive eigenvalue.
pub fn reciprocal_condition(matrix: &DMatrix<f64>) -> f64 {
    if matrix.iter().any(|x| !x.is_finite()) {
        return 0.0;
    }
    let eigen = SymmetricEigen::new(matrix.clone());
    let max = eigen.eigenvalues.max();
    let min = eigen.eigenvalues.min();
    if max <= 0.0 || min <= 0.0 {
        0.0
    } else {
        min / max
    }
}

/// Restrict the system to the solved degrees of freedom.
fn reduce<T: IcpScalar>(
    hessian: &Matrix6<T>,
    gradient: &Vector6<T>,
    dofs: &[usize],
) -> (DMatrix<T>, DVector<T>) {
    let n = dofs.len();
    let h = DMatrix::from_fn(n, n, |i, j| hessian[(dofs[i], dofs[j])].clone());
    let g = DVector::from_fn(n, |i, _| gradient[dofs[i]].clone());
    (h, g)
}

/// Scatter a reduced step back into the full tangent.
fn expand<T: IcpScalar>(reduced: &DVector<T>, dofs: &[usize]) -> Vector6<T> {
    let mut full = Vector6::zeros();
    for (i, &d) in dofs.iter().enumerate() {
        full[d] = reduced[i].clone();
    }
    full
}

fn cholesky_step<T: IcpScalar>(h: DMatrix<T>, g: &DVector<T>) -> Option<DVector<T>> {
    let chol = h.cholesky()?;
    let step = chol.solve(&(-g));
    step.iter().all(|x| x.value().is_finite()).then_some(step)
}

/// Compute the Gauss-Newton update δ = -H⁻¹g.
///
/// # Arguments
/// * `eq` - Accumulated normal equations
/// * `dimension` - Which degrees of freedom to solve
/// * `regularization` - Relative diagonal loading λ for the fallback
/// * `degenerate_rcond` - Reciprocal condition threshold for the plain solve
pub fn solve_step<T: IcpScalar>(
    eq: &NormalEquations<T>,
    dimension: Dimension,
    regularization: f64,
    degenerate_rcond: f64,
) -> StepOutcome<T> {
    let dofs = dimension.active_dofs();
    let (h, g) = reduce(&eq.hessian, &eq.gradient, dofs);
    let h_value = h.map(|x| x.value());

    if reciprocal_condition(&h_value) < degenerate_rcond {
        return StepOutcome::Degenerate;
    }
    if let Some(step) = cholesky_step(h.clone(), &g) {
        return StepOutcome::Solved(expand(&step, dofs));
    }

    // H + λ·max(diag H)·I
    let max_diag = h_value.diagonal().max();
    let lambda = regularization * max_diag;
    if !(lambda > 0.0 && lambda.is_finite()) {
        return StepOutcome::Degenerate;
    }
    let mut loaded = h;
    for i in 0..dofs.len() {
        loaded[(i, i)] += T::constant(lambda);
    }
    match cholesky_step(loaded, &g) {
        Some(step) => StepOutcome::Regularized(expand(&step, dofs)),
        None => StepOutcome::Degenerate,
    }
}

//! Scalar abstraction for the differentiable code path.
//!
//! Every numerical routine in this crate is generic over [`IcpScalar`]. With
//! `f64` it is a plain solver; with [`DualDVec64`] every value carries its
//! derivative with respect to the per-point weights of one batch element, so
//! the final pose comes out with d(pose)/d(weights) attached (forward-mode
//! automatic differentiation).
//!
//! Discrete decisions (nearest-neighbour index, cutoff gating, convergence
//! tests) always look at [`IcpScalar::value`] and never carry gradient.

use nalgebra::{DVector, Dyn, Matrix4, RealField, Vector3, U1};
use num_dual::{Derivative, DualDVec64, DualVec};

/// Real scalar usable inside the alignment loop.
pub trait IcpScalar: RealField {
    /// Plain value, stripped of any derivative information.
    fn value(&self) -> f64;

    /// Lift a constant into the scalar type (zero derivative).
    fn constant(value: f64) -> Self {
        nalgebra::convert(value)
    }
}

impl IcpScalar for f64 {
    #[inline]
    fn value(&self) -> f64 {
        *self
    }
}

impl IcpScalar for DualDVec64 {
    #[inline]
    fn value(&self) -> f64 {
        self.re
    }
}

/// Seed each weight as an independent differentiation variable.
///
/// Weight `i` gets the unit derivative vector `e_i` of length `weights.len()`.
pub fn seed_weights(weights: &[f64]) -> Vec<DualDVec64> {
    let n = weights.len();
    weights
        .iter()
        .enumerate()
        .map(|(i, &w)| {
            let mut unit = DVector::zeros(n);
            unit[i] = 1.0;
            DualVec::new(w, Derivative::some(unit))
        })
        .collect()
}

/// Seed only the weights at `active`; every other weight is a constant.
///
/// Weight `active[j]` gets the unit derivative `e_j` of length
/// `active.len()`, so the derivative width follows the active count rather
/// than the scan size.
pub fn seed_active_weights(weights: &[f64], active: &[usize]) -> Vec<DualDVec64> {
    let mut seeded: Vec<DualDVec64> = weights
        .iter()
        .map(|&w| <DualDVec64 as IcpScalar>::constant(w))
        .collect();
    let n = active.len();
    for (j, &i) in active.iter().enumerate() {
        let mut unit = DVector::zeros(n);
        unit[j] = 1.0;
        seeded[i] = DualVec::new(weights[i], Derivative::some(unit));
    }
    seeded
}

/// Spread derivatives over the active variables back to all `len` weights.
/// Inactive weights get `zero`.
pub fn scatter_active<T: Clone>(reduced: &[T], active: &[usize], len: usize, zero: T) -> Vec<T> {
    let mut full = vec![zero; len];
    for (value, &i) in reduced.iter().zip(active) {
        full[i] = value.clone();
    }
    full
}

/// Gradient of a dual value with respect to the `num_vars` seeded variables.
///
/// Values that never touched a seeded variable yield a zero vector.
pub fn gradient(x: &DualDVec64, num_vars: usize) -> DVector<f64> {
    x.eps.clone().unwrap_generic(Dyn(num_vars), U1)
}

/// Strip derivatives from a 4x4 matrix.
pub fn matrix_value<T: IcpScalar>(m: &Matrix4<T>) -> Matrix4<f64> {
    m.map(|x| x.value())
}

/// Lift a constant matrix into the scalar type.
pub fn lift_matrix<T: IcpScalar>(m: &Matrix4<f64>) -> Matrix4<T> {
    m.map(T::constant)
}

/// Lift a constant vector into the scalar type.
pub fn lift_vector<T: IcpScalar>(v: &Vector3<f64>) -> Vector3<T> {
    v.map(T::constant)
}

/// Per-entry sensitivities of a dual matrix: `out[k][(i, j)] = ∂m_ij / ∂w_k`.
pub fn matrix_jacobian(m: &Matrix4<DualDVec64>, num_vars: usize) -> Vec<Matrix4<f64>> {
    let mut out = vec![Matrix4::zeros(); num_vars];
    for i in 0..4 {
        for j in 0..4 {
            let g = gradient(&m[(i, j)], num_vars);
            for (k, slot) in out.iter_mut().enumerate() {
                slot[(i, j)] = g[k];
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_f64_value_and_constant() {
        assert_eq!(2.5f64.value(), 2.5);
        assert_eq!(<f64 as IcpScalar>::constant(-1.0), -1.0);
    }

    #[test]
    fn test_seeded_weights_have_unit_gradients() {
        let w = seed_weights(&[0.2, 0.5, 1.0]);
        assert_eq!(w.len(), 3);
        for (i, wi) in w.iter().enumerate() {
            let g = gradient(wi, 3);
            for k in 0..3 {
                assert_eq!(g[k], if k == i { 1.0 } else { 0.0 });
            }
        }
    }

    #[test]
    fn test_product_rule_through_dual() {
        let w = seed_weights(&[2.0, 3.0]);
        let y = w[0].clone() * w[1].clone() + w[0].clone() * w[0].clone();
        assert_relative_eq!(y.value(), 10.0, epsilon = 1e-12);

        let g = gradient(&y, 2);
        assert_relative_eq!(g[0], 7.0, epsilon = 1e-12);
        assert_relative_eq!(g[1], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_constant_has_zero_gradient() {
        let c = <DualDVec64 as IcpScalar>::constant(4.0);
        assert_eq!(c.value(), 4.0);
        let g = gradient(&c, 3);
        assert_eq!(g, DVector::zeros(3));
    }

    #[test]
    fn test_active_seeding_narrows_derivatives() {
        let w = seed_active_weights(&[0.5, 0.0, 0.8, 0.0], &[0, 2]);
        assert_eq!(w.len(), 4);
        assert_eq!(w[2].value(), 0.8);
        assert_eq!(gradient(&w[0], 2), DVector::from_vec(vec![1.0, 0.0]));
        assert_eq!(gradient(&w[2], 2), DVector::from_vec(vec![0.0, 1.0]));
        assert_eq!(gradient(&w[1], 2), DVector::zeros(2));

        let y = w[0].clone() * <DualDVec64 as IcpScalar>::constant(3.0) + w[2].clone();
        let full = scatter_active(gradient(&y, 2).as_slice(), &[0, 2], 4, 0.0);
        assert_eq!(full, vec![3.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_matrix_jacobian_layout() {
        let w = seed_weights(&[1.0, 1.0]);
        let mut m: Matrix4<DualDVec64> = lift_matrix(&Matrix4::identity());
        m[(0, 3)] = w[0].clone() * <DualDVec64 as IcpScalar>::constant(2.0);
        m[(1, 3)] = w[1].clone();

        let jac = matrix_jacobian(&m, 2);
        assert_eq!(jac[0][(0, 3)], 2.0);
        assert_eq!(jac[0][(1, 3)], 0.0);
        assert_eq!(jac[1][(1, 3)], 1.0);
        assert_eq!(matrix_value(&m)[(0, 3)], 2.0);
    }
}

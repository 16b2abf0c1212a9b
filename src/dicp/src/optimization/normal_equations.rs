//! Weighted Gauss-Newton normal equations for ICP.
//!
//! For each valid correspondence with transformed source point p', target q
//! and source weight w:
//!
//! - point-to-point: r = p' - q, J = [I | -[p']×]
//! - point-to-plane: r = nᵀ(p' - q), J = [nᵀ | (p' × n)ᵀ]
//!
//! and H = Σ w·JᵀJ, g = Σ w·Jᵀr. J is the derivative of r under the left
//! perturbation p' ← exp(δ)·p' with δ = [ρ; φ].
//!
//! Everything is generic over [`IcpScalar`], so with dual numbers H and g
//! carry their derivatives with respect to the weights.

use nalgebra::{Matrix3, Matrix3x6, Matrix4, Matrix6, RowVector6, Vector3, Vector6};

use super::types::{ResidualMode, RobustKernel};
use crate::correspondence::CorrespondenceSet;
use crate::point_set::PointSet;
use crate::scalar::{lift_vector, IcpScalar};
use crate::se3;

/// Accumulated system H·δ = -g for one iteration.
#[derive(Debug, Clone)]
pub struct NormalEquations<T: IcpScalar> {
    /// Σ w·JᵀJ (6x6).
    pub hessian: Matrix6<T>,

    /// Σ w·Jᵀr (6x1).
    pub gradient: Vector6<T>,

    /// Weighted cost Σ w·ρ(‖r‖²), values only.
    pub cost: f64,

    /// Number of correspondences that contributed.
    pub num_constraints: usize,
}

impl<T: IcpScalar> NormalEquations<T> {
    pub fn zeros() -> Self {
        Self {
            hessian: Matrix6::zeros(),
            gradient: Vector6::zeros(),
            cost: 0.0,
            num_constraints: 0,
        }
    }

    /// Value-only copy of the Hessian.
    pub fn hessian_value(&self) -> Matrix6<f64> {
        self.hessian.map(|x| x.value())
    }

    /// Value-only copy of the gradient.
    pub fn gradient_value(&self) -> Vector6<f64> {
        self.gradient.map(|x| x.value())
    }
}

/// IRLS weight ρ'(s) and cost ρ(s) for a squared residual norm `s`.
fn robust_weight<T: IcpScalar>(kernel: &RobustKernel, s: &T) -> (T, f64) {
    match *kernel {
        RobustKernel::None => (T::one(), s.value()),
        RobustKernel::Huber { scale } => {
            let sv = s.value();
            if sv > scale * scale {
                // ρ(s) = 2δ√s - δ², ρ'(s) = δ/√s
                let root = s.clone().sqrt();
                (
                    T::constant(scale) / root,
                    2.0 * scale * sv.sqrt() - scale * scale,
                )
            } else {
                (T::one(), sv)
            }
        }
    }
}

/// Point-to-point Jacobian [I | -[p']×].
fn point_jacobian<T: IcpScalar>(p: &Vector3<T>) -> Matrix3x6<T> {
    let mut j = Matrix3x6::zeros();
    j.fixed_view_mut::<3, 3>(0, 0).copy_from(&Matrix3::identity());
    j.fixed_view_mut::<3, 3>(0, 3).copy_from(&(-se3::hat(p)));
    j
}

/// Point-to-plane Jacobian [nᵀ | (p' × n)ᵀ].
fn plane_jacobian<T: IcpScalar>(p: &Vector3<T>, n: &Vector3<T>) -> RowVector6<T> {
    let c = p.cross(n);
    RowVector6::new(
        n.x.clone(),
        n.y.clone(),
        n.z.clone(),
        c.x.clone(),
        c.y.clone(),
        c.z.clone(),
    )
}

/// Build the weighted normal equations at `pose`.
///
/// # Arguments
/// * `mode` - Residual type
/// * `kernel` - Robust kernel
/// * `source` - Source points
/// * `weights` - Per-source-point weights (same length as `source`)
/// * `target` - Target points; needs normals for point-to-plane
/// * `correspondences` - Matches found at the value of `pose`
/// * `pose` - Current estimate
///
/// # Returns
/// The accumulated system. For point-to-plane without target normals the
/// system is empty.
pub fn accumulate<T: IcpScalar>(
    mode: ResidualMode,
    kernel: &RobustKernel,
    source: &PointSet,
    weights: &[T],
    target: &PointSet,
    correspondences: &CorrespondenceSet,
    pose: &Matrix4<T>,
) -> NormalEquations<T> {
    let mut eq = NormalEquations::zeros();
    let normals = target.normals();

    for c in correspondences.valid() {
        let Some(ti) = c.target_index else {
            continue;
        };
        let w = &weights[c.source_index];
        let p = se3::transform_point(pose, &lift_vector(&source.points()[c.source_index]));
        let q: Vector3<T> = lift_vector(&target.points()[ti]);
        let diff = &p - &q;

        match mode {
            ResidualMode::Pt2Pt => {
                let s = diff.norm_squared();
                let (rho, cost) = robust_weight(kernel, &s);
                let wr = w.clone() * rho;
                let j = point_jacobian(&p);
                let jt = j.transpose();
                eq.hessian += &jt * &j * wr.clone();
                eq.gradient += &jt * &diff * wr;
                eq.cost += w.value() * cost;
            }
            ResidualMode::Pt2Pl => {
                let Some(normals) = normals else {
                    return NormalEquations::zeros();
                };
                let n: Vector3<T> = lift_vector(&normals[ti]);
                let r = n.dot(&diff);
                let s = r.clone() * r.clone();
                let (rho, cost) = robust_weight(kernel, &s);
                let wr = w.clone() * rho;
                let j = plane_jacobian(&p, &n);
                let jt = j.transpose();
                eq.hessian += &jt * &j * wr.clone();
                eq.gradient += jt * (r * wr);
                eq.cost += w.value() * cost;
            }
        }
        eq.num_constraints += 1;
    }

    eq
}

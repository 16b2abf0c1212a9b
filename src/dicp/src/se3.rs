//! SE(3) pose algebra on homogeneous 4x4 matrices.
//!
//! Tangent vectors are ordered `[ρ; φ]`: translation part first, rotation
//! (axis-angle) second, matching the `[tx, ty, tz, roll, pitch, yaw]` layout
//! used everywhere else for 6-DOF quantities.
//!
//! All maps are generic over [`IcpScalar`], so they can be evaluated on dual
//! numbers. Near-zero angles use Taylor series in θ² instead of dividing by a
//! vanishing sine; this also keeps derivatives finite because no square root
//! of zero is ever taken.
//!
//! # Branch cut
//!
//! [`log`] returns rotation vectors with ‖φ‖ ≤ π. When the rotation angle is
//! within ~1e-6 of π the axis is recovered from the symmetric part of R and
//! the angle is clamped to the principal branch. `exp(log(T)) == T` still holds
//! there, but `log(exp(v))` may return the antipodal representative `-v` for
//! ‖φ‖ = π, and the derivative through the angle is not carried in that
//! neighbourhood.

use std::cmp::Ordering;

use nalgebra::{Matrix3, Matrix4, Vector3, Vector6};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::scalar::IcpScalar;

/// Below this θ², trigonometric coefficients switch to their series.
const SMALL_ANGLE_SQ: f64 = 1e-4;

/// Below this |sin θ| (with cos θ < 0), `log` treats the rotation as a half turn.
const NEAR_PI_SIN: f64 = 1e-6;

#[inline]
fn c<T: IcpScalar>(x: f64) -> T {
    T::constant(x)
}

/// Skew-symmetric matrix `[v]×` such that `[v]× u = v × u`.
pub fn hat<T: IcpScalar>(v: &Vector3<T>) -> Matrix3<T> {
    Matrix3::new(
        T::zero(),
        -v[2].clone(),
        v[1].clone(),
        v[2].clone(),
        T::zero(),
        -v[0].clone(),
        -v[1].clone(),
        v[0].clone(),
        T::zero(),
    )
}

/// Inverse of [`hat`] (reads the off-diagonal of a skew matrix).
pub fn vee<T: IcpScalar>(m: &Matrix3<T>) -> Vector3<T> {
    Vector3::new(m[(2, 1)].clone(), m[(0, 2)].clone(), m[(1, 0)].clone())
}

/// Assemble a homogeneous transform from rotation and translation blocks.
pub fn from_parts<T: IcpScalar>(rotation: &Matrix3<T>, translation: &Vector3<T>) -> Matrix4<T> {
    let mut m = Matrix4::identity();
    m.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
    m.fixed_view_mut::<3, 1>(0, 3).copy_from(translation);
    m
}

/// Rotation block of a transform.
pub fn rotation<T: IcpScalar>(m: &Matrix4<T>) -> Matrix3<T> {
    m.fixed_view::<3, 3>(0, 0).into_owned()
}

/// Translation column of a transform.
pub fn translation<T: IcpScalar>(m: &Matrix4<T>) -> Vector3<T> {
    m.fixed_view::<3, 1>(0, 3).into_owned()
}

/// Apply a transform to a point: `R p + t`.
#[inline]
pub fn transform_point<T: IcpScalar>(m: &Matrix4<T>, p: &Vector3<T>) -> Vector3<T> {
    rotation(m) * p + translation(m)
}

/// Coefficients `A = sinθ/θ`, `B = (1−cosθ)/θ²`, `C = (θ−sinθ)/θ³`.
fn rodrigues_coefficients<T: IcpScalar>(theta_sq: &T) -> (T, T, T) {
    let t2 = theta_sq.clone();
    if t2.value() < SMALL_ANGLE_SQ {
        let t4 = t2.clone() * t2.clone();
        let a = T::one() - t2.clone() / c(6.0) + t4.clone() / c(120.0);
        let b = c::<T>(0.5) - t2.clone() / c(24.0) + t4.clone() / c(720.0);
        let cc = c::<T>(1.0 / 6.0) - t2 / c(120.0) + t4 / c(5040.0);
        (a, b, cc)
    } else {
        let theta = t2.clone().sqrt();
        let sin = theta.clone().sin();
        let cos = theta.clone().cos();
        let a = sin.clone() / theta.clone();
        let b = (T::one() - cos) / t2.clone();
        let cc = (theta.clone() - sin) / (t2 * theta);
        (a, b, cc)
    }
}

/// Split a tangent vector into `(ρ, φ)`.
pub fn split_tangent<T: IcpScalar>(xi: &Vector6<T>) -> (Vector3<T>, Vector3<T>) {
    (
        Vector3::new(xi[0].clone(), xi[1].clone(), xi[2].clone()),
        Vector3::new(xi[3].clone(), xi[4].clone(), xi[5].clone()),
    )
}

/// Exponential map se(3) → SE(3).
pub fn exp<T: IcpScalar>(xi: &Vector6<T>) -> Matrix4<T> {
    let (rho, phi) = split_tangent(xi);
    let theta_sq = phi.norm_squared();
    let (a, b, cc) = rodrigues_coefficients(&theta_sq);

    let k = hat(&phi);
    let k2 = &k * &k;
    let eye = Matrix3::<T>::identity();

    let rot = &eye + &k * a + &k2 * b.clone();
    let v = eye + k * b + k2 * cc;
    from_parts(&rot, &(v * rho))
}

/// Logarithm of a rotation matrix (axis-angle vector, ‖φ‖ ≤ π).
pub fn so3_log<T: IcpScalar>(r: &Matrix3<T>) -> Vector3<T> {
    let half = c::<T>(0.5);
    let trace = r[(0, 0)].clone() + r[(1, 1)].clone() + r[(2, 2)].clone();
    // sinθ · axis
    let w = Vector3::new(
        r[(2, 1)].clone() - r[(1, 2)].clone(),
        r[(0, 2)].clone() - r[(2, 0)].clone(),
        r[(1, 0)].clone() - r[(0, 1)].clone(),
    ) * half.clone();

    // 3 - tr(R) = 2(1 - cosθ) ≈ θ²
    let s = c::<T>(3.0) - trace.clone();
    if s.value() < SMALL_ANGLE_SQ {
        // θ / sinθ expressed in s
        let scale = T::one() + s.clone() / c(6.0) + s.clone() * s / c(30.0);
        return w * scale;
    }

    let cos_theta = ((trace - T::one()) * half).clamp(-T::one(), T::one());
    let sin_theta = w.norm();
    if sin_theta.value() > NEAR_PI_SIN || cos_theta.value() > 0.0 {
        let theta = sin_theta.clone().atan2(cos_theta);
        return w * (theta / sin_theta);
    }

    near_pi_log(r, cos_theta, sin_theta.value(), &w)
}

fn near_pi_log<T: IcpScalar>(
    r: &Matrix3<T>,
    cos_theta: T,
    sin_theta: f64,
    w: &Vector3<T>,
) -> Vector3<T> {
    let one_minus_cos = T::one() - cos_theta.clone();
    let k = (0..3)
        .max_by(|&a, &b| {
            r[(a, a)]
                .value()
                .partial_cmp(&r[(b, b)].value())
                .unwrap_or(Ordering::Equal)
        })
        .unwrap_or(0);

    let ak = ((r[(k, k)].clone() - cos_theta.clone()) / one_minus_cos.clone())
        .max(T::zero())
        .sqrt();
    let denom = c::<T>(2.0) * one_minus_cos * ak.clone();

    let mut axis = Vector3::zeros();
    for j in 0..3 {
        axis[j] = if j == k {
            ak.clone()
        } else {
            (r[(k, j)].clone() + r[(j, k)].clone()) / denom.clone()
        };
    }
    if axis.dot(w).value() < 0.0 {
        axis = -axis;
    }

    let theta = c::<T>(sin_theta).atan2(cos_theta);
    axis * theta
}

/// Inverse of the SO(3) left Jacobian: `V⁻¹ = I − ½[φ]× + D [φ]×²`.
fn left_jacobian_inverse<T: IcpScalar>(phi: &Vector3<T>) -> Matrix3<T> {
    let theta_sq = phi.norm_squared();
    let d = if theta_sq.value() < SMALL_ANGLE_SQ {
        let t2 = theta_sq.clone();
        c::<T>(1.0 / 12.0) + t2.clone() / c(720.0) + t2.clone() * t2 / c(30240.0)
    } else {
        let (a, b, _) = rodrigues_coefficients(&theta_sq);
        (T::one() - a / (c::<T>(2.0) * b)) / theta_sq
    };

    let k = hat(phi);
    let k2 = &k * &k;
    Matrix3::identity() - k * c::<T>(0.5) + k2 * d
}

/// Logarithm map SE(3) → se(3).
pub fn log<T: IcpScalar>(m: &Matrix4<T>) -> Vector6<T> {
    let phi = so3_log(&rotation(m));
    let rho = left_jacobian_inverse(&phi) * translation(m);
    Vector6::new(
        rho[0].clone(),
        rho[1].clone(),
        rho[2].clone(),
        phi[0].clone(),
        phi[1].clone(),
        phi[2].clone(),
    )
}

/// Exact rigid inverse `[Rᵀ, −Rᵀt]`.
pub fn invert<T: IcpScalar>(m: &Matrix4<T>) -> Matrix4<T> {
    let rt = rotation(m).transpose();
    let t = -(&rt * translation(m));
    from_parts(&rt, &t)
}

/// Composition `a · b` (apply `b` first).
#[inline]
pub fn compose<T: IcpScalar>(a: &Matrix4<T>, b: &Matrix4<T>) -> Matrix4<T> {
    a * b
}

/// Left update `exp(δ) · T`.
#[inline]
pub fn left_update<T: IcpScalar>(delta: &Vector6<T>, m: &Matrix4<T>) -> Matrix4<T> {
    compose(&exp(delta), m)
}

/// Re-orthonormalize the rotation block (Gram-Schmidt on its columns).
pub fn orthonormalize<T: IcpScalar>(m: &Matrix4<T>) -> Matrix4<T> {
    let r = rotation(m);
    let x = r.column(0).into_owned().normalize();
    let c1 = r.column(1).into_owned();
    let y = (&c1 - &x * x.dot(&c1)).normalize();
    let z = x.cross(&y);
    from_parts(&Matrix3::from_columns(&[x, y, z]), &translation(m))
}

/// Rotation angle in radians, in [0, π].
pub fn rotation_angle(m: &Matrix4<f64>) -> f64 {
    let trace = m[(0, 0)] + m[(1, 1)] + m[(2, 2)];
    ((trace - 1.0) * 0.5).clamp(-1.0, 1.0).acos()
}

/// Heading (rotation about Z) of a transform.
pub fn yaw<T: IcpScalar>(m: &Matrix4<T>) -> T {
    m[(1, 0)].clone().atan2(m[(0, 0)].clone())
}

/// Check the SE(3) invariants: orthonormal rotation, det +1, last row `[0 0 0 1]`.
pub fn is_valid_transform(m: &Matrix4<f64>, tolerance: f64) -> bool {
    let r = rotation(m);
    let orthogonality = (r.transpose() * r - Matrix3::identity()).abs().max();
    let bottom_row_ok = m[(3, 0)].abs() < tolerance
        && m[(3, 1)].abs() < tolerance
        && m[(3, 2)].abs() < tolerance
        && (m[(3, 3)] - 1.0).abs() < tolerance;
    m.iter().all(|x| x.is_finite())
        && orthogonality < tolerance
        && (r.determinant() - 1.0).abs() < tolerance
        && bottom_row_ok
}

/// [`exp`] over a stack of tangent vectors.
pub fn exp_batch<T: IcpScalar>(xis: &[Vector6<T>]) -> Vec<Matrix4<T>> {
    xis.par_iter().map(exp).collect()
}

/// [`log`] over a stack of transforms.
pub fn log_batch<T: IcpScalar>(ms: &[Matrix4<T>]) -> Vec<Vector6<T>> {
    ms.par_iter().map(log).collect()
}

/// [`invert`] over a stack of transforms.
pub fn invert_batch<T: IcpScalar>(ms: &[Matrix4<T>]) -> Vec<Matrix4<T>> {
    ms.par_iter().map(invert).collect()
}

/// Element-wise [`compose`] of two equally long stacks.
///
/// # Errors
/// `Error::LengthMismatch` if the stacks differ in length.
pub fn compose_batch<T: IcpScalar>(
    a: &[Matrix4<T>],
    b: &[Matrix4<T>],
) -> Result<Vec<Matrix4<T>>> {
    if a.len() != b.len() {
        return Err(Error::LengthMismatch {
            what: "compose_batch right-hand stack",
            expected: a.len(),
            actual: b.len(),
        });
    }
    Ok(a.par_iter()
        .zip(b.par_iter())
        .map(|(x, y)| compose(x, y))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::{gradient, matrix_value, seed_weights};
    use approx::assert_relative_eq;
    use num_dual::DualDVec64;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn assert_matrix_eq(a: &Matrix4<f64>, b: &Matrix4<f64>, eps: f64) {
        for i in 0..4 {
            for j in 0..4 {
                assert_relative_eq!(a[(i, j)], b[(i, j)], epsilon = eps);
            }
        }
    }

    fn sample_tangents() -> Vec<Vector6<f64>> {
        vec![
            Vector6::zeros(),
            Vector6::new(0.1, -0.2, 0.3, 0.0, 0.0, 0.0),
            Vector6::new(0.0, 0.0, 0.0, 1e-9, -2e-9, 3e-9),
            Vector6::new(0.5, 0.1, -0.4, 0.003, 0.001, -0.002),
            Vector6::new(1.0, 2.0, 3.0, 0.4, -0.7, 0.2),
            Vector6::new(-0.3, 0.8, 0.1, 0.0, 0.0, FRAC_PI_2),
            Vector6::new(0.2, 0.2, 0.2, 1.5, 1.0, -1.2),
            Vector6::new(0.0, 1.0, 0.0, 0.0, 2.9, 0.0),
        ]
    }

    #[test]
    fn test_exp_zero_is_identity() {
        let m = exp(&Vector6::<f64>::zeros());
        assert_matrix_eq(&m, &Matrix4::identity(), 1e-15);
    }

    #[test]
    fn test_exp_pure_translation() {
        let m = exp(&Vector6::new(1.0, 2.0, 3.0, 0.0, 0.0, 0.0));
        assert_relative_eq!(m[(0, 3)], 1.0, epsilon = 1e-12);
        assert_relative_eq!(m[(1, 3)], 2.0, epsilon = 1e-12);
        assert_relative_eq!(m[(2, 3)], 3.0, epsilon = 1e-12);
        assert_relative_eq!(rotation_angle(&m), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_exp_yaw_rotation() {
        let angle = 5f64.to_radians();
        let m = exp(&Vector6::new(0.0, 0.0, 0.0, 0.0, 0.0, angle));
        assert_relative_eq!(yaw(&m), angle, epsilon = 1e-12);
        assert_relative_eq!(m[(0, 0)], angle.cos(), epsilon = 1e-12);
        assert_relative_eq!(m[(1, 0)], angle.sin(), epsilon = 1e-12);
    }

    #[test]
    fn test_exp_produces_valid_transforms() {
        for xi in sample_tangents() {
            assert!(is_valid_transform(&exp(&xi), 1e-10), "xi = {xi:?}");
        }
    }

    #[test]
    fn test_log_exp_roundtrip() {
        for xi in sample_tangents() {
            let recovered = log(&exp(&xi));
            for i in 0..6 {
                assert_relative_eq!(recovered[i], xi[i], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_exp_log_roundtrip() {
        for xi in sample_tangents() {
            let m = exp(&xi);
            assert_matrix_eq(&exp(&log(&m)), &m, 1e-9);
        }
    }

    #[test]
    fn test_compose_with_inverse_is_identity() {
        for xi in sample_tangents() {
            let m = exp(&xi);
            assert_matrix_eq(&compose(&m, &invert(&m)), &Matrix4::identity(), 1e-12);
            assert_matrix_eq(&compose(&invert(&m), &m), &Matrix4::identity(), 1e-12);
        }
    }

    #[test]
    fn test_compose_is_associative_not_commutative() {
        let a = exp(&Vector6::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.5));
        let b = exp(&Vector6::new(0.0, 1.0, 0.0, 0.3, 0.0, 0.0));
        let c = exp(&Vector6::new(0.0, 0.0, 1.0, 0.0, 0.2, 0.0));

        assert_matrix_eq(
            &compose(&compose(&a, &b), &c),
            &compose(&a, &compose(&b, &c)),
            1e-12,
        );
        assert!((compose(&a, &b) - compose(&b, &a)).abs().max() > 1e-3);
    }

    #[test]
    fn test_log_half_turn() {
        let m = exp(&Vector6::new(0.5, 0.0, 0.0, 0.0, 0.0, PI));
        let xi = log(&m);
        assert_relative_eq!(xi[5].abs(), PI, epsilon = 1e-9);
        assert!(xi.iter().all(|x| x.is_finite()));
        assert_matrix_eq(&exp(&xi), &m, 1e-9);
    }

    #[test]
    fn test_log_near_half_turn_off_axis() {
        let axis = Vector3::new(1.0, 2.0, -1.0).normalize();
        let phi = axis * (PI - 1e-9);
        let m = exp(&Vector6::new(0.0, 0.0, 0.0, phi[0], phi[1], phi[2]));
        let xi = log(&m);
        assert_matrix_eq(&exp(&xi), &m, 1e-7);
    }

    #[test]
    fn test_orthonormalize_repairs_drift() {
        let mut m = exp(&Vector6::new(0.1, 0.2, 0.3, 0.3, -0.2, 0.1));
        m[(0, 0)] += 1e-4;
        m[(1, 2)] -= 2e-4;
        assert!(!is_valid_transform(&m, 1e-8));

        let fixed = orthonormalize(&m);
        assert!(is_valid_transform(&fixed, 1e-12));
        assert_relative_eq!(fixed[(0, 3)], m[(0, 3)], epsilon = 1e-15);
    }

    #[test]
    fn test_batched_ops_match_single() {
        let xis = sample_tangents();
        let ms = exp_batch(&xis);
        let inv = invert_batch(&ms);
        let ids = compose_batch(&ms, &inv).unwrap();
        assert!(matches!(
            compose_batch(&ms, &inv[1..]),
            Err(Error::LengthMismatch { expected, actual, .. })
                if expected == ms.len() && actual == ms.len() - 1
        ));
        let logs = log_batch(&ms);

        for (k, xi) in xis.iter().enumerate() {
            assert_matrix_eq(&ms[k], &exp(xi), 1e-15);
            assert_matrix_eq(&ids[k], &Matrix4::identity(), 1e-12);
            for i in 0..6 {
                assert_relative_eq!(logs[k][i], xi[i], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_exp_derivative_at_zero_is_generator() {
        // d/ds exp([0, 0, 0, 0, 0, s]) at s = 0 is hat(e_z)
        let s = seed_weights(&[0.0]);
        let zero = <DualDVec64 as IcpScalar>::constant(0.0);
        let xi = Vector6::new(
            zero.clone(),
            zero.clone(),
            zero.clone(),
            zero.clone(),
            zero,
            s[0].clone(),
        );
        let m = exp(&xi);
        assert_matrix_eq(&matrix_value(&m), &Matrix4::identity(), 1e-15);

        assert_relative_eq!(gradient(&m[(1, 0)], 1)[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(gradient(&m[(0, 1)], 1)[0], -1.0, epsilon = 1e-12);
        assert_relative_eq!(gradient(&m[(0, 0)], 1)[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_log_derivative_at_identity_is_finite() {
        let s = seed_weights(&[0.0]);
        let xi = Vector6::new(
            s[0].clone(),
            <DualDVec64 as IcpScalar>::constant(0.0),
            <DualDVec64 as IcpScalar>::constant(0.0),
            <DualDVec64 as IcpScalar>::constant(0.0),
            <DualDVec64 as IcpScalar>::constant(0.0),
            s[0].clone(),
        );
        let back = log(&exp(&xi));
        for i in 0..6 {
            let g = gradient(&back[i], 1)[0];
            assert!(g.is_finite());
            let expected = if i == 0 || i == 5 { 1.0 } else { 0.0 };
            assert_relative_eq!(g, expected, epsilon = 1e-10);
        }
    }
}

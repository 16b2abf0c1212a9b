//! Training and validation losses.
//!
//! The pose loss is generic over [`IcpScalar`] so it can run inside the
//! differentiable alignment pass and hand back dL/dw directly.

use dicp::{se3, IcpScalar, PoseLoss};
use nalgebra::{DMatrix, DVector, Matrix4};
use serde::{Deserialize, Serialize};

use crate::params::LossWeights;

/// Lower clamp on the BCE log terms.
const BCE_LOG_FLOOR: f64 = -100.0;

const BCE_GRAD_EPS: f64 = 1e-12;

/// Translation and rotation parts of a pose error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseError<T> {
    /// ‖E[0..2, 3]‖
    pub trans: T,
    /// |E[1, 0]|
    pub rot: T,
}

/// Planar pose error of a prediction.
///
/// E = T_pred − I when `ground_truth` is `None` (identity frame), otherwise
/// E = T_pred·T_gt⁻¹ − I.
pub fn pose_error<T: IcpScalar>(
    predicted: &Matrix4<T>,
    ground_truth: Option<&Matrix4<f64>>,
) -> PoseError<T> {
    let relative = match ground_truth {
        None => predicted.clone(),
        Some(gt) => predicted * se3::invert(gt).map(T::constant),
    };
    let ex = relative[(0, 3)].clone();
    let ey = relative[(1, 3)].clone();
    let sq = ex.clone() * ex + ey.clone() * ey;
    // sqrt has no derivative at 0
    let trans = if sq.value() > 0.0 {
        sq.sqrt()
    } else {
        T::constant(0.0)
    };
    let e10 = relative[(1, 0)].clone();
    let rot = if e10.value() < 0.0 { -e10 } else { e10 };
    PoseError { trans, rot }
}

/// Batch-mean pose loss, weighted by `icp_rot` / `icp_trans`.
///
/// Each element's term is divided by the batch size so that per-element
/// gradients add up to the gradient of the batch mean.
#[derive(Debug, Clone)]
pub struct BatchPoseLoss {
    pub ground_truths: Vec<Matrix4<f64>>,
    pub gt_eye: bool,
    pub weights: LossWeights,
}

impl BatchPoseLoss {
    /// Ground truth of `element`, or `None` in the identity frame.
    pub fn ground_truth(&self, element: usize) -> Option<&Matrix4<f64>> {
        if self.gt_eye {
            None
        } else {
            self.ground_truths.get(element)
        }
    }
}

impl PoseLoss for BatchPoseLoss {
    fn evaluate<T: IcpScalar>(&self, element: usize, transform: &Matrix4<T>) -> T {
        let err = pose_error(transform, self.ground_truth(element));
        let scale = 1.0 / self.ground_truths.len().max(1) as f64;
        let weighted = err.rot * T::constant(self.weights.icp_rot)
            + err.trans * T::constant(self.weights.icp_trans);
        weighted * T::constant(scale)
    }
}

/// Mean binary cross-entropy between a predicted mask and a 0/1 target.
///
/// # Returns
/// The loss and its gradient with respect to every predicted pixel.
pub fn bce_loss(predicted: &DMatrix<f64>, target: &DMatrix<f64>) -> (f64, DMatrix<f64>) {
    let n = predicted.len().max(1) as f64;
    let loss = predicted
        .iter()
        .zip(target.iter())
        .map(|(&p, &t)| {
            let log_p = p.ln().max(BCE_LOG_FLOOR);
            let log_q = (1.0 - p).ln().max(BCE_LOG_FLOOR);
            -(t * log_p + (1.0 - t) * log_q)
        })
        .sum::<f64>()
        / n;
    let grad = predicted.zip_map(target, |p, t| {
        (p - t) / (p * (1.0 - p)).max(BCE_GRAD_EPS) / n
    });
    (loss, grad)
}

/// Penalty on points the mask ignores: `len − Σw` per element, averaged.
///
/// This is a soft count, not the hard `len − #{w > 0}`. The hard count has
/// zero gradient almost everywhere, so the weight sum stands in for it. The
/// two agree only for binary weights: a uniform 0.5 mask is charged half the
/// scan here, while the hard count would see no ignored point. The gradient
/// is −1 / batch size for every point.
pub fn point_count_loss(weights: &[&[f64]]) -> (f64, Vec<DVector<f64>>) {
    let b = weights.len().max(1) as f64;
    let loss = weights
        .iter()
        .map(|w| w.len() as f64 - w.iter().sum::<f64>())
        .sum::<f64>()
        / b;
    let grads = weights
        .iter()
        .map(|w| DVector::from_element(w.len(), -1.0 / b))
        .collect();
    (loss, grads)
}

/// Weighted loss terms of one training step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossComponents {
    pub rot: f64,
    pub trans: f64,
    pub fft: f64,
    pub cfar: f64,
    pub num_pts: f64,
}

impl LossComponents {
    pub fn total(&self) -> f64 {
        self.rot + self.trans + self.fft + self.cfar + self.num_pts
    }
}

/// Validation pose error from the tangent of the residual transform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    /// ‖ξ‖
    pub total: f64,
    /// ‖φ‖ (radians)
    pub rotation: f64,
    /// ‖ρ‖ (metres)
    pub translation: f64,
}

impl ValidationError {
    /// ξ = log(T_pred·T_gt⁻¹), or log(T_pred) in the identity frame.
    pub fn new(predicted: &Matrix4<f64>, ground_truth: Option<&Matrix4<f64>>) -> Self {
        let residual = match ground_truth {
            None => *predicted,
            Some(gt) => se3::compose(predicted, &se3::invert(gt)),
        };
        let xi = se3::log(&residual);
        let (rho, phi) = se3::split_tangent(&xi);
        Self {
            total: xi.norm(),
            rotation: phi.norm(),
            translation: rho.norm(),
        }
    }

    /// Component-wise mean.
    pub fn mean(errors: &[ValidationError]) -> Self {
        if errors.is_empty() {
            return Self::default();
        }
        let n = errors.len() as f64;
        Self {
            total: errors.iter().map(|e| e.total).sum::<f64>() / n,
            rotation: errors.iter().map(|e| e.rotation).sum::<f64>() / n,
            translation: errors.iter().map(|e| e.translation).sum::<f64>() / n,
        }
    }
}

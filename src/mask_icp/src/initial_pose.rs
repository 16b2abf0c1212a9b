//! Perturbed initial guesses for training.
//!
//! A perturbation is drawn in the tangent space with only the planar
//! components set: ξ = [pos_std·a, pos_std·b, 0, 0, 0, rot_std·c], where
//! a, b, c come from the chosen distribution. The initial guess is
//! exp(ξ) when the ground truth is the identity frame, otherwise exp(ξ)·T_gt.

use anyhow::{Context, Result};
use dicp::se3;
use nalgebra::{Matrix4, Vector6};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};

use crate::params::TrainingParams;

/// Distribution of the unit draws scaled by `pos_std` / `rot_std`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerturbationDistribution {
    /// Uniform on [0, 1).
    #[default]
    Uniform,
    /// Standard normal.
    Normal,
}

/// Draw a planar perturbation tangent.
///
/// # Arguments
/// * `rng` - Random source
/// * `pos_std` - Scale of x and y
/// * `rot_std` - Scale of yaw
/// * `distribution` - Distribution of the unit draws
pub fn sample_perturbation<R: Rng + ?Sized>(
    rng: &mut R,
    pos_std: f64,
    rot_std: f64,
    distribution: PerturbationDistribution,
) -> Result<Vector6<f64>> {
    let mut draws = [0.0; 3];
    match distribution {
        PerturbationDistribution::Uniform => {
            let dist = Uniform::new(0.0, 1.0);
            for d in &mut draws {
                *d = dist.sample(rng);
            }
        }
        PerturbationDistribution::Normal => {
            let dist = Normal::new(0.0, 1.0).context("Invalid normal distribution")?;
            for d in &mut draws {
                *d = dist.sample(rng);
            }
        }
    }
    Ok(Vector6::new(
        pos_std * draws[0],
        pos_std * draws[1],
        0.0,
        0.0,
        0.0,
        rot_std * draws[2],
    ))
}

/// Combine a perturbation with the ground truth.
pub fn perturbed_guess(
    perturbation: &Matrix4<f64>,
    ground_truth: &Matrix4<f64>,
    gt_eye: bool,
) -> Matrix4<f64> {
    if gt_eye {
        *perturbation
    } else {
        se3::compose(perturbation, ground_truth)
    }
}

/// Seeded source of initial guesses.
#[derive(Debug, Clone)]
pub struct PerturbationSampler {
    pos_std: f64,
    rot_std: f64,
    distribution: PerturbationDistribution,
    use_gt: bool,
    gt_eye: bool,
    rng: StdRng,
}

impl PerturbationSampler {
    /// Create a sampler from the training parameters.
    pub fn from_params(params: &TrainingParams) -> Self {
        Self {
            pos_std: params.pos_std,
            rot_std: params.rot_std,
            distribution: params.perturbation,
            use_gt: params.use_gt,
            gt_eye: params.gt_eye,
            rng: StdRng::seed_from_u64(params.seed),
        }
    }

    /// Next perturbation tangent.
    pub fn sample_tangent(&mut self) -> Result<Vector6<f64>> {
        sample_perturbation(&mut self.rng, self.pos_std, self.rot_std, self.distribution)
    }

    /// Initial guess for one sample.
    ///
    /// With `use_gt` the guess is the ground truth itself (the identity when
    /// `gt_eye` is set) and no randomness is consumed.
    pub fn initial_guess(&mut self, ground_truth: &Matrix4<f64>) -> Result<Matrix4<f64>> {
        if self.use_gt {
            return Ok(if self.gt_eye {
                Matrix4::identity()
            } else {
                *ground_truth
            });
        }
        let xi = self.sample_tangent()?;
        Ok(perturbed_guess(&se3::exp(&xi), ground_truth, self.gt_eye))
    }

    /// Initial guesses for a batch of ground truths.
    pub fn initial_guesses(&mut self, ground_truths: &[Matrix4<f64>]) -> Result<Vec<Matrix4<f64>>> {
        ground_truths.iter().map(|gt| self.initial_guess(gt)).collect()
    }
}

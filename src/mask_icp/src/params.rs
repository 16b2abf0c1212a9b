//! Training parameters

use std::path::Path;

use anyhow::{bail, Context, Result};
use dicp::masking::{
    DEFAULT_CARTESIAN_RESOLUTION, DEFAULT_CARTESIAN_WIDTH, DEFAULT_FFT_FACTOR,
    DEFAULT_POLAR_RESOLUTION,
};
use dicp::{IcpConfig, ResidualMode};
use serde::{Deserialize, Serialize};

use crate::initial_pose::PerturbationDistribution;

/// Layout of the mask the network produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskLayout {
    #[default]
    Cartesian,
    Polar,
}

/// Weights of the training loss terms
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossWeights {
    /// Rotation part of the pose loss
    pub icp_rot: f64,
    /// Translation part of the pose loss
    pub icp_trans: f64,
    /// BCE against the FFT threshold mask
    pub fft: f64,
    /// BCE against the CFAR mask
    pub cfar: f64,
    /// Penalty on ignored points
    pub num_pts: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            icp_rot: 1.0,
            icp_trans: 1.0,
            fft: 0.0,
            cfar: 0.1,
            num_pts: 0.0,
        }
    }
}

impl LossWeights {
    /// Whether the pose loss contributes at all.
    pub fn uses_pose(&self) -> bool {
        self.icp_rot > 0.0 || self.icp_trans > 0.0
    }
}

/// All training parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Start every alignment at the ground truth instead of a perturbation
    pub use_gt: bool,
    /// Scale of the position perturbation (metres)
    pub pos_std: f64,
    /// Scale of the yaw perturbation (radians)
    pub rot_std: f64,
    pub perturbation: PerturbationDistribution,
    /// Ground truth is the identity (map already expressed in the scan frame)
    pub gt_eye: bool,
    pub seed: u64,

    pub icp_type: ResidualMode,
    pub max_iter: usize,
    /// Extra ICP options; `icp_type` and `max_iter` take precedence
    pub icp: IcpConfig,

    pub loss: LossWeights,
    /// Epoch from which only the pose loss is used; `<= 0` disables the switch
    pub icp_loss_only_iter: i64,

    pub network_output_type: MaskLayout,
    /// Binarize weights during validation
    pub binary_inference: bool,
    /// Mask values below this are dropped
    pub mask_threshold: f64,
    pub cartesian_resolution: f64,
    pub cartesian_width: usize,
    pub polar_resolution: f64,
    pub fft_factor: f64,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            use_gt: false,
            pos_std: 2.0,
            rot_std: 0.3,
            perturbation: PerturbationDistribution::Uniform,
            gt_eye: true,
            seed: 99,
            icp_type: ResidualMode::Pt2Pt,
            max_iter: 8,
            icp: IcpConfig::default(),
            loss: LossWeights::default(),
            icp_loss_only_iter: -1,
            network_output_type: MaskLayout::Cartesian,
            binary_inference: false,
            mask_threshold: 0.0,
            cartesian_resolution: DEFAULT_CARTESIAN_RESOLUTION,
            cartesian_width: DEFAULT_CARTESIAN_WIDTH,
            polar_resolution: DEFAULT_POLAR_RESOLUTION,
            fft_factor: DEFAULT_FFT_FACTOR,
        }
    }
}

impl TrainingParams {
    /// Parse parameters from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(json).context("Failed to parse training params")?;
        params.validate()?;
        Ok(params)
    }

    /// Load parameters from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read training params from {}", path.display()))?;
        Self::from_json_str(&json)
    }

    /// ICP configuration with `icp_type` and `max_iter` applied.
    pub fn icp_config(&self) -> IcpConfig {
        IcpConfig {
            mode: self.icp_type,
            max_iterations: self.max_iter,
            ..self.icp.clone()
        }
    }

    /// Reject parameter combinations no step can run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.pos_std >= 0.0 && self.rot_std >= 0.0) {
            bail!(
                "Perturbation scales must be non-negative (pos_std={}, rot_std={})",
                self.pos_std,
                self.rot_std
            );
        }
        let loss = &self.loss;
        let weights = [loss.icp_rot, loss.icp_trans, loss.fft, loss.cfar, loss.num_pts];
        if weights.iter().any(|w| !(w.is_finite() && *w >= 0.0)) {
            bail!("Loss weights must be non-negative: {loss:?}");
        }
        if !(self.cartesian_resolution > 0.0 && self.polar_resolution > 0.0) {
            bail!("Mask resolutions must be positive");
        }
        if self.cartesian_width == 0 {
            bail!("cartesian_width must be positive");
        }
        if !(self.mask_threshold >= 0.0 && self.mask_threshold <= 1.0) {
            bail!("mask_threshold must be in [0, 1], got {}", self.mask_threshold);
        }
        self.icp_config()
            .validate()
            .context("Invalid ICP configuration")?;
        Ok(())
    }

    /// Whether mask supervision terms apply at `epoch`.
    pub fn mask_losses_active(&self, epoch: usize) -> bool {
        self.icp_loss_only_iter <= 0
            || (epoch as i64) < self.icp_loss_only_iter
            || !self.loss.uses_pose()
    }
}

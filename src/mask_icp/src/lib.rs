//! Training-side glue for learning ICP confidence masks.
//!
//! A [`MaskTrainer`] takes an injected [`MaskModel`], weights each radar scan
//! by the predicted mask, aligns it to its map with [`dicp::IcpAligner`] and
//! returns the loss together with dL/dmask.
//!
//! # Modules
//!
//! - [`params`]: training parameters, loadable from JSON
//! - [`initial_pose`]: seeded perturbed initial guesses
//! - [`loss`]: pose, point-count and mask supervision losses
//! - [`diagnostics`]: per-batch summaries with severity levels
//! - [`pipeline`]: training, validation and baseline steps

pub mod diagnostics;
pub mod initial_pose;
pub mod loss;
pub mod params;
pub mod pipeline;

pub use diagnostics::{BatchSummary, DiagnosticCategory, DiagnosticLevel, ExecutionTimer};
pub use initial_pose::{PerturbationDistribution, PerturbationSampler};
pub use loss::{BatchPoseLoss, LossComponents, PoseError, ValidationError};
pub use params::{LossWeights, MaskLayout, TrainingParams};
pub use pipeline::{
    BaselineMask, BaselineOutput, MaskModel, MaskTrainer, RadarScan, StepOutput, TrainingSample,
    ValidationOutput,
};

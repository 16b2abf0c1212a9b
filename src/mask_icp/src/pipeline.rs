//! Training, validation and baseline steps.
//!
//! A step runs the injected mask model on every scan, weights the scan points
//! by the predicted mask, aligns each scan to its map through the
//! differentiable aligner, and returns the loss together with dL/dmask for
//! the model's own backward pass.

use anyhow::{bail, ensure, Context, Result};
use dicp::{
    apply_mask, fft_threshold_mask, polar_to_cartesian, scatter_gradient, Batch, BatchElement,
    ConfidenceMask, Dimension, IcpAligner, IcpResult, MaskOverride, MaskedPointSet, MaskingConfig,
    PointSet, PoseLoss, ResidualMode,
};
use nalgebra::{DMatrix, DVector, Matrix4};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::diagnostics::{BatchSummary, DiagnosticCategory, ExecutionTimer};
use crate::initial_pose::PerturbationSampler;
use crate::loss::{
    bce_loss, point_count_loss, pose_error, BatchPoseLoss, LossComponents, ValidationError,
};
use crate::params::{MaskLayout, TrainingParams};

/// One radar scan as the mask model sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct RadarScan {
    /// Detected points in the sensor frame.
    pub points: PointSet,
    /// Polar power image (azimuths × range bins).
    pub fft: Option<DMatrix<f64>>,
    /// Azimuth of each `fft` row in radians.
    pub azimuths: Vec<f64>,
    /// Classical CFAR detections, in the network's layout.
    pub cfar: Option<ConfidenceMask>,
}

impl RadarScan {
    pub fn new(points: PointSet) -> Self {
        Self {
            points,
            fft: None,
            azimuths: Vec::new(),
            cfar: None,
        }
    }

    pub fn with_fft(mut self, fft: DMatrix<f64>, azimuths: Vec<f64>) -> Self {
        self.fft = Some(fft);
        self.azimuths = azimuths;
        self
    }

    pub fn with_cfar(mut self, cfar: ConfidenceMask) -> Self {
        self.cfar = Some(cfar);
        self
    }
}

/// Network that maps a scan to a confidence mask.
pub trait MaskModel {
    fn predict(&self, scan: &RadarScan) -> Result<ConfidenceMask>;
}

impl<F> MaskModel for F
where
    F: Fn(&RadarScan) -> Result<ConfidenceMask>,
{
    fn predict(&self, scan: &RadarScan) -> Result<ConfidenceMask> {
        self(scan)
    }
}

/// A scan, the map it should be aligned to, and the poses involved.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSample {
    pub scan: RadarScan,
    pub map: PointSet,
    /// Scan-to-map transform; ignored when `gt_eye` is set.
    pub ground_truth: Matrix4<f64>,
    pub initial_guess: Matrix4<f64>,
}

impl TrainingSample {
    /// Sample whose initial guess is the ground truth until perturbed.
    pub fn new(scan: RadarScan, map: PointSet, ground_truth: Matrix4<f64>) -> Self {
        Self {
            scan,
            map,
            ground_truth,
            initial_guess: ground_truth,
        }
    }
}

/// Result of one training step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub loss: f64,
    pub components: LossComponents,
    /// dL/dmask per sample, shaped like the predicted mask.
    pub mask_gradients: Vec<DMatrix<f64>>,
    pub summary: BatchSummary,
    pub diagnostics: DiagnosticCategory,
    pub results: Vec<IcpResult<f64>>,
}

/// Result of one validation step.
#[derive(Debug, Clone)]
pub struct ValidationOutput {
    pub errors: Vec<ValidationError>,
    pub mean_error: ValidationError,
    /// Weighted pose loss of the final transforms.
    pub pose_loss: f64,
    pub summary: BatchSummary,
    pub diagnostics: DiagnosticCategory,
    pub results: Vec<IcpResult<f64>>,
}

/// Mask used in place of the model for baseline runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineMask {
    /// Every point counts.
    Ones,
    /// FFT threshold detector.
    Fft,
    /// CFAR detector.
    Cfar,
}

/// Errors and pose losses before and after aligning with a baseline mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineOutput {
    pub mask: BaselineMask,
    pub initial_error: ValidationError,
    pub initial_loss: f64,
    pub aligned_error: ValidationError,
    pub aligned_loss: f64,
    pub summary: BatchSummary,
}

/// Drives mask models through differentiable ICP.
pub struct MaskTrainer {
    params: TrainingParams,
    aligner: IcpAligner,
    sampler: PerturbationSampler,
}

impl MaskTrainer {
    /// Create a trainer, validating the parameters.
    pub fn new(params: TrainingParams) -> Result<Self> {
        params.validate()?;
        let config = params.icp_config();
        if config.mode == ResidualMode::Pt2Pl && config.dimension == Dimension::Spatial {
            warn!(
                "point-to-plane in 6-DOF holds every planar scan as under-constrained; \
                 set icp.dimension to Planar"
            );
        }
        let aligner = IcpAligner::new(config).context("Failed to create aligner")?;
        let sampler = PerturbationSampler::from_params(&params);
        Ok(Self {
            params,
            aligner,
            sampler,
        })
    }

    pub fn params(&self) -> &TrainingParams {
        &self.params
    }

    pub fn aligner(&self) -> &IcpAligner {
        &self.aligner
    }

    /// Draw a fresh initial guess for every sample.
    pub fn perturb(&mut self, samples: &mut [TrainingSample]) -> Result<()> {
        for sample in samples.iter_mut() {
            sample.initial_guess = self.sampler.initial_guess(&sample.ground_truth)?;
        }
        Ok(())
    }

    /// Forward and backward pass for one batch.
    ///
    /// # Arguments
    /// * `model` - Mask network
    /// * `samples` - Batch of scans with their maps and initial guesses
    /// * `epoch` - Current epoch; mask supervision stops at `icp_loss_only_iter`
    ///
    /// # Returns
    /// Total loss, its weighted terms, and dL/dmask per sample.
    pub fn training_step<M: MaskModel + ?Sized>(
        &self,
        model: &M,
        samples: &[TrainingSample],
        epoch: usize,
    ) -> Result<StepOutput> {
        ensure!(!samples.is_empty(), "Training step needs at least one sample");
        let timer = ExecutionTimer::new();
        let weights = self.params.loss;
        let batch_size = samples.len() as f64;

        let masks = self.predict(model, samples)?;
        let config = MaskingConfig {
            threshold: self.params.mask_threshold,
            ..Default::default()
        };
        let masked = weigh_samples(samples, &masks, &config)?;
        let batch = self.batch(samples, &masked);

        let mut components = LossComponents::default();
        let (results, mut point_grads): (Vec<_>, Vec<_>) = if weights.uses_pose() {
            let pose_loss = self.pose_loss(samples);
            let grads = self.aligner.align_with(&batch, &pose_loss);
            for (i, g) in grads.iter().enumerate() {
                let err = pose_error(&g.result.transform, pose_loss.ground_truth(i));
                components.rot += weights.icp_rot * err.rot / batch_size;
                components.trans += weights.icp_trans * err.trans / batch_size;
            }
            grads.into_iter().map(|g| (g.result, g.gradient)).unzip()
        } else {
            let results = self.aligner.align(&batch);
            let zeros: Vec<DVector<f64>> = masked
                .iter()
                .map(|m| DVector::zeros(m.point_set.len()))
                .collect();
            (results, zeros)
        };

        let mask_losses = self.params.mask_losses_active(epoch);
        if mask_losses && weights.num_pts > 0.0 {
            let point_weights: Vec<&[f64]> =
                masked.iter().map(|m| m.point_set.weights()).collect();
            let (loss, grads) = point_count_loss(&point_weights);
            components.num_pts = weights.num_pts * loss;
            for (acc, g) in point_grads.iter_mut().zip(grads) {
                *acc += g * weights.num_pts;
            }
        }

        let mut mask_gradients = masked
            .par_iter()
            .zip(point_grads.par_iter())
            .map(|(m, g)| scatter_gradient(g.as_slice(), &m.pixel_indices, m.mask_shape))
            .collect::<dicp::Result<Vec<_>>>()?;

        if mask_losses && weights.fft > 0.0 {
            let targets = samples
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    self.fft_mask(&s.scan)
                        .with_context(|| format!("FFT supervision for sample {i}"))
                })
                .collect::<Result<Vec<_>>>()?;
            components.fft =
                add_supervision(&masks, &targets, weights.fft, &mut mask_gradients)?;
        }
        if mask_losses && weights.cfar > 0.0 {
            let targets = samples
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    s.scan
                        .cfar
                        .clone()
                        .with_context(|| format!("CFAR loss is enabled but sample {i} has no CFAR mask"))
                })
                .collect::<Result<Vec<_>>>()?;
            components.cfar =
                add_supervision(&masks, &targets, weights.cfar, &mut mask_gradients)?;
        }

        let stats: Vec<_> = masked.iter().map(|m| m.stats).collect();
        let summary = BatchSummary::new(&results, &stats, timer.elapsed_ms());
        let mut diagnostics = DiagnosticCategory::new("training_step");
        summary.apply_to(&mut diagnostics);
        diagnostics.add_key_value("epoch", epoch);
        diagnostics.add_key_value("mask_losses_active", mask_losses);

        let loss = components.total();
        info!(
            epoch,
            loss,
            rot = components.rot,
            trans = components.trans,
            fft = components.fft,
            cfar = components.cfar,
            num_pts = components.num_pts,
            mean_num_pts = summary.mean_num_pts,
            "training step"
        );

        Ok(StepOutput {
            loss,
            components,
            mask_gradients,
            summary,
            diagnostics,
            results,
        })
    }

    /// Align with the model's masks and measure the pose error; no gradients.
    ///
    /// Weights are binarized when `binary_inference` is set.
    pub fn validation_step<M: MaskModel + ?Sized>(
        &self,
        model: &M,
        samples: &[TrainingSample],
    ) -> Result<ValidationOutput> {
        ensure!(!samples.is_empty(), "Validation step needs at least one sample");
        let timer = ExecutionTimer::new();

        let masks = self.predict(model, samples)?;
        let config = MaskingConfig {
            threshold: self.params.mask_threshold,
            binary: self.params.binary_inference,
            ..Default::default()
        };
        let masked = weigh_samples(samples, &masks, &config)?;
        self.evaluate(samples, &masked, timer, "validation_step")
    }

    /// Pose errors at the initial guesses and after aligning with a fixed mask.
    pub fn baseline(&self, samples: &[TrainingSample], mask: BaselineMask) -> Result<BaselineOutput> {
        ensure!(!samples.is_empty(), "Baseline needs at least one sample");
        let timer = ExecutionTimer::new();

        let masked = samples
            .iter()
            .enumerate()
            .map(|(i, s)| {
                self.baseline_weights(&s.scan, mask)
                    .with_context(|| format!("Baseline {mask:?} mask for sample {i}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let pose_loss = self.pose_loss(samples);
        let initial: Vec<_> = samples
            .iter()
            .enumerate()
            .map(|(i, s)| ValidationError::new(&s.initial_guess, pose_loss.ground_truth(i)))
            .collect();
        let initial_loss = samples
            .iter()
            .enumerate()
            .map(|(i, s)| pose_loss.evaluate(i, &s.initial_guess))
            .sum::<f64>();

        let aligned = self.evaluate(samples, &masked, timer, "baseline")?;
        Ok(BaselineOutput {
            mask,
            initial_error: ValidationError::mean(&initial),
            initial_loss,
            aligned_error: aligned.mean_error,
            aligned_loss: aligned.pose_loss,
            summary: aligned.summary,
        })
    }

    fn predict<M: MaskModel + ?Sized>(
        &self,
        model: &M,
        samples: &[TrainingSample],
    ) -> Result<Vec<ConfidenceMask>> {
        samples
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mask = model
                    .predict(&s.scan)
                    .with_context(|| format!("Mask model failed on sample {i}"))?;
                self.check_layout(&mask)
                    .with_context(|| format!("Mask model output for sample {i}"))?;
                Ok(mask)
            })
            .collect()
    }

    fn check_layout(&self, mask: &ConfidenceMask) -> Result<()> {
        match (self.params.network_output_type, mask) {
            (MaskLayout::Cartesian, ConfidenceMask::Cartesian { .. })
            | (MaskLayout::Polar, ConfidenceMask::Polar { .. }) => Ok(()),
            (expected, _) => bail!("Expected a {expected:?} mask"),
        }
    }

    fn batch(&self, samples: &[TrainingSample], masked: &[MaskedPointSet]) -> Batch {
        samples
            .iter()
            .zip(masked)
            .map(|(s, m)| BatchElement::new(m.point_set.clone(), s.map.clone(), s.initial_guess))
            .collect()
    }

    fn pose_loss(&self, samples: &[TrainingSample]) -> BatchPoseLoss {
        BatchPoseLoss {
            ground_truths: samples.iter().map(|s| s.ground_truth).collect(),
            gt_eye: self.params.gt_eye,
            weights: self.params.loss,
        }
    }

    /// FFT detector mask in the network's layout.
    fn fft_mask(&self, scan: &RadarScan) -> Result<ConfidenceMask> {
        let Some(fft) = &scan.fft else {
            bail!("Scan has no FFT image");
        };
        let polar = fft_threshold_mask(fft, self.params.fft_factor);
        let mask = match self.params.network_output_type {
            MaskLayout::Polar => {
                ConfidenceMask::polar(polar, scan.azimuths.clone(), self.params.polar_resolution)?
            }
            MaskLayout::Cartesian => {
                let data = polar_to_cartesian(
                    &polar,
                    &scan.azimuths,
                    self.params.polar_resolution,
                    self.params.cartesian_resolution,
                    self.params.cartesian_width,
                )?;
                ConfidenceMask::cartesian(data, self.params.cartesian_resolution)?
            }
        };
        Ok(mask)
    }

    /// All-ones mask in the network's layout.
    fn ones_mask(&self, scan: &RadarScan) -> Result<ConfidenceMask> {
        let mask = match self.params.network_output_type {
            MaskLayout::Cartesian => {
                let width = self.params.cartesian_width;
                ConfidenceMask::cartesian(
                    DMatrix::from_element(width, width, 1.0),
                    self.params.cartesian_resolution,
                )?
            }
            MaskLayout::Polar => {
                let Some(fft) = &scan.fft else {
                    bail!("A polar ones mask takes its shape from the FFT image");
                };
                ConfidenceMask::polar(
                    DMatrix::from_element(fft.nrows(), fft.ncols(), 1.0),
                    scan.azimuths.clone(),
                    self.params.polar_resolution,
                )?
            }
        };
        Ok(mask)
    }

    fn baseline_weights(&self, scan: &RadarScan, mask: BaselineMask) -> Result<MaskedPointSet> {
        let (template, mask_override) = match mask {
            BaselineMask::Ones => (self.ones_mask(scan)?, MaskOverride::Ones),
            BaselineMask::Fft => {
                let fft = self.fft_mask(scan)?;
                (fft.clone(), MaskOverride::External { mask: fft })
            }
            BaselineMask::Cfar => {
                let Some(cfar) = scan.cfar.clone() else {
                    bail!("Scan has no CFAR mask");
                };
                (cfar.clone(), MaskOverride::External { mask: cfar })
            }
        };
        let config = MaskingConfig {
            mask_override: Some(mask_override),
            ..Default::default()
        };
        Ok(apply_mask(&scan.points, &template, &config)?)
    }

    /// Plain alignment plus validation errors and pose loss.
    fn evaluate(
        &self,
        samples: &[TrainingSample],
        masked: &[MaskedPointSet],
        timer: ExecutionTimer,
        name: &str,
    ) -> Result<ValidationOutput> {
        let batch = self.batch(samples, masked);
        let results = self.aligner.align(&batch);

        let pose_loss = self.pose_loss(samples);
        let errors: Vec<_> = results
            .iter()
            .enumerate()
            .map(|(i, r)| ValidationError::new(&r.transform, pose_loss.ground_truth(i)))
            .collect();
        let loss = results
            .iter()
            .enumerate()
            .map(|(i, r)| pose_loss.evaluate(i, &r.transform))
            .sum::<f64>();
        for (i, (r, e)) in results.iter().zip(&errors).enumerate() {
            debug!(sample = i, status = %r.status, rotation = e.rotation, translation = e.translation);
        }

        let stats: Vec<_> = masked.iter().map(|m| m.stats).collect();
        let summary = BatchSummary::new(&results, &stats, timer.elapsed_ms());
        let mut diagnostics = DiagnosticCategory::new(name);
        summary.apply_to(&mut diagnostics);
        let mean_error = ValidationError::mean(&errors);
        diagnostics.add_key_value("rotation_error", format!("{:.6}", mean_error.rotation));
        diagnostics.add_key_value("translation_error", format!("{:.6}", mean_error.translation));
        if summary.degenerate() > 0 {
            warn!(degenerate = summary.degenerate(), "{name}: elements held their estimate");
        }
        info!(
            rotation = mean_error.rotation,
            translation = mean_error.translation,
            pose_loss = loss,
            "{name}"
        );

        Ok(ValidationOutput {
            errors,
            mean_error,
            pose_loss: loss,
            summary,
            diagnostics,
            results,
        })
    }
}

fn weigh_samples(
    samples: &[TrainingSample],
    masks: &[ConfidenceMask],
    config: &MaskingConfig,
) -> Result<Vec<MaskedPointSet>> {
    samples
        .par_iter()
        .zip(masks.par_iter())
        .map(|(s, mask)| apply_mask(&s.scan.points, mask, config))
        .collect::<dicp::Result<Vec<_>>>()
        .context("Failed to weight scan points")
}

/// Add a weighted, batch-averaged BCE term against `targets`.
///
/// # Returns
/// The weighted loss term.
fn add_supervision(
    predicted: &[ConfidenceMask],
    targets: &[ConfidenceMask],
    weight: f64,
    mask_gradients: &mut [DMatrix<f64>],
) -> Result<f64> {
    let scale = weight / predicted.len().max(1) as f64;
    let mut total = 0.0;
    for (i, ((pred, target), grad)) in predicted
        .iter()
        .zip(targets)
        .zip(mask_gradients.iter_mut())
        .enumerate()
    {
        ensure!(
            pred.shape() == target.shape(),
            "Sample {i}: supervision mask is {:?} but the prediction is {:?}",
            target.shape(),
            pred.shape()
        );
        let (loss, g) = bce_loss(pred.data(), target.data());
        total += scale * loss;
        *grad += g * scale;
    }
    Ok(total)
}

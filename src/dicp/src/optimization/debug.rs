//! Debug types for ICP iteration tracking.
//!
//! These capture the state of each iteration so that a run can be dumped as
//! JSON and inspected or diffed offline.

use nalgebra::{Matrix4, Matrix6, Vector6};
use serde::Serialize;

use crate::se3;

/// Debug information captured at each iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IterationDebug {
    /// Iteration number (0-indexed).
    pub iteration: usize,

    /// Pose at the start of this iteration as a tangent [ρ; φ].
    pub pose: Vec<f64>,

    /// Weighted cost at the current pose.
    pub cost: f64,

    /// Gradient vector (6 elements).
    pub gradient: Vec<f64>,

    /// Hessian matrix (6x6, stored as flat array row-major).
    pub hessian: Vec<f64>,

    /// Update step.
    pub step: Vec<f64>,

    /// Update step norm.
    pub step_norm: f64,

    /// Whether the step came from the regularized fallback.
    pub regularized: bool,

    /// Valid correspondences.
    pub num_valid: usize,

    /// Active source points.
    pub num_active: usize,

    /// RMS distance of valid correspondences.
    pub inlier_rmse: f64,

    /// Whether the step norm was below the convergence threshold.
    pub converged: bool,

    /// Pose after applying the step.
    pub pose_after: Vec<f64>,
}

impl IterationDebug {
    /// Create a new iteration debug with default values.
    pub fn new(iteration: usize) -> Self {
        Self {
            iteration,
            pose: vec![0.0; 6],
            cost: 0.0,
            gradient: vec![0.0; 6],
            hessian: vec![0.0; 36],
            step: vec![0.0; 6],
            step_norm: 0.0,
            regularized: false,
            num_valid: 0,
            num_active: 0,
            inlier_rmse: 0.0,
            converged: false,
            pose_after: vec![0.0; 6],
        }
    }

    /// Set pose from a transform.
    pub fn set_pose(&mut self, pose: &Matrix4<f64>) {
        self.pose = se3::log(pose).iter().copied().collect();
    }

    /// Set pose_after from a transform.
    pub fn set_pose_after(&mut self, pose: &Matrix4<f64>) {
        self.pose_after = se3::log(pose).iter().copied().collect();
    }

    /// Set gradient from nalgebra Vector6.
    pub fn set_gradient(&mut self, g: &Vector6<f64>) {
        self.gradient = (0..6).map(|i| g[i]).collect();
    }

    /// Set Hessian from nalgebra Matrix6.
    pub fn set_hessian(&mut self, h: &Matrix6<f64>) {
        self.hessian = (0..6)
            .flat_map(|i| (0..6).map(move |j| h[(i, j)]))
            .collect();
    }

    /// Set update step from nalgebra Vector6.
    pub fn set_step(&mut self, step: &Vector6<f64>) {
        self.step = (0..6).map(|i| step[i]).collect();
        self.step_norm = step.norm();
    }

    /// Format as a compact log line.
    pub fn to_log_line(&self) -> String {
        format!(
            "iter={} pose=[{:.6},{:.6},{:.6},{:.6},{:.6},{:.6}] cost={:.6} step={:.3e} valid={}/{} reg={} conv={}",
            self.iteration,
            self.pose[0], self.pose[1], self.pose[2],
            self.pose[3], self.pose[4], self.pose[5],
            self.cost,
            self.step_norm,
            self.num_valid,
            self.num_active,
            self.regularized,
            self.converged,
        )
    }
}

/// Complete debug history for one alignment.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlignmentDebug {
    /// Position of the element in its batch.
    pub element: usize,

    /// Initial guess as a tangent [ρ; φ].
    pub initial_pose: Vec<f64>,

    /// Final estimate as a tangent [ρ; φ].
    pub final_pose: Vec<f64>,

    /// Number of source points.
    pub num_source_points: usize,

    /// Source points with non-zero weight.
    pub num_active_points: usize,

    /// Iteration history.
    pub iterations: Vec<IterationDebug>,

    /// Final convergence status.
    pub convergence_status: String,

    /// Total iterations performed.
    pub total_iterations: usize,

    /// Valid / active in the final iteration.
    pub final_fitness: f64,

    /// RMS distance of valid correspondences in the final iteration.
    pub final_rmse: f64,
}

impl AlignmentDebug {
    /// Create a new alignment debug record.
    pub fn new(element: usize) -> Self {
        Self {
            element,
            initial_pose: vec![0.0; 6],
            final_pose: vec![0.0; 6],
            ..Default::default()
        }
    }

    /// Set initial pose from a transform.
    pub fn set_initial_pose(&mut self, pose: &Matrix4<f64>) {
        self.initial_pose = se3::log(pose).iter().copied().collect();
    }

    /// Set final pose from a transform.
    pub fn set_final_pose(&mut self, pose: &Matrix4<f64>) {
        self.final_pose = se3::log(pose).iter().copied().collect();
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Convert to pretty JSON string.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Format as compact multi-line log.
    pub fn to_log(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!(
            "=== ICP Alignment element={} points={} active={} status={} iters={} fitness={:.4} rmse={:.6} ===",
            self.element,
            self.num_source_points,
            self.num_active_points,
            self.convergence_status,
            self.total_iterations,
            self.final_fitness,
            self.final_rmse,
        ));
        lines.push(format!("  initial={}", format_pose(&self.initial_pose)));
        for iter in &self.iterations {
            lines.push(format!("  {}", iter.to_log_line()));
        }
        lines.push(format!("  final={}", format_pose(&self.final_pose)));
        lines.join("\n")
    }
}

fn format_pose(pose: &[f64]) -> String {
    let parts: Vec<String> = pose.iter().map(|v| format!("{v:.4}")).collect();
    format!("[{}]", parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_debug_new() {
        let debug = IterationDebug::new(0);
        assert_eq!(debug.iteration, 0);
        assert_eq!(debug.cost, 0.0);
        assert_eq!(debug.hessian.len(), 36);
    }

    #[test]
    fn test_iteration_debug_set_gradient() {
        let mut debug = IterationDebug::new(0);
        let g = Vector6::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0);
        debug.set_gradient(&g);
        assert_eq!(debug.gradient, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_iteration_debug_set_step() {
        let mut debug = IterationDebug::new(1);
        debug.set_step(&Vector6::new(3.0, 4.0, 0.0, 0.0, 0.0, 0.0));
        assert_eq!(debug.step_norm, 5.0);
    }

    #[test]
    fn test_set_pose_uses_tangent() {
        let mut debug = IterationDebug::new(0);
        let mut m = Matrix4::identity();
        m[(0, 3)] = 1.5;
        debug.set_pose(&m);
        assert_eq!(debug.pose[0], 1.5);
        assert_eq!(debug.pose[5], 0.0);
    }

    #[test]
    fn test_alignment_debug_json() {
        let mut debug = AlignmentDebug::new(3);
        debug.iterations.push(IterationDebug::new(0));
        debug.convergence_status = "converged".to_string();

        let json = debug.to_json().unwrap();
        assert!(json.contains("\"element\":3"));
        assert!(json.contains("\"convergence_status\":\"converged\""));

        let value: serde_json::Value = serde_json::from_str(&debug.to_json_pretty().unwrap()).unwrap();
        assert_eq!(value["iterations"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_to_log_lines() {
        let mut debug = AlignmentDebug::new(0);
        debug.iterations.push(IterationDebug::new(0));
        debug.iterations.push(IterationDebug::new(1));
        let log = debug.to_log();
        assert_eq!(log.lines().count(), 4);
        assert!(log.starts_with("=== ICP Alignment"));
    }
}

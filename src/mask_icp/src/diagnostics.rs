//! Diagnostics for training and validation steps.
//!
//! A step fills a [`DiagnosticCategory`] with key/value pairs and a severity
//! level; callers decide where to send it (logs, experiment tracker, JSON).

use std::time::Instant;

use dicp::{ConvergenceStatus, IcpResult, WeightStats};
use serde::{Deserialize, Serialize};

/// Diagnostic severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DiagnosticLevel {
    Ok = 0,
    Warn = 1,
    Error = 2,
}

impl From<DiagnosticLevel> for u8 {
    fn from(level: DiagnosticLevel) -> u8 {
        level as u8
    }
}

/// A single diagnostic category (e.g., "training_step").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticCategory {
    name: String,
    level: DiagnosticLevel,
    message: String,
    key_values: Vec<(String, String)>,
}

impl DiagnosticCategory {
    /// Create a new diagnostic category.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            level: DiagnosticLevel::Ok,
            message: String::new(),
            key_values: Vec::new(),
        }
    }

    /// Clear all key-value pairs and reset level.
    pub fn clear(&mut self) {
        self.key_values.clear();
        self.level = DiagnosticLevel::Ok;
        self.message.clear();
    }

    /// Add a key-value pair.
    pub fn add_key_value(&mut self, key: &str, value: impl ToString) {
        self.key_values.push((key.to_string(), value.to_string()));
    }

    /// Update the diagnostic level and message.
    /// Only updates if the new level is more severe than current.
    pub fn update_level_and_message(&mut self, level: DiagnosticLevel, message: &str) {
        if level > self.level {
            self.level = level;
            self.message = message.to_string();
        }
    }

    /// Set the diagnostic level and message unconditionally.
    pub fn set_level_and_message(&mut self, level: DiagnosticLevel, message: &str) {
        self.level = level;
        self.message = message.to_string();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> DiagnosticLevel {
        self.level
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn key_values(&self) -> &[(String, String)] {
        &self.key_values
    }

    /// Value of the first pair with `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.key_values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Helper to track execution time for diagnostics.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for ExecutionTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-batch summary of masking and alignment.
///
/// Weight statistics are averaged over elements; `mean_num_pts` is the mean
/// count of points with non-zero weight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_size: usize,
    pub mean_num_pts: f64,
    pub min_weight: f64,
    pub max_weight: f64,
    pub mean_weight: f64,
    pub converged: usize,
    pub max_iterations: usize,
    pub under_constrained: usize,
    pub no_correspondences: usize,
    pub failed: usize,
    /// Elements that took at least one regularized step.
    pub regularized: usize,
    pub mean_iterations: f64,
    pub mean_fitness: f64,
    pub execution_time_ms: f64,
}

impl BatchSummary {
    /// Summarize one batch.
    ///
    /// # Arguments
    /// * `results` - Alignment result per element
    /// * `weights` - Weight statistics per element, in the same order
    /// * `execution_time_ms` - Wall time of the step
    pub fn new(
        results: &[IcpResult<f64>],
        weights: &[WeightStats],
        execution_time_ms: f64,
    ) -> Self {
        let count =
            |status: ConvergenceStatus| results.iter().filter(|r| r.status == status).count();

        Self {
            batch_size: results.len(),
            mean_num_pts: mean(weights.iter().map(|w| w.num_nonzero as f64)),
            min_weight: mean(weights.iter().map(|w| w.min)),
            max_weight: mean(weights.iter().map(|w| w.max)),
            mean_weight: mean(weights.iter().map(|w| w.mean)),
            converged: count(ConvergenceStatus::Converged),
            max_iterations: count(ConvergenceStatus::MaxIterations),
            under_constrained: count(ConvergenceStatus::UnderConstrained),
            no_correspondences: count(ConvergenceStatus::NoValidCorrespondences),
            failed: count(ConvergenceStatus::Failed),
            regularized: results.iter().filter(|r| r.regularized_steps > 0).count(),
            mean_iterations: mean(results.iter().map(|r| r.iterations as f64)),
            mean_fitness: mean(results.iter().map(|r| r.fitness)),
            execution_time_ms,
        }
    }

    /// Elements that held their estimate.
    pub fn degenerate(&self) -> usize {
        self.under_constrained + self.no_correspondences + self.failed
    }

    /// Apply diagnostics to a category.
    pub fn apply_to(&self, diag: &mut DiagnosticCategory) {
        diag.clear();

        diag.add_key_value("batch_size", self.batch_size);
        diag.add_key_value("mean_num_pts", format!("{:.3}", self.mean_num_pts));
        diag.add_key_value("min_weight", format!("{:.6}", self.min_weight));
        diag.add_key_value("max_weight", format!("{:.6}", self.max_weight));
        diag.add_key_value("mean_weight", format!("{:.6}", self.mean_weight));
        diag.add_key_value("converged", self.converged);
        diag.add_key_value("max_iterations", self.max_iterations);
        diag.add_key_value("under_constrained", self.under_constrained);
        diag.add_key_value("no_correspondences", self.no_correspondences);
        diag.add_key_value("failed", self.failed);
        diag.add_key_value("regularized", self.regularized);
        diag.add_key_value("mean_iterations", format!("{:.3}", self.mean_iterations));
        diag.add_key_value("mean_fitness", format!("{:.6}", self.mean_fitness));
        diag.add_key_value("execution_time", format!("{:.3}", self.execution_time_ms));

        let degenerate = self.degenerate();
        if self.batch_size > 0 && degenerate == self.batch_size {
            diag.set_level_and_message(DiagnosticLevel::Error, "Every element is degenerate");
        } else if degenerate > 0 {
            diag.set_level_and_message(
                DiagnosticLevel::Warn,
                &format!("{degenerate} of {} elements held their estimate", self.batch_size),
            );
        } else if self.regularized > 0 {
            diag.set_level_and_message(
                DiagnosticLevel::Warn,
                &format!("{} elements took regularized steps", self.regularized),
            );
        } else {
            diag.set_level_and_message(DiagnosticLevel::Ok, "OK");
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

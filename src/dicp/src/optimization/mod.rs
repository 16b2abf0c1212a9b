//! Gauss-Newton optimization for weighted ICP.
//!
//! This module implements the refinement loop:
//! 1. Find correspondences at the current estimate
//! 2. Accumulate weighted normal equations (H, g)
//! 3. Solve the update: δ = -H⁻¹g
//! 4. Apply T ← exp(δ)·T and check convergence

pub mod debug;
pub mod driver;
pub mod normal_equations;
pub mod solver;
pub mod types;

pub use debug::{AlignmentDebug, IterationDebug};
pub use driver::IcpOptimizer;
pub use normal_equations::{accumulate, NormalEquations};
pub use solver::{reciprocal_condition, solve_step, StepOutcome};
pub use types::{
    ConvergenceStatus, Dimension, IcpConfig, IcpResult, IterationStrategy, ResidualMode,
    RobustKernel,
};

//! Gradient-based optimisers for the linear stages.
//!
//! Both optimisers evaluate an [`Objective`] sequentially; each evaluation is
//! one parallel voxel sweep inside the objective. A step is accepted only if
//! it lowers the cost, so the accepted cost sequence is non-increasing.

pub mod barzilai_borwein;
pub mod convergence;
pub mod gradient_descent;

pub use barzilai_borwein::BarzilaiBorwein;
pub use convergence::{ControlPointConvergence, ConvergenceConfig};
pub use gradient_descent::GradientDescent;

use crate::error::{RegistrationError, Result};

/// Cost and parameter gradient at one point.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub cost: f64,
    pub gradient: Vec<f64>,
}

/// Function being minimised.
pub trait Objective {
    fn evaluate(&mut self, params: &[f64]) -> Result<Evaluation>;

    /// Called after every accepted step. Returning `true` stops the optimiser.
    fn accepted(&mut self, _params: &[f64], _cost: f64) -> bool {
        false
    }

    /// Called after every evaluation.
    fn report(&mut self, _iteration: usize, _cost: f64, _accepted: bool, _step: f64) {}
}

/// One evaluation of the optimiser.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationRecord {
    pub cost: f64,
    pub accepted: bool,
    pub step: f64,
}

/// Final state of an optimiser run.
#[derive(Debug, Clone)]
pub struct OptimiserResult {
    pub params: Vec<f64>,
    pub cost: f64,
    /// Number of objective evaluations.
    pub iterations: usize,
    /// Stopped by step size or convergence check rather than the iteration cap.
    pub converged: bool,
    pub history: Vec<IterationRecord>,
}

/// Fail with a numerical-instability error if a parameter or cost is not finite.
pub(crate) fn check_finite(params: &[f64], cost: f64, last_valid: &[f64]) -> Result<()> {
    if params.iter().all(|p| p.is_finite()) && cost.is_finite() {
        return Ok(());
    }
    tracing::error!(
        ?last_valid,
        ?params,
        cost,
        "optimiser state became non-finite; last valid parameters logged"
    );
    Err(RegistrationError::numerical_instability(format!(
        "NaN transformation (last valid parameters: {:?})",
        last_valid
    )))
}

/// `w ⊙ g`.
pub(crate) fn weighted(weights: &[f64], gradient: &[f64]) -> Vec<f64> {
    weights.iter().zip(gradient).map(|(w, g)| w * g).collect()
}

pub(crate) fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

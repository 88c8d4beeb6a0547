//! Gradient descent with adaptive step length.

use serde::{Deserialize, Serialize};

use super::{check_finite, norm, weighted, IterationRecord, Objective, OptimiserResult};
use crate::error::Result;

/// Gradient descent along the normalised, weighted gradient.
///
/// Each trial moves the parameters by `step` along `-(w ⊙ g) / |w ⊙ g|`.
/// An accepted trial doubles the step, a rejected one halves it; the run
/// stops once the step falls below `min_step`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientDescent {
    pub weights: Vec<f64>,
    pub initial_step: f64,
    pub min_step: f64,
    pub max_step: f64,
    pub max_iterations: usize,
}

impl GradientDescent {
    pub fn new(weights: Vec<f64>, max_iterations: usize) -> Self {
        Self {
            weights,
            initial_step: 1.0,
            min_step: 1e-4,
            max_step: 10.0,
            max_iterations,
        }
    }

    /// Set the first trial step and derive the step bounds from it.
    pub fn with_initial_step(mut self, step: f64) -> Self {
        self.initial_step = step;
        self.min_step = step * 1e-4;
        self.max_step = step * 10.0;
        self
    }

    pub fn with_min_step(mut self, step: f64) -> Self {
        self.min_step = step;
        self
    }

    pub fn run<O: Objective>(&self, objective: &mut O, x0: &[f64]) -> Result<OptimiserResult> {
        let mut x = x0.to_vec();
        let mut current = objective.evaluate(&x)?;
        check_finite(&x, current.cost, x0)?;

        let mut step = self.initial_step;
        let mut history = vec![IterationRecord {
            cost: current.cost,
            accepted: true,
            step,
        }];
        objective.report(0, current.cost, true, step);
        let mut iterations = 1;
        let mut converged = false;

        while iterations < self.max_iterations {
            let direction = weighted(&self.weights, &current.gradient);
            let length = norm(&direction);
            check_finite(&direction, current.cost, &x)?;
            if length == 0.0 {
                converged = true;
                break;
            }

            let candidate: Vec<f64> = x
                .iter()
                .zip(&direction)
                .map(|(p, d)| p - step * d / length)
                .collect();
            let trial = objective.evaluate(&candidate)?;
            check_finite(&candidate, trial.cost, &x)?;
            iterations += 1;

            let accepted = trial.cost < current.cost;
            history.push(IterationRecord {
                cost: trial.cost,
                accepted,
                step,
            });
            objective.report(iterations - 1, trial.cost, accepted, step);

            if accepted {
                x = candidate;
                current = trial;
                step = (step * 2.0).min(self.max_step);
                if objective.accepted(&x, current.cost) {
                    converged = true;
                    break;
                }
            } else {
                step *= 0.5;
                if step < self.min_step {
                    converged = true;
                    break;
                }
            }
        }

        tracing::debug!(
            iterations,
            converged,
            cost = current.cost,
            "gradient descent finished"
        );
        Ok(OptimiserResult {
            params: x,
            cost: current.cost,
            iterations,
            converged,
            history,
        })
    }
}

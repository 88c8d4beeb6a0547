//! Barzilai-Borwein gradient descent.

use serde::{Deserialize, Serialize};

use super::{check_finite, norm, weighted, IterationRecord, Objective, OptimiserResult};
use crate::error::Result;

/// Gradient descent with the Barzilai-Borwein step length in the metric
/// induced by the optimiser weights.
///
/// The update is `x ← x - α (w ⊙ g)` with `α = sᵀ W⁻¹ s / sᵀ y`, where `s`
/// and `y` are the last accepted parameter and gradient differences. The
/// first trial moves `initial_step` along the normalised weighted gradient.
/// Trials that increase the cost are rejected and halve `α`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarzilaiBorwein {
    pub weights: Vec<f64>,
    pub initial_step: f64,
    pub min_step: f64,
    pub max_step: f64,
    pub max_iterations: usize,
}

impl BarzilaiBorwein {
    pub fn new(weights: Vec<f64>, max_iterations: usize) -> Self {
        Self {
            weights,
            initial_step: 1.0,
            min_step: 1e-4,
            max_step: 10.0,
            max_iterations,
        }
    }

    pub fn with_initial_step(mut self, step: f64) -> Self {
        self.initial_step = step;
        self.min_step = step * 1e-4;
        self.max_step = step * 10.0;
        self
    }

    /// `sᵀ W⁻¹ s`, skipping frozen parameters.
    fn weighted_square(&self, s: &[f64]) -> f64 {
        s.iter()
            .zip(&self.weights)
            .filter(|(_, w)| **w > 0.0)
            .map(|(s, w)| s * s / w)
            .sum()
    }

    pub fn run<O: Objective>(&self, objective: &mut O, x0: &[f64]) -> Result<OptimiserResult> {
        let mut x = x0.to_vec();
        let mut current = objective.evaluate(&x)?;
        check_finite(&x, current.cost, x0)?;
        let mut history = vec![IterationRecord {
            cost: current.cost,
            accepted: true,
            step: self.initial_step,
        }];
        objective.report(0, current.cost, true, self.initial_step);

        let mut direction = weighted(&self.weights, &current.gradient);
        check_finite(&direction, current.cost, &x)?;
        let mut length = norm(&direction);
        let mut alpha = if length > 0.0 {
            self.initial_step / length
        } else {
            0.0
        };
        let mut iterations = 1;
        let mut converged = false;

        while iterations < self.max_iterations {
            if length == 0.0 {
                converged = true;
                break;
            }
            // Physical step length, clamped to keep a bad curvature estimate bounded.
            let step = (alpha * length).min(self.max_step);
            alpha = step / length;

            let candidate: Vec<f64> = x
                .iter()
                .zip(&direction)
                .map(|(p, d)| p - alpha * d)
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
                let s: Vec<f64> = candidate.iter().zip(&x).map(|(a, b)| a - b).collect();
                let y: Vec<f64> = trial
                    .gradient
                    .iter()
                    .zip(&current.gradient)
                    .map(|(a, b)| a - b)
                    .collect();
                let sy: f64 = s.iter().zip(&y).map(|(a, b)| a * b).sum();
                alpha = if sy > 0.0 {
                    self.weighted_square(&s) / sy
                } else {
                    alpha * 2.0
                };

                x = candidate;
                current = trial;
                direction = weighted(&self.weights, &current.gradient);
                check_finite(&direction, current.cost, &x)?;
                length = norm(&direction);
                if objective.accepted(&x, current.cost) {
                    converged = true;
                    break;
                }
            } else {
                alpha *= 0.5;
                if alpha * length < self.min_step {
                    converged = true;
                    break;
                }
            }
        }

        tracing::debug!(
            iterations,
            converged,
            cost = current.cost,
            "Barzilai-Borwein finished"
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

#[cfg(test)]
mod tests {
    use super::super::test_objectives::{Exploding, Quadratic};
    use super::*;
    use crate::error::RegistrationError;

    #[test]
    fn test_minimises_ill_conditioned_quadratic() {
        let mut objective = Quadratic {
            scale: vec![1.0, 25.0],
            centre: vec![-1.0, 2.0],
            evaluations: 0,
        };
        let result = BarzilaiBorwein::new(vec![1.0, 1.0], 300)
            .with_initial_step(0.5)
            .run(&mut objective, &[4.0, 4.0])
            .unwrap();
        assert!((result.params[0] + 1.0).abs() < 1e-3);
        assert!((result.params[1] - 2.0).abs() < 1e-3);
    }

    #[test]
    fn test_never_accepts_cost_increase() {
        let mut objective = Quadratic {
            scale: vec![3.0, 0.2, 1.0],
            centre: vec![0.0, 0.0, 0.0],
            evaluations: 0,
        };
        let result = BarzilaiBorwein::new(vec![1.0; 3], 60)
            .run(&mut objective, &[1.0, 2.0, 3.0])
            .unwrap();
        let accepted: Vec<f64> = result
            .history
            .iter()
            .filter(|r| r.accepted)
            .map(|r| r.cost)
            .collect();
        assert!(accepted.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn test_nan_is_fatal() {
        let err = BarzilaiBorwein::new(vec![1.0], 100)
            .with_initial_step(0.01)
            .run(&mut Exploding(0), &[1.0])
            .unwrap_err();
        assert!(matches!(err, RegistrationError::NumericalInstability(_)));
    }
}

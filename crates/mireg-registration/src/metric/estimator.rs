//! Robust estimators applied to intensity residuals.

use serde::{Deserialize, Serialize};

const EPSILON: f64 = 1e-6;

/// Penalty applied to the residual `r = I1 - I2`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum Estimator {
    /// `r²`, plain sum of squared differences.
    #[default]
    L2,
    /// Soft absolute value `sqrt(r² + ε)`.
    L1,
    /// Graduated penalty `(r² + ε)^(p/2)`.
    Lp { power: f64 },
}

impl Estimator {
    /// The graduated estimator with its usual power of 1.2.
    pub fn lp() -> Self {
        Estimator::Lp { power: 1.2 }
    }

    #[inline]
    pub fn cost(&self, r: f64) -> f64 {
        match *self {
            Estimator::L2 => r * r,
            Estimator::L1 => (r * r + EPSILON).sqrt(),
            Estimator::Lp { power } => (r * r + EPSILON).powf(0.5 * power),
        }
    }

    /// `d cost / d r`.
    #[inline]
    pub fn derivative(&self, r: f64) -> f64 {
        match *self {
            Estimator::L2 => 2.0 * r,
            Estimator::L1 => r / (r * r + EPSILON).sqrt(),
            Estimator::Lp { power } => power * r * (r * r + EPSILON).powf(0.5 * power - 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivatives_match_finite_differences() {
        for est in [Estimator::L2, Estimator::L1, Estimator::lp()] {
            for r in [-2.0, -0.3, 0.1, 1.7] {
                let h = 1e-6;
                let fd = (est.cost(r + h) - est.cost(r - h)) / (2.0 * h);
                assert!((fd - est.derivative(r)).abs() < 1e-5, "{:?} at {}", est, r);
            }
        }
    }

    #[test]
    fn test_robust_estimators_grow_slower_than_l2() {
        assert!(Estimator::L1.cost(10.0) < Estimator::L2.cost(10.0));
        assert!(Estimator::lp().cost(10.0) < Estimator::L2.cost(10.0));
        assert!(Estimator::L1.cost(10.0) < Estimator::lp().cost(10.0));
    }
}

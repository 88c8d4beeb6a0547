//! Intensity-difference metric with a pluggable estimator.

use super::estimator::Estimator;
use super::samples::MidwaySamples;
use super::{Metric, VoxelTerm};

/// Weighted sum over volumes of `ρ(I1 - I2)`.
///
/// With [`Estimator::L2`] this is the (multi-contrast weighted) sum of squared
/// differences.
#[derive(Debug, Clone, Default)]
pub struct DifferenceMetric {
    estimator: Estimator,
}

impl DifferenceMetric {
    pub fn new(estimator: Estimator) -> Self {
        Self { estimator }
    }
}

impl Metric for DifferenceMetric {
    fn name(&self) -> &'static str {
        match self.estimator {
            Estimator::L2 => "sum of squared differences",
            Estimator::L1 => "difference (L1)",
            Estimator::Lp { .. } => "difference (Lp)",
        }
    }

    fn evaluate(&self, index: usize, samples: &MidwaySamples) -> Option<VoxelTerm> {
        if !samples.is_valid(index) {
            return None;
        }
        let (v1, v2) = (samples.values1(index), samples.values2(index));
        let (g1, g2) = (samples.grads1(index), samples.grads2(index));
        let mut term = VoxelTerm::default();
        for (v, w) in samples.weights().iter().enumerate() {
            if *w == 0.0 {
                continue;
            }
            let r = v1[v] - v2[v];
            term.cost += w * self.estimator.cost(r);
            // d cost / d I1 = w ρ'(r), d cost / d I2 = -w ρ'(r)
            let d = w * self.estimator.derivative(r);
            term.grad += VoxelTerm::symmetric_gradient(-d, &g2[v], d, &g1[v]);
        }
        Some(term)
    }
}

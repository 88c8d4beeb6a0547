//! Demons driven by local cross-correlation forces.

use nalgebra::Vector3;

use super::demons::DEFAULT_DENOMINATOR_FLOOR;
use super::ncc::{neighbourhood_stats, NccStats};
use super::samples::MidwaySamples;
use super::{UpdateMetric, UpdateTerm};

/// Cross-correlation demons.
///
/// Uses the same neighbourhood statistics as [`super::LocalCrossCorrelation`].
/// Each image gets its own speed, the derivative of the local correlation with
/// respect to its centre value, normalised like a demons force with that
/// image's gradient.
#[derive(Debug, Clone)]
pub struct DemonsCrossCorrelation {
    radius: [usize; 3],
    stats: Vec<NccStats>,
    normaliser: f64,
}

impl DemonsCrossCorrelation {
    pub fn new(extent: [usize; 3]) -> Self {
        Self {
            radius: [extent[0] / 2, extent[1] / 2, extent[2] / 2],
            stats: Vec::new(),
            normaliser: 1.0,
        }
    }
}

impl Default for DemonsCrossCorrelation {
    fn default() -> Self {
        Self::new([3, 3, 3])
    }
}

#[inline]
fn normalised_force(speed: f64, grad: &Vector3<f64>, normaliser: f64) -> Vector3<f64> {
    let denominator = speed * speed / normaliser + grad.norm_squared();
    if denominator < DEFAULT_DENOMINATOR_FLOOR {
        return Vector3::zeros();
    }
    grad * (speed / denominator)
}

impl UpdateMetric for DemonsCrossCorrelation {
    fn name(&self) -> &'static str {
        "demons cross-correlation"
    }

    fn requires_precompute(&self) -> bool {
        true
    }

    fn precompute(&mut self, samples: &MidwaySamples) {
        self.normaliser = samples.spacing_normaliser();
        self.stats = neighbourhood_stats(samples, self.radius);
    }

    fn evaluate(&self, index: usize, samples: &MidwaySamples) -> Option<UpdateTerm> {
        if !samples.is_valid(index) {
            return None;
        }
        let nv = samples.nvols();
        let stats = self.stats.get(index * nv..(index + 1) * nv)?;
        let (g1, g2) = (samples.grads1(index), samples.grads2(index));
        let mut term = UpdateTerm::default();
        for (v, w) in samples.weights().iter().enumerate() {
            let s = &stats[v];
            let Some(r2) = s.correlation_squared() else { continue };
            term.cost -= w * r2;
            let speed1 = s.m_hat - s.a / s.b * s.f_hat;
            let speed2 = s.f_hat - s.a / s.c * s.m_hat;
            term.update1 += normalised_force(speed1, &g1[v], self.normaliser) * *w;
            term.update2 += normalised_force(speed2, &g2[v], self.normaliser) * *w;
        }
        term.update1 /= nv as f64;
        term.update2 /= nv as f64;
        Some(term)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mireg_core::image::Header;

    #[test]
    fn test_cc_forces_vanish_for_identical_images() {
        let header = Header::unit([5, 5, 5]);
        let mut samples = MidwaySamples::new(&header, vec![1.0]);
        samples.fill(|i, slot| {
            let [x, y, z] = header.coords(i);
            let v = (x * x + 2 * y + z) as f64;
            slot.values1[0] = v;
            slot.values2[0] = v;
            slot.grads1[0] = Vector3::new(2.0 * x as f64, 2.0, 1.0);
            slot.grads2[0] = slot.grads1[0];
            true
        });
        let mut metric = DemonsCrossCorrelation::default();
        metric.precompute(&samples);
        let term = metric.evaluate(header.linear_index(2, 2, 2), &samples).unwrap();
        assert!((term.cost + 1.0).abs() < 1e-12);
        assert!(term.update1.norm() < 1e-9);
        assert!(term.update2.norm() < 1e-9);
    }
}

//! Demons forces for the symmetric non-linear stage.

use nalgebra::Vector3;

use super::samples::MidwaySamples;
use super::{UpdateMetric, UpdateTerm};

/// Intensity differences below this are treated as zero.
pub const DEFAULT_SPEED_THRESHOLD: f64 = 1e-3;
/// Updates are zero where the force denominator falls below this.
pub const DEFAULT_DENOMINATOR_FLOOR: f64 = 1e-9;

/// Symmetric demons force for one volume.
///
/// Returns `(speed², update1)`; the image2 update is exactly `-update1`.
#[inline]
pub fn demons_force(
    value1: f64,
    value2: f64,
    grad1: &Vector3<f64>,
    grad2: &Vector3<f64>,
    normaliser: f64,
    threshold: f64,
    floor: f64,
) -> (f64, Vector3<f64>) {
    let mut speed = value2 - value1;
    if speed.abs() < threshold {
        speed = 0.0;
    }
    let g = (grad1 + grad2) * 0.5;
    let denominator = speed * speed / normaliser + g.norm_squared();
    if denominator < floor || speed == 0.0 {
        return (speed * speed, Vector3::zeros());
    }
    (speed * speed, g * (speed / denominator))
}

/// Classic symmetric demons on the first volume.
#[derive(Debug, Clone)]
pub struct Demons {
    threshold: f64,
    floor: f64,
    normaliser: f64,
}

impl Default for Demons {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SPEED_THRESHOLD,
            floor: DEFAULT_DENOMINATOR_FLOOR,
            normaliser: 1.0,
        }
    }
}

impl Demons {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }
}

impl UpdateMetric for Demons {
    fn name(&self) -> &'static str {
        "demons"
    }

    fn requires_precompute(&self) -> bool {
        true
    }

    fn precompute(&mut self, samples: &MidwaySamples) {
        self.normaliser = samples.spacing_normaliser();
    }

    fn evaluate(&self, index: usize, samples: &MidwaySamples) -> Option<UpdateTerm> {
        if !samples.is_valid(index) {
            return None;
        }
        let (cost, update1) = demons_force(
            samples.values1(index)[0],
            samples.values2(index)[0],
            &samples.grads1(index)[0],
            &samples.grads2(index)[0],
            self.normaliser,
            self.threshold,
            self.floor,
        );
        Some(UpdateTerm {
            cost,
            update1,
            update2: -update1,
        })
    }
}

/// Demons over every volume of a multi-contrast image.
///
/// Forces are weighted per contrast, summed, then divided by the number of
/// volumes.
#[derive(Debug, Clone)]
pub struct Demons4D {
    inner: Demons,
}

impl Default for Demons4D {
    fn default() -> Self {
        Self {
            inner: Demons::default(),
        }
    }
}

impl UpdateMetric for Demons4D {
    fn name(&self) -> &'static str {
        "demons 4D"
    }

    fn requires_precompute(&self) -> bool {
        true
    }

    fn precompute(&mut self, samples: &MidwaySamples) {
        self.inner.precompute(samples);
    }

    fn evaluate(&self, index: usize, samples: &MidwaySamples) -> Option<UpdateTerm> {
        if !samples.is_valid(index) {
            return None;
        }
        let nvols = samples.nvols();
        let (v1, v2) = (samples.values1(index), samples.values2(index));
        let (g1, g2) = (samples.grads1(index), samples.grads2(index));
        let mut cost = 0.0;
        let mut update1 = Vector3::zeros();
        for vol in 0..nvols {
            let w = samples.weights()[vol];
            let (c, u) = demons_force(
                v1[vol],
                v2[vol],
                &g1[vol],
                &g2[vol],
                self.inner.normaliser,
                self.inner.threshold,
                self.inner.floor,
            );
            cost += w * c;
            update1 += u * w;
        }
        let update1 = update1 / nvols as f64;
        Some(UpdateTerm {
            cost: cost / nvols as f64,
            update1,
            update2: -update1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mireg_core::image::Header;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn test_demons_updates_are_exact_negatives(
            v1 in -10.0f64..10.0, v2 in -10.0f64..10.0,
            gx in -5.0f64..5.0, gy in -5.0f64..5.0, gz in -5.0f64..5.0,
            hx in -5.0f64..5.0, hy in -5.0f64..5.0, hz in -5.0f64..5.0,
        ) {
            let header = Header::unit([1, 1, 1]);
            let mut samples = MidwaySamples::new(&header, vec![1.0]);
            samples.fill(|_, slot| {
                slot.values1[0] = v1;
                slot.values2[0] = v2;
                slot.grads1[0] = Vector3::new(gx, gy, gz);
                slot.grads2[0] = Vector3::new(hx, hy, hz);
                true
            });
            let mut demons = Demons::default();
            demons.precompute(&samples);
            let term = demons.evaluate(0, &samples).unwrap();
            prop_assert_eq!(term.update2, -term.update1);
            prop_assert!(term.update1.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_demons_moves_image1_uphill_when_darker() {
        let g = Vector3::new(1.0, 0.0, 0.0);
        let (cost, u) = demons_force(1.0, 2.0, &g, &g, 1.0, 1e-3, 1e-9);
        assert_eq!(cost, 1.0);
        assert!(u.x > 0.0);
    }

    #[test]
    fn test_small_speed_and_flat_regions_give_zero_update() {
        let g = Vector3::new(1.0, 0.0, 0.0);
        assert_eq!(demons_force(1.0, 1.0005, &g, &g, 1.0, 1e-3, 1e-9).1, Vector3::zeros());
        let flat = Vector3::zeros();
        let (_, u) = demons_force(0.0, 1e-6, &flat, &flat, 1.0, 0.0, 1e-9);
        assert_eq!(u, Vector3::zeros());
    }

    #[test]
    fn test_demons4d_uses_every_volume_once() {
        let header = Header::unit([1, 1, 1]);
        let mut samples = MidwaySamples::new(&header, vec![1.0, 1.0]);
        samples.fill(|_, slot| {
            slot.values1.copy_from_slice(&[1.0, 0.0]);
            slot.values2.copy_from_slice(&[2.0, 0.0]);
            slot.grads1.fill(Vector3::x());
            slot.grads2.fill(Vector3::x());
            true
        });
        let mut metric = Demons4D::default();
        metric.precompute(&samples);
        let term = metric.evaluate(0, &samples).unwrap();
        // second volume contributes nothing; the first is halved by the volume count
        let (_, single) = demons_force(1.0, 2.0, &Vector3::x(), &Vector3::x(), 1.0, 1e-3, 1e-9);
        assert!((term.update1 - single / 2.0).norm() < 1e-12);
        assert_eq!(term.cost, 0.5);
    }
}

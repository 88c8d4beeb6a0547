//! Cost metrics and their voxel-wise gradients.
//!
//! Linear stages use [`Metric`]: per midway voxel a cost and the gradient of
//! that cost with respect to a displacement of the full transform, which the
//! caller chains through the transform's parameter Jacobian. The non-linear
//! stage uses [`UpdateMetric`], which returns a cost and one update vector per
//! image. Both read pre-sampled [`MidwaySamples`]; evaluation is `&self` so a
//! single instance serves all rayon workers.

pub mod demons;
pub mod demons_cc;
pub mod difference;
pub mod estimator;
pub mod ncc;
pub mod samples;

pub use demons::{Demons, Demons4D};
pub use demons_cc::DemonsCrossCorrelation;
pub use difference::DifferenceMetric;
pub use estimator::Estimator;
pub use ncc::{LocalCrossCorrelation, NccStats};
pub use samples::{MidwaySamples, SampleSlot};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::{RegistrationError, Result};

/// Contribution of one voxel to a linear cost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoxelTerm {
    pub cost: f64,
    /// Gradient of `cost` with respect to a scanner-space displacement of the
    /// full transform at this voxel.
    pub grad: Vector3<f64>,
}

impl Default for VoxelTerm {
    fn default() -> Self {
        Self {
            cost: 0.0,
            grad: Vector3::zeros(),
        }
    }
}

impl VoxelTerm {
    /// `½ (∂c/∂I2 ∇I2 - ∂c/∂I1 ∇I1)`: moving the full transform by `δ` moves
    /// image2's sampling point by `+δ/2` and image1's by `-δ/2`.
    #[inline]
    pub fn symmetric_gradient(
        dcost_di2: f64,
        grad2: &Vector3<f64>,
        dcost_di1: f64,
        grad1: &Vector3<f64>,
    ) -> Vector3<f64> {
        (grad2 * dcost_di2 - grad1 * dcost_di1) * 0.5
    }
}

/// Contribution of one voxel to a non-linear iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateTerm {
    pub cost: f64,
    /// Displacement update for image1's sampling position (scanner units).
    pub update1: Vector3<f64>,
    /// Displacement update for image2's sampling position.
    pub update2: Vector3<f64>,
}

impl Default for UpdateTerm {
    fn default() -> Self {
        Self {
            cost: 0.0,
            update1: Vector3::zeros(),
            update2: Vector3::zeros(),
        }
    }
}

/// Voxel-wise cost used by the linear stages.
pub trait Metric: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether evaluation reads neighbouring voxels.
    fn is_neighbourhood(&self) -> bool {
        false
    }

    /// Whether [`Metric::precompute`] must run before every sweep.
    fn requires_precompute(&self) -> bool {
        false
    }

    fn precompute(&mut self, _samples: &MidwaySamples) {}

    /// Cost term of voxel `index`, or `None` if the voxel does not contribute.
    fn evaluate(&self, index: usize, samples: &MidwaySamples) -> Option<VoxelTerm>;
}

/// Voxel-wise force model used by the non-linear stage.
pub trait UpdateMetric: Send + Sync {
    fn name(&self) -> &'static str;

    fn requires_precompute(&self) -> bool {
        false
    }

    /// Called once per iteration before the sweep.
    fn precompute(&mut self, _samples: &MidwaySamples) {}

    fn evaluate(&self, index: usize, samples: &MidwaySamples) -> Option<UpdateTerm>;
}

/// Metric selection for linear stages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LinearMetricKind {
    Difference { estimator: Estimator },
    LocalCrossCorrelation { extent: [usize; 3] },
}

impl Default for LinearMetricKind {
    fn default() -> Self {
        LinearMetricKind::Difference {
            estimator: Estimator::L2,
        }
    }
}

impl LinearMetricKind {
    pub fn ncc() -> Self {
        LinearMetricKind::LocalCrossCorrelation { extent: [3, 3, 3] }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            LinearMetricKind::Difference { estimator: Estimator::Lp { power } } if !(*power > 0.0) => {
                Err(RegistrationError::invalid_configuration(format!(
                    "Lp estimator power must be positive, got {}",
                    power
                )))
            }
            LinearMetricKind::LocalCrossCorrelation { extent } => validate_extent(extent),
            _ => Ok(()),
        }
    }

    pub fn build(&self) -> Box<dyn Metric> {
        match *self {
            LinearMetricKind::Difference { estimator } => Box::new(DifferenceMetric::new(estimator)),
            LinearMetricKind::LocalCrossCorrelation { extent } => Box::new(LocalCrossCorrelation::new(extent)),
        }
    }
}

/// Metric selection for the non-linear stage.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum NonLinearMetricKind {
    #[default]
    Demons,
    Demons4D,
    DemonsCrossCorrelation { extent: [usize; 3] },
}

impl NonLinearMetricKind {
    pub fn validate(&self) -> Result<()> {
        match self {
            NonLinearMetricKind::DemonsCrossCorrelation { extent } => validate_extent(extent),
            _ => Ok(()),
        }
    }

    pub fn build(&self) -> Box<dyn UpdateMetric> {
        match *self {
            NonLinearMetricKind::Demons => Box::new(Demons::default()),
            NonLinearMetricKind::Demons4D => Box::new(Demons4D::default()),
            NonLinearMetricKind::DemonsCrossCorrelation { extent } => {
                Box::new(DemonsCrossCorrelation::new(extent))
            }
        }
    }
}

fn validate_extent(extent: &[usize; 3]) -> Result<()> {
    if extent.iter().any(|e| e % 2 == 0) {
        return Err(RegistrationError::invalid_configuration(format!(
            "neighbourhood extent must be odd along every axis, got {:?}",
            extent
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_kinds_build_expected_variants() {
        assert_eq!(LinearMetricKind::default().build().name(), "sum of squared differences");
        let ncc = LinearMetricKind::ncc().build();
        assert!(ncc.is_neighbourhood());
        assert!(ncc.requires_precompute());
        assert_eq!(NonLinearMetricKind::Demons4D.build().name(), "demons 4D");
    }

    #[test]
    fn test_even_extent_rejected() {
        assert!(LinearMetricKind::LocalCrossCorrelation { extent: [3, 4, 3] }
            .validate()
            .is_err());
        assert!(NonLinearMetricKind::DemonsCrossCorrelation { extent: [3, 3, 3] }
            .validate()
            .is_ok());
        assert!(LinearMetricKind::Difference { estimator: Estimator::Lp { power: 0.0 } }
            .validate()
            .is_err());
    }
}

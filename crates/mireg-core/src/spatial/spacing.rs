//! Voxel spacing: physical distance between adjacent voxels along each axis.

use super::Vector;

/// Spacing between adjacent voxels along each axis (mm).
pub type Spacing<const D: usize> = Vector<D>;

impl<const D: usize> Spacing<D> {
    /// Create uniform spacing (same value for all dimensions).
    pub fn uniform(value: f64) -> Self {
        Self::new([value; D])
    }

    /// Get the minimum spacing value.
    pub fn min_spacing(&self) -> f64 {
        self.0.iter().copied().fold(f64::INFINITY, f64::min)
    }

    /// Get the maximum spacing value.
    pub fn max_spacing(&self) -> f64 {
        self.0.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Arithmetic mean of the spacing values.
    pub fn mean_spacing(&self) -> f64 {
        self.0.iter().sum::<f64>() / D as f64
    }
}

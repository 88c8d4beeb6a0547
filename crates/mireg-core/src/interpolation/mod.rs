//! Interpolation of image values at continuous positions.

pub mod linear;
pub mod nearest;

pub use linear::LinearInterpolator;
pub use nearest::NearestInterpolator;

use nalgebra::{Matrix3, Matrix4, Vector3};

use crate::image::Image;

/// Interpolator trait for sampling all volumes of a voxel at a continuous index.
pub trait Interpolator: Send + Sync {
    /// Sample every volume at the continuous voxel index `index` into `out`.
    ///
    /// Returns `false` (leaving `out` untouched) when `index` lies outside the
    /// field of view, i.e. further than half a voxel beyond the grid.
    fn sample(&self, image: &Image, index: &Vector3<f64>, out: &mut [f64]) -> bool;
}

/// True if the continuous index lies within half a voxel of the grid.
#[inline]
pub fn in_bounds(dims: [usize; 3], index: &Vector3<f64>) -> bool {
    (0..3).all(|a| index[a] >= -0.5 && index[a] <= dims[a] as f64 - 0.5)
}

/// An image bound to its cached scanner-to-voxel mapping.
///
/// Lets per-voxel kernels sample at scanner positions without recomputing the
/// inverse header transform for every lookup.
pub struct ImageSampler<'a> {
    image: &'a Image,
    scanner_to_voxel: Matrix4<f64>,
    gradient_to_scanner: Matrix3<f64>,
    interp: LinearInterpolator,
    nearest: NearestInterpolator,
}

impl<'a> ImageSampler<'a> {
    pub fn new(image: &'a Image) -> Self {
        Self {
            image,
            // A singular header maps every point to NaN, which is never in bounds.
            scanner_to_voxel: image
                .header()
                .scanner_to_voxel()
                .unwrap_or_else(|| Matrix4::from_element(f64::NAN)),
            gradient_to_scanner: image.header().index_gradient_to_scanner(),
            interp: LinearInterpolator::new(),
            nearest: NearestInterpolator::new(),
        }
    }

    pub fn image(&self) -> &Image {
        self.image
    }

    /// Continuous voxel index of a scanner-space point.
    #[inline]
    pub fn to_voxel(&self, point: &Vector3<f64>) -> Vector3<f64> {
        (self.scanner_to_voxel * point.push(1.0)).xyz()
    }

    /// Linearly interpolated values at a scanner-space point.
    #[inline]
    pub fn value(&self, point: &Vector3<f64>, out: &mut [f64]) -> bool {
        self.interp.sample(self.image, &self.to_voxel(point), out)
    }

    /// Nearest-voxel values at a scanner-space point (masks, labels).
    #[inline]
    pub fn nearest(&self, point: &Vector3<f64>, out: &mut [f64]) -> bool {
        self.nearest.sample(self.image, &self.to_voxel(point), out)
    }

    /// Values plus scanner-space gradients at a scanner-space point.
    #[inline]
    pub fn value_and_gradient(
        &self,
        point: &Vector3<f64>,
        values: &mut [f64],
        gradients: &mut [Vector3<f64>],
    ) -> bool {
        if !self
            .interp
            .sample_with_gradient(self.image, &self.to_voxel(point), values, gradients)
        {
            return false;
        }
        for g in gradients.iter_mut() {
            *g = self.gradient_to_scanner * *g;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Header;
    use crate::spatial::{Direction3, Point3, Spacing3};

    #[test]
    fn test_sampler_maps_scanner_points() {
        let header = Header::new(
            [4, 1, 1],
            Point3::new([10.0, 0.0, 0.0]),
            Spacing3::new([2.0, 1.0, 1.0]),
            Direction3::identity(),
        );
        let img = Image::from_data(header, vec![0.0, 1.0, 0.0, 1.0]);
        let sampler = ImageSampler::new(&img);
        let mut out = [0.0];
        assert!(sampler.value(&Vector3::new(11.0, 0.0, 0.0), &mut out));
        assert!((out[0] - 0.5).abs() < 1e-12);
        assert!(sampler.nearest(&Vector3::new(11.8, 0.0, 0.0), &mut out));
        assert_eq!(out[0], 1.0);
        assert!(!sampler.nearest(&Vector3::new(8.0, 0.0, 0.0), &mut out));
    }

    #[test]
    fn test_singular_header_samples_nothing() {
        let header = Header::new(
            [2, 2, 2],
            Point3::origin(),
            Spacing3::new([1.0, 1.0, 0.0]),
            Direction3::identity(),
        );
        let img = Image::from_data(header, vec![1.0; 8]);
        let sampler = ImageSampler::new(&img);
        let mut out = [0.0];
        assert!(!sampler.value(&Vector3::zeros(), &mut out));
        assert!(!sampler.nearest(&Vector3::zeros(), &mut out));
    }
}

//! Grid downscaling for multi-resolution levels.

use burn::tensor::backend::Backend;
use nalgebra::Vector3;

use super::gaussian::GaussianFilter;
use super::resample::ResampleImageFilter;
use crate::image::{Header, Image};
use crate::spatial::{Point3, Spacing3};

/// Grid covering the same field of view as `header` with dimensions scaled by
/// `scale` (rounded, at least one voxel) and spacing adjusted to match.
pub fn scaled_header(header: &Header, scale: f64) -> Header {
    let dims = header.dims();
    let spacing = header.spacing();
    let mut new_dims = [0usize; 3];
    let mut new_spacing = [0.0; 3];
    let mut first = Vector3::zeros();
    for a in 0..3 {
        new_dims[a] = ((dims[a] as f64 * scale).round() as usize).max(1);
        let ratio = dims[a] as f64 / new_dims[a] as f64;
        new_spacing[a] = spacing[a] * ratio;
        // keep the outer edge of the field of view fixed
        first[a] = -0.5 + 0.5 * ratio;
    }
    let origin = header.index_to_scanner(&first);
    Header::new(
        new_dims,
        Point3::new([origin.x, origin.y, origin.z]),
        Spacing3::new(new_spacing),
        *header.direction(),
    )
    .with_vol_shape(header.vol_shape().to_vec())
}

/// Smooth then regrid an image to `scale` times its resolution.
///
/// Scales at or above 1 return the input unchanged. Otherwise the image is
/// blurred with a Gaussian of standard deviation `0.5 / scale` voxels before
/// linear resampling, to avoid aliasing.
pub fn downscale<B: Backend>(image: &Image, scale: f64, device: &B::Device) -> Image {
    if scale >= 1.0 {
        return image.clone();
    }
    let smoothed = GaussianFilter::<B>::from_voxel_sigma(0.5 / scale).apply(image, device);
    ResampleImageFilter::new(scaled_header(image.header(), scale)).apply(&smoothed)
}

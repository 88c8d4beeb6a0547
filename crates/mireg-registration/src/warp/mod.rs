//! Displacement and deformation field algebra.
//!
//! Fields are three-volume images. A *displacement* stores `d(p)`, an offset
//! in scanner units from the voxel's own position `p`; a *deformation* stores
//! the absolute scanner position `p + d(p)`. Sampling a field outside its grid
//! yields a zero displacement.

pub mod compose;
pub mod convert;
pub mod invert;
pub mod jacobian;
pub mod update;
pub mod warp_image;

pub use compose::{compose_displacements, compose_linear_deformation, compose_linear_displacement};
pub use convert::{deformation2displacement, displacement2deformation};
pub use invert::{invert_displacement, InversionConfig};
pub use jacobian::{central_gradient, jacobian_determinants, jacobian_matrices, negative_jacobian_count};
pub use update::update_displacement_scaling_and_squaring;
pub use warp_image::{warp_image, warp_mask, WarpedImage};

use mireg_core::filter::ResampleImageFilter;
use mireg_core::image::{Header, Image};
use mireg_core::interpolation::ImageSampler;
use nalgebra::Vector3;

/// Zero displacement field on the spatial grid of `header`.
pub fn zero_field(header: &Header) -> Image {
    Image::zeros(header.clone().with_volumes(3))
}

/// Regrid a displacement field onto another grid with linear interpolation.
///
/// Displacements are in scanner units, so no rescaling is needed between
/// pyramid levels.
pub fn resample_field(field: &Image, header: &Header) -> Image {
    ResampleImageFilter::new(header.clone().with_volumes(3)).apply(field)
}

/// Displacement at an arbitrary scanner position; zero outside the grid.
#[inline]
pub(crate) fn sample_vector(sampler: &ImageSampler<'_>, p: &Vector3<f64>) -> Vector3<f64> {
    let mut v = [0.0; 3];
    if sampler.value(p, &mut v) {
        Vector3::new(v[0], v[1], v[2])
    } else {
        Vector3::zeros()
    }
}

/// Largest displacement magnitude, in scanner units.
pub fn max_norm(field: &Image) -> f64 {
    (0..field.header().nvoxels())
        .map(|i| field.vector(i).norm())
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_constant_field() {
        let header = Header::unit([8, 8, 8]);
        let mut field = zero_field(&header);
        for i in 0..header.nvoxels() {
            field.set_vector(i, &Vector3::new(1.5, 0.0, -2.0));
        }
        let coarse = mireg_core::filter::scaled_header(&header, 0.5);
        let out = resample_field(&field, &coarse);
        assert_eq!(out.header().dims(), [4, 4, 4]);
        assert!((out.vector(5) - Vector3::new(1.5, 0.0, -2.0)).norm() < 1e-6);
        assert!((max_norm(&out) - 2.5).abs() < 1e-6);
    }
}

//! Pulling images through deformation fields.

use mireg_core::image::Image;
use mireg_core::interpolation::ImageSampler;
use nalgebra::Vector3;
use rayon::prelude::*;

/// An image resampled onto a deformation's grid, plus which voxels landed
/// inside the source field of view.
#[derive(Debug, Clone)]
pub struct WarpedImage {
    pub image: Image,
    pub valid: Vec<bool>,
}

/// Sample `image` at `φ(m)` for every voxel `m` of `deformation`.
///
/// Voxels mapped outside the source field of view are set to zero and marked
/// invalid.
pub fn warp_image(image: &Image, deformation: &Image) -> WarpedImage {
    let nv = image.nvols();
    let header = deformation
        .header()
        .clone()
        .with_vol_shape(image.header().vol_shape().to_vec());
    let mut out = Image::zeros(header.clone());
    let mut valid = vec![false; header.nvoxels()];
    let sampler = ImageSampler::new(image);

    out.data_mut()
        .par_chunks_mut(nv)
        .zip(valid.par_iter_mut())
        .enumerate()
        .for_each_init(
            || vec![0.0f64; nv],
            |buf, (i, (voxel, ok))| {
                let p = deformation.vector(i);
                *ok = sampler.value(&p, buf);
                if *ok {
                    for (o, v) in voxel.iter_mut().zip(buf.iter()) {
                        *o = *v as f32;
                    }
                }
            },
        );
    WarpedImage { image: out, valid }
}

/// Warp a binary mask: linear interpolation thresholded at one half.
pub fn warp_mask(mask: &Image, deformation: &Image) -> Image {
    let header = deformation.header().clone().with_volumes(1);
    let sampler = ImageSampler::new(mask);
    let data = (0..header.nvoxels())
        .into_par_iter()
        .map(|i| {
            let mut v = [0.0];
            let p: Vector3<f64> = deformation.vector(i);
            if sampler.value(&p, &mut v) && v[0] > 0.5 {
                1.0
            } else {
                0.0
            }
        })
        .collect();
    Image::from_data(header, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warp::{displacement2deformation, zero_field};
    use mireg_core::image::Header;

    #[test]
    fn test_identity_warp_reproduces_image() {
        let header = Header::unit([5, 4, 3]);
        let img = Image::from_fn(header.clone(), |p| (p.x + 2.0 * p.y) as f32);
        let warped = warp_image(&img, &displacement2deformation(&zero_field(&header)));
        assert_eq!(warped.image.data(), img.data());
        assert!(warped.valid.iter().all(|v| *v));
    }

    #[test]
    fn test_outside_is_zero_and_invalid() {
        let header = Header::unit([4, 1, 1]);
        let img = Image::from_data(header.clone(), vec![1.0, 2.0, 3.0, 4.0]);
        let mut disp = zero_field(&header);
        disp.set_vector(3, &Vector3::new(2.0, 0.0, 0.0));
        let warped = warp_image(&img, &displacement2deformation(&disp));
        assert_eq!(warped.image.data(), &[1.0, 2.0, 3.0, 0.0]);
        assert_eq!(warped.valid, vec![true, true, true, false]);
    }

    #[test]
    fn test_mask_is_binarised() {
        let header = Header::unit([4, 1, 1]);
        let mask = Image::from_data(header.clone(), vec![0.0, 1.0, 1.0, 0.0]);
        let mut disp = zero_field(&header);
        disp.set_vector(0, &Vector3::new(0.6, 0.0, 0.0));
        disp.set_vector(3, &Vector3::new(-0.4, 0.0, 0.0));
        let out = warp_mask(&mask, &displacement2deformation(&disp));
        assert_eq!(out.data(), &[1.0, 1.0, 1.0, 0.0]);
    }
}

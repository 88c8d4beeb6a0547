//! Nearest-neighbour interpolation, used for masks and label-like data.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::{in_bounds, Interpolator};
use crate::image::Image;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NearestInterpolator;

impl NearestInterpolator {
    pub fn new() -> Self {
        Self
    }
}

impl Interpolator for NearestInterpolator {
    fn sample(&self, image: &Image, index: &Vector3<f64>, out: &mut [f64]) -> bool {
        let header = image.header();
        let dims = header.dims();
        if !in_bounds(dims, index) {
            return false;
        }
        let pick = |v: f64, n: usize| (v.round().max(0.0) as usize).min(n - 1);
        let i = header.linear_index(
            pick(index.x, dims[0]),
            pick(index.y, dims[1]),
            pick(index.z, dims[2]),
        );
        for (o, v) in out.iter_mut().zip(image.voxel(i)) {
            *o = *v as f64;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Header;

    #[test]
    fn test_nearest_picks_closest_voxel() {
        let img = Image::from_fn(Header::unit([3, 1, 1]), |p| p.x as f32);
        let interp = NearestInterpolator::new();
        let mut out = [0.0];
        assert!(interp.sample(&img, &Vector3::new(1.4, 0.0, 0.0), &mut out));
        assert_eq!(out[0], 1.0);
        assert!(interp.sample(&img, &Vector3::new(1.6, 0.2, -0.2), &mut out));
        assert_eq!(out[0], 2.0);
        assert!(!interp.sample(&img, &Vector3::new(2.6, 0.0, 0.0), &mut out));
    }
}

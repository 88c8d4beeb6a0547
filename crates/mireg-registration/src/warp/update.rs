//! Diffeomorphic field update by scaling and squaring.

use mireg_core::image::Image;
use rayon::prelude::*;

use super::{compose_displacements, max_norm};

/// Largest displacement, in voxels, the scaled update may have before squaring.
const MAX_SCALED_NORM: f64 = 0.5;

/// Integrate `step × update` as a stationary velocity field and compose the
/// result in front of `displacement`: `e(m) + d(m + e(m))` with `e = exp(step × update)`.
///
/// The velocity is halved until no vector exceeds half a voxel, then squared
/// back the same number of times, which keeps the update invertible.
pub fn update_displacement_scaling_and_squaring(displacement: &Image, update: &Image, step: f64) -> Image {
    let spacing = update.header().spacing().min_spacing();
    let norm_voxels = max_norm(update) * step.abs() / spacing;
    let squarings = if norm_voxels > MAX_SCALED_NORM {
        (norm_voxels / MAX_SCALED_NORM).log2().ceil() as i32
    } else {
        0
    };
    let scale = step / 2f64.powi(squarings);

    let mut exp = update.clone();
    exp.data_mut()
        .par_iter_mut()
        .for_each(|v| *v = (*v as f64 * scale) as f32);
    for _ in 0..squarings {
        exp = compose_displacements(&exp, &exp);
    }
    tracing::trace!(squarings, norm_voxels, "scaling and squaring");
    compose_displacements(&exp, displacement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warp::{jacobian::negative_jacobian_count, zero_field};
    use mireg_core::image::Header;
    use nalgebra::Vector3;

    #[test]
    fn test_constant_update_is_exact() {
        let header = Header::unit([8, 8, 8]);
        let mut update = zero_field(&header);
        for i in 0..header.nvoxels() {
            update.set_vector(i, &Vector3::new(0.0, 0.0, 0.5));
        }
        let out = update_displacement_scaling_and_squaring(&zero_field(&header), &update, 0.5);
        let i = header.linear_index(3, 3, 3);
        assert!((out.vector(i) - Vector3::new(0.0, 0.0, 0.25)).norm() < 1e-6);
    }

    #[test]
    fn test_large_smooth_update_stays_invertible() {
        let header = Header::unit([16, 16, 16]);
        let mut update = zero_field(&header);
        for i in 0..header.nvoxels() {
            let [x, y, z] = header.coords(i);
            let r2 = ((x as f64 - 7.5).powi(2) + (y as f64 - 7.5).powi(2) + (z as f64 - 7.5).powi(2)) / 16.0;
            update.set_vector(i, &Vector3::new(3.0 * (-r2).exp(), 0.0, 0.0));
        }
        let out = update_displacement_scaling_and_squaring(&zero_field(&header), &update, 1.0);
        assert_eq!(negative_jacobian_count(&out), 0);
    }
}

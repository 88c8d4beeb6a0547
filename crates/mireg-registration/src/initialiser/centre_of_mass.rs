//! Translation from intensity centres of mass or grid centres.

use mireg_core::image::Image;
use mireg_core::transform::Transform;
use nalgebra::Vector3;
use rayon::prelude::*;

use super::{in_mask, weighted_intensity, Initialiser, InitialiserInput, REDUCTION_CHUNK};
use crate::error::{RegistrationError, Result};
use crate::multi_contrast::MultiContrastSetting;

/// Intensity-weighted mean scanner position of an image.
///
/// Partial sums are formed per fixed-size chunk and added in order, so the
/// result does not depend on thread scheduling.
pub fn centre_of_mass(
    image: &Image,
    mask: Option<&Image>,
    contrasts: &[MultiContrastSetting],
) -> Result<Vector3<f64>> {
    let header = image.header();
    let indices: Vec<usize> = (0..header.nvoxels()).collect();
    let partials: Vec<(Vector3<f64>, f64)> = indices
        .par_chunks(REDUCTION_CHUNK)
        .map(|chunk| {
            let mut sum = Vector3::zeros();
            let mut total = 0.0;
            for &i in chunk {
                if !in_mask(mask, i) {
                    continue;
                }
                let w = weighted_intensity(image, contrasts, i);
                let [x, y, z] = header.coords(i);
                sum += header.voxel_position(x, y, z) * w;
                total += w;
            }
            (sum, total)
        })
        .collect();
    let (sum, total) = partials
        .into_iter()
        .fold((Vector3::zeros(), 0.0), |(s, t), (ps, pt)| (s + ps, t + pt));

    if total == 0.0 || !total.is_finite() {
        return Err(RegistrationError::degenerate_input(
            "centre of mass is undefined: total (masked) intensity is zero",
        ));
    }
    Ok(sum / total)
}

/// Set the rotation centre to the midpoint of `c1` and `c2` and choose the
/// translation that maps `c1` onto `c2` under the current matrix.
pub(crate) fn align_points(transform: &mut Transform, c1: &Vector3<f64>, c2: &Vector3<f64>) {
    let centre = (c1 + c2) * 0.5;
    transform.set_centre_without_transform_update(centre);
    let t = c2 - centre - transform.matrix() * (c1 - centre);
    transform.set_translation(t);
}

/// Align the intensity centres of mass.
#[derive(Debug, Clone, Copy, Default)]
pub struct CentreOfMass;

impl Initialiser for CentreOfMass {
    fn initialise(&self, input: &InitialiserInput<'_>, transform: &mut Transform) -> Result<()> {
        let c1 = centre_of_mass(input.image1, input.mask1, input.contrasts)?;
        let c2 = centre_of_mass(input.image2, input.mask2, input.contrasts)?;
        tracing::debug!(?c1, ?c2, "centres of mass");
        align_points(transform, &c1, &c2);
        Ok(())
    }
}

/// Align the centres of the two voxel grids.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometricCentre;

impl Initialiser for GeometricCentre {
    fn initialise(&self, input: &InitialiserInput<'_>, transform: &mut Transform) -> Result<()> {
        let c1 = input.image1.header().centre();
        let c2 = input.image2.header().centre();
        align_points(transform, &c1, &c2);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mireg_core::image::Header;
    use mireg_core::transform::TransformKind;

    fn point_image(dims: [usize; 3], at: [usize; 3]) -> Image {
        let header = Header::unit(dims);
        let mut img = Image::zeros(header.clone());
        img.voxel_mut(header.linear_index(at[0], at[1], at[2]))[0] = 1.0;
        img
    }

    #[test]
    fn test_centre_of_mass_of_single_voxel() {
        let img = point_image([8, 8, 8], [2, 3, 5]);
        let c = centre_of_mass(&img, None, &[]).unwrap();
        assert!((c - Vector3::new(2.0, 3.0, 5.0)).norm() < 1e-12);
    }

    #[test]
    fn test_empty_mask_is_degenerate() {
        let img = point_image([4, 4, 4], [1, 1, 1]);
        let mask = Image::zeros(Header::unit([4, 4, 4]));
        let err = centre_of_mass(&img, Some(&mask), &[]).unwrap_err();
        assert!(matches!(err, RegistrationError::DegenerateInput(_)));
    }

    #[test]
    fn test_translation_maps_centre_to_centre() {
        let a = point_image([10, 10, 10], [2, 2, 2]);
        let b = point_image([10, 10, 10], [5, 6, 7]);
        let mut t = Transform::identity(TransformKind::Rigid);
        CentreOfMass
            .initialise(&InitialiserInput::new(&a, &b, &[]), &mut t)
            .unwrap();
        assert!((t.apply(&Vector3::new(2.0, 2.0, 2.0)) - Vector3::new(5.0, 6.0, 7.0)).norm() < 1e-12);
        assert!((t.centre() - Vector3::new(3.5, 4.0, 4.5)).norm() < 1e-12);
    }

    #[test]
    fn test_geometric_centre() {
        let a = Image::zeros(Header::unit([4, 4, 4]));
        let b = Image::zeros(Header::unit([8, 8, 8]));
        let mut t = Transform::identity(TransformKind::Affine);
        GeometricCentre
            .initialise(&InitialiserInput::new(&a, &b, &[]), &mut t)
            .unwrap();
        assert!((t.apply(&a.header().centre()) - b.header().centre()).norm() < 1e-12);
    }
}

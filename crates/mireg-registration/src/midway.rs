//! Midway space: the grid both images are resampled onto.

use mireg_core::image::Header;
use mireg_core::spatial::{Direction, Point3, Spacing3};
use mireg_core::transform::matrix::polar_rotation;
use mireg_core::transform::Transform;
use nalgebra::Vector3;

use crate::error::{RegistrationError, Result};
use crate::validation::validate_scale_factor;

/// Grid of the average space of two images under the current half transforms.
///
/// `half` maps image1 into midway space and `half_inverse` maps image2 into
/// it. The grid axes are the closest rotation to the average of both images'
/// mapped axes, the spacing is the mean of both spacings divided by `scale`,
/// and the extent is the bounding box of all sixteen mapped corners in that
/// rotated frame, centred on the box.
pub fn midway_header(
    header1: &Header,
    header2: &Header,
    half: &Transform,
    half_inverse: &Transform,
    scale: f64,
) -> Result<Header> {
    validate_scale_factor(scale)?;

    let d1 = half.matrix() * header1.direction().0;
    let d2 = half_inverse.matrix() * header2.direction().0;
    let rotation = polar_rotation(&((d1 + d2) * 0.5));

    let mut spacing = [0.0; 3];
    for (a, s) in spacing.iter_mut().enumerate() {
        *s = 0.5 * (header1.spacing()[a] + header2.spacing()[a]) / scale;
    }

    let corners: Vec<Vector3<f64>> = header1
        .corners()
        .iter()
        .map(|c| half.apply(c))
        .chain(header2.corners().iter().map(|c| half_inverse.apply(c)))
        .map(|p| rotation.transpose() * p)
        .collect();
    if corners.iter().any(|c| !c.iter().all(|v| v.is_finite())) {
        return Err(RegistrationError::numerical_instability(
            "midway corners are not finite",
        ));
    }
    let lo = corners.iter().fold(Vector3::repeat(f64::INFINITY), |m, c| m.inf(c));
    let hi = corners.iter().fold(Vector3::repeat(f64::NEG_INFINITY), |m, c| m.sup(c));

    let mut dims = [0usize; 3];
    let mut first = Vector3::zeros();
    for a in 0..3 {
        let extent = hi[a] - lo[a];
        dims[a] = (extent / spacing[a]).ceil() as usize + 1;
        first[a] = 0.5 * (lo[a] + hi[a]) - 0.5 * spacing[a] * (dims[a] - 1) as f64;
    }
    let origin = rotation * first;

    Ok(Header::new(
        dims,
        Point3::new([origin.x, origin.y, origin.z]),
        Spacing3::new(spacing),
        Direction(rotation),
    ))
}

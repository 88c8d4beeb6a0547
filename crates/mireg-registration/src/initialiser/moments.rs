//! Rotation from the principal axes of the second intensity moments.

use mireg_core::image::Image;
use mireg_core::transform::Transform;
use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use rayon::prelude::*;

use super::centre_of_mass::{align_points, centre_of_mass};
use super::{in_mask, weighted_intensity, Initialiser, InitialiserInput, REDUCTION_CHUNK};
use crate::error::{RegistrationError, Result};
use crate::multi_contrast::MultiContrastSetting;

const EIGEN_EPS: f64 = 1e-12;
const EIGEN_MAX_ITER: usize = 1000;

/// Intensity-weighted covariance of scanner positions about `centre`.
pub fn covariance(
    image: &Image,
    mask: Option<&Image>,
    contrasts: &[MultiContrastSetting],
    centre: &Vector3<f64>,
) -> Result<Matrix3<f64>> {
    let header = image.header();
    let indices: Vec<usize> = (0..header.nvoxels()).collect();
    let partials: Vec<(Matrix3<f64>, f64)> = indices
        .par_chunks(REDUCTION_CHUNK)
        .map(|chunk| {
            let mut sum = Matrix3::zeros();
            let mut total = 0.0;
            for &i in chunk {
                if !in_mask(mask, i) {
                    continue;
                }
                let w = weighted_intensity(image, contrasts, i);
                let [x, y, z] = header.coords(i);
                let d = header.voxel_position(x, y, z) - centre;
                sum += d * d.transpose() * w;
                total += w;
            }
            (sum, total)
        })
        .collect();
    let (sum, total) = partials
        .into_iter()
        .fold((Matrix3::zeros(), 0.0), |(s, t), (ps, pt)| (s + ps, t + pt));
    if total == 0.0 || !total.is_finite() {
        return Err(RegistrationError::degenerate_input(
            "second moments are undefined: total (masked) intensity is zero",
        ));
    }
    Ok(sum / total)
}

/// Eigenvectors of `cov` as columns, largest eigenvalue first.
fn principal_axes(cov: &Matrix3<f64>) -> Result<Matrix3<f64>> {
    let eig = SymmetricEigen::try_new(*cov, EIGEN_EPS, EIGEN_MAX_ITER).ok_or_else(|| {
        RegistrationError::degenerate_input("eigendecomposition of the moment tensor did not converge")
    })?;
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));
    let mut axes = Matrix3::zeros();
    for (col, &k) in order.iter().enumerate() {
        axes.set_column(col, &eig.eigenvectors.column(k));
    }
    Ok(axes)
}

/// Rotation taking the principal frame of image1 onto that of image2.
///
/// Eigenvectors are sign-ambiguous: image1's frame is made right-handed, then
/// each axis of image2's frame is flipped to agree with its image1
/// counterpart. If that leaves image2's frame left-handed, the axis that
/// agrees least is flipped back.
pub fn frame_rotation(cov1: &Matrix3<f64>, cov2: &Matrix3<f64>) -> Result<Matrix3<f64>> {
    let mut e1 = principal_axes(cov1)?;
    let mut e2 = principal_axes(cov2)?;

    if e1.determinant() < 0.0 {
        let flipped = -e1.column(2);
        e1.set_column(2, &flipped);
    }
    let mut dots = [0.0; 3];
    for k in 0..3 {
        let d = e1.column(k).dot(&e2.column(k));
        if d < 0.0 {
            let flipped = -e2.column(k);
            e2.set_column(k, &flipped);
        }
        dots[k] = d.abs();
    }
    if e2.determinant() < 0.0 {
        let weakest = (0..3)
            .min_by(|&a, &b| dots[a].total_cmp(&dots[b]))
            .unwrap_or(2);
        let flipped = -e2.column(weakest);
        e2.set_column(weakest, &flipped);
    }
    Ok(e2 * e1.transpose())
}

/// Principal-axis alignment.
///
/// Sets the centre to the midpoint of the centres of mass, the matrix to the
/// frame rotation and the translation that maps centre onto centre. If the
/// moment tensors cannot be diagonalised, logs a warning and falls back to
/// centre-of-mass alignment.
#[derive(Debug, Clone, Copy, Default)]
pub struct Moments;

impl Initialiser for Moments {
    fn initialise(&self, input: &InitialiserInput<'_>, transform: &mut Transform) -> Result<()> {
        let c1 = centre_of_mass(input.image1, input.mask1, input.contrasts)?;
        let c2 = centre_of_mass(input.image2, input.mask2, input.contrasts)?;

        let rotation = covariance(input.image1, input.mask1, input.contrasts, &c1).and_then(|cov1| {
            let cov2 = covariance(input.image2, input.mask2, input.contrasts, &c2)?;
            frame_rotation(&cov1, &cov2)
        });
        match rotation {
            Ok(r) => transform.set_matrix(r),
            Err(e) => {
                tracing::warn!(error = %e, "moments initialisation failed, using centre of mass only");
            }
        }
        align_points(transform, &c1, &c2);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mireg_core::image::Header;
    use mireg_core::transform::TransformKind;
    use nalgebra::Rotation3;

    /// Anisotropic Gaussian blob with axes rotated by `r`.
    fn ellipsoid(r: &Matrix3<f64>, centre: Vector3<f64>) -> Image {
        let inv = r.transpose();
        Image::from_fn(Header::unit([24, 24, 24]), |p| {
            let q = inv * (p - centre);
            (-(q.x * q.x / 30.0 + q.y * q.y / 10.0 + q.z * q.z / 3.0)).exp() as f32
        })
    }

    #[test]
    fn test_recovers_rotation_of_ellipsoid() {
        let r = Rotation3::from_euler_angles(0.0, 0.0, 0.4).into_inner();
        let a = ellipsoid(&Matrix3::identity(), Vector3::new(11.5, 11.5, 11.5));
        let b = ellipsoid(&r, Vector3::new(11.5, 11.5, 11.5));
        let mut t = Transform::identity(TransformKind::Rigid);
        Moments
            .initialise(&InitialiserInput::new(&a, &b, &[]), &mut t)
            .unwrap();
        assert!((t.matrix() - r).abs().max() < 0.02);
        assert!((t.matrix().determinant() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_frame_rotation_is_proper() {
        let cov1 = Matrix3::from_diagonal(&Vector3::new(3.0, 2.0, 1.0));
        let flip = Matrix3::from_diagonal(&Vector3::new(1.0, -1.0, 1.0));
        let cov2 = flip * cov1 * flip;
        let r = frame_rotation(&cov1, &cov2).unwrap();
        assert!((r.determinant() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_repeated_runs_are_bit_identical() {
        let r = Rotation3::from_euler_angles(0.2, -0.1, 0.3).into_inner();
        let a = ellipsoid(&Matrix3::identity(), Vector3::new(11.0, 12.0, 11.5));
        let b = ellipsoid(&r, Vector3::new(12.0, 11.0, 11.5));
        let input = InitialiserInput::new(&a, &b, &[]);
        let mut t1 = Transform::identity(TransformKind::Rigid);
        let mut t2 = Transform::identity(TransformKind::Rigid);
        Moments.initialise(&input, &mut t1).unwrap();
        Moments.initialise(&input, &mut t2).unwrap();
        assert_eq!(t1, t2);
    }
}

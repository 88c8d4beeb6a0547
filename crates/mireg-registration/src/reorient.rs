//! Reorientation of spherical-harmonic (FOD) coefficients under a local
//! linear map.
//!
//! A series is decomposed into weights on apodised point spread functions
//! centred on a fixed dense direction set, the directions are mapped through
//! the inverse Jacobian and renormalised, and the PSFs are re-summed at their
//! new orientation. With modulation each PSF is also scaled by the local
//! change in fibre density.

use std::ops::Range;

use mireg_core::directions::golden_spiral;
use mireg_core::image::Image;
use mireg_core::sh;
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use rayon::prelude::*;

use crate::error::{RegistrationError, Result};
use crate::multi_contrast::MultiContrastSetting;

/// Minimum size of the direction set.
pub const MIN_DIRECTIONS: usize = 300;

/// Reorientation operator for one harmonic order.
#[derive(Debug, Clone)]
pub struct Reorienter {
    lmax: usize,
    directions: Vec<Vector3<f64>>,
    /// Pseudo-inverse of the PSF matrix at the reference directions, `N × n`.
    decompose: DMatrix<f64>,
    modulate: bool,
}

impl Reorienter {
    pub fn new(lmax: usize, modulate: bool) -> Result<Self> {
        let ndirs = MIN_DIRECTIONS.max(2 * sh::n_for_l(lmax));
        Self::with_directions(lmax, golden_spiral(ndirs), modulate)
    }

    pub fn with_directions(lmax: usize, directions: Vec<Vector3<f64>>, modulate: bool) -> Result<Self> {
        let n = sh::n_for_l(lmax);
        if directions.len() <= n {
            return Err(RegistrationError::invalid_configuration(format!(
                "reorientation needs more than {} directions for lmax {}, got {}",
                n,
                lmax,
                directions.len()
            )));
        }
        let psf = psf_matrix(lmax, &directions, None);
        let decompose = psf.pseudo_inverse(1e-10).map_err(|e| {
            RegistrationError::numerical_instability(format!(
                "pseudo-inverse of the PSF matrix failed: {}",
                e
            ))
        })?;
        Ok(Self {
            lmax,
            directions,
            decompose,
            modulate,
        })
    }

    pub fn lmax(&self) -> usize {
        self.lmax
    }

    pub fn ncoefs(&self) -> usize {
        sh::n_for_l(self.lmax)
    }

    /// `n × n` matrix reorienting a series for the local Jacobian `jacobian`
    /// of the map from the output grid into the image being sampled.
    ///
    /// Returns `None` for a singular Jacobian.
    pub fn matrix(&self, jacobian: &Matrix3<f64>) -> Option<DMatrix<f64>> {
        let inv = jacobian.try_inverse()?;
        let det = jacobian.determinant();
        let mut scales = Vec::with_capacity(self.directions.len());
        let mapped: Vec<Vector3<f64>> = self
            .directions
            .iter()
            .map(|d| {
                let v = inv * d;
                let norm = v.norm();
                scales.push(norm * det.abs());
                v / norm
            })
            .collect();
        if mapped.iter().any(|v| !v.iter().all(|c| c.is_finite())) {
            return None;
        }
        let modulation = if self.modulate { Some(scales.as_slice()) } else { None };
        Some(psf_matrix(self.lmax, &mapped, modulation) * &self.decompose)
    }
}

/// `n × N` matrix whose columns are PSFs along `directions`.
fn psf_matrix(lmax: usize, directions: &[Vector3<f64>], scales: Option<&[f64]>) -> DMatrix<f64> {
    let n = sh::n_for_l(lmax);
    let mut m = DMatrix::zeros(n, directions.len());
    for (col, d) in directions.iter().enumerate() {
        let s = scales.map_or(1.0, |s| s[col]);
        for (row, v) in sh::apsf(lmax, d).into_iter().enumerate() {
            m[(row, col)] = v * s;
        }
    }
    m
}

/// Apply `matrix` to `coefs` in place.
#[inline]
fn apply_block(matrix: &DMatrix<f64>, coefs: &mut [f64]) {
    let v = matrix * DVector::from_column_slice(coefs);
    coefs.copy_from_slice(v.as_slice());
}

/// Reorientation of every FOD contrast inside a concatenated voxel vector.
///
/// Each contrast is reoriented independently at its own order using only the
/// block of coefficients it owns. Blocks whose zeroth coefficient is zero are
/// left untouched.
#[derive(Debug, Clone)]
pub struct FodReorientation {
    blocks: Vec<(Range<usize>, Reorienter)>,
}

impl FodReorientation {
    /// Build for the current level, or `None` if no contrast needs reorienting.
    pub fn new(contrasts: &[MultiContrastSetting], modulate: bool) -> Result<Option<Self>> {
        let mut blocks: Vec<(Range<usize>, Reorienter)> = Vec::new();
        for c in contrasts.iter().filter(|c| c.reorients()) {
            let reorienter = match blocks.iter().find(|(_, r)| r.lmax() == c.lmax) {
                Some((_, r)) => r.clone(),
                None => Reorienter::new(c.lmax, modulate)?,
            };
            blocks.push((c.range(), reorienter));
        }
        Ok(if blocks.is_empty() { None } else { Some(Self { blocks }) })
    }

    /// Per-contrast matrices for one Jacobian.
    pub fn matrices(&self, jacobian: &Matrix3<f64>) -> Option<Vec<DMatrix<f64>>> {
        self.blocks.iter().map(|(_, r)| r.matrix(jacobian)).collect()
    }

    /// Reorient one voxel's values with precomputed matrices.
    pub fn apply(&self, matrices: &[DMatrix<f64>], values: &mut [f64]) {
        for ((range, _), m) in self.blocks.iter().zip(matrices) {
            let block = &mut values[range.clone()];
            if block[0] == 0.0 {
                continue;
            }
            apply_block(m, block);
        }
    }

    /// Reorient one voxel's spatial gradients: each axis of the gradient is a
    /// coefficient series of its own.
    pub fn apply_to_gradients(&self, matrices: &[DMatrix<f64>], values: &[f64], grads: &mut [Vector3<f64>]) {
        for ((range, _), m) in self.blocks.iter().zip(matrices) {
            if values[range.start] == 0.0 {
                continue;
            }
            for axis in 0..3 {
                let mut column: Vec<f64> = grads[range.clone()].iter().map(|g| g[axis]).collect();
                apply_block(m, &mut column);
                for (g, v) in grads[range.clone()].iter_mut().zip(column) {
                    g[axis] = v;
                }
            }
        }
    }

    /// True if any FOD block of the voxel has a non-zero zeroth coefficient.
    fn has_fod(&self, voxel: &[f32]) -> bool {
        self.blocks.iter().any(|(range, _)| voxel[range.start] != 0.0)
    }

    /// Reorient every voxel of `image` with the Jacobian returned by
    /// `jacobian(voxel_index)`; voxels where it returns `None` are skipped.
    ///
    /// Voxels without any FOD signal are skipped before the Jacobian or the
    /// reorientation matrices are computed.
    pub fn apply_to_image<F>(&self, image: &mut Image, jacobian: F)
    where
        F: Fn(usize) -> Option<Matrix3<f64>> + Sync,
    {
        let nv = image.nvols();
        image
            .data_mut()
            .par_chunks_mut(nv)
            .enumerate()
            .for_each(|(i, voxel)| {
                if !self.has_fod(voxel) {
                    return;
                }
                let Some(j) = jacobian(i) else { return };
                let Some(matrices) = self.matrices(&j) else { return };
                let mut values: Vec<f64> = voxel.iter().map(|v| *v as f64).collect();
                self.apply(&matrices, &mut values);
                for (o, v) in voxel.iter_mut().zip(values) {
                    *o = v as f32;
                }
            });
    }

    /// Reorient every voxel with one constant Jacobian.
    pub fn apply_linear(&self, image: &mut Image, jacobian: &Matrix3<f64>) {
        let Some(matrices) = self.matrices(jacobian) else {
            tracing::warn!("singular linear map, FOD reorientation skipped");
            return;
        };
        let nv = image.nvols();
        image.data_mut().par_chunks_mut(nv).for_each(|voxel| {
            let mut values: Vec<f64> = voxel.iter().map(|v| *v as f64).collect();
            self.apply(&matrices, &mut values);
            for (o, v) in voxel.iter_mut().zip(values) {
                *o = v as f32;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Rotation3;

    fn fod_along(lmax: usize, dir: &Vector3<f64>) -> Vec<f64> {
        sh::apsf(lmax, dir)
    }

    #[test]
    fn test_identity_leaves_series_unchanged() {
        let r = Reorienter::new(4, false).unwrap();
        let m = r.matrix(&Matrix3::identity()).unwrap();
        let mut coefs = fod_along(4, &Vector3::new(0.3, -0.5, 0.8).normalize());
        let before = coefs.clone();
        apply_block(&m, &mut coefs);
        for (a, b) in coefs.iter().zip(&before) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rotation_moves_peak() {
        // sampling map rotates z onto x, so the fibre seen along z in the
        // sampled image must appear along the inverse-mapped direction
        let rot = Rotation3::from_axis_angle(&Vector3::y_axis(), std::f64::consts::FRAC_PI_2);
        let r = Reorienter::new(4, false).unwrap();
        let m = r.matrix(rot.matrix()).unwrap();
        let mut coefs = fod_along(4, &Vector3::z());
        apply_block(&m, &mut coefs);
        let expected_peak = rot.inverse() * Vector3::z();
        let at_peak = sh::value(&coefs, &expected_peak);
        let at_old = sh::value(&coefs, &Vector3::z());
        assert!(at_peak > 5.0 * at_old.abs());
    }

    #[test]
    fn test_contrasts_reoriented_independently() {
        let contrasts = vec![
            MultiContrastSetting::new(0, 1, false, 1.0).unwrap(),
            MultiContrastSetting::new(1, 6, true, 1.0).unwrap(),
        ];
        let plan = FodReorientation::new(&contrasts, false).unwrap().unwrap();
        let rot = Rotation3::from_axis_angle(&Vector3::x_axis(), 0.7);
        let matrices = plan.matrices(rot.matrix()).unwrap();
        let mut values = vec![5.0];
        values.extend(fod_along(2, &Vector3::z()));
        let scalar = values[0];
        plan.apply(&matrices, &mut values);
        assert_eq!(values[0], scalar);
    }

    #[test]
    fn test_zero_voxels_skipped() {
        let contrasts = vec![MultiContrastSetting::new(0, 6, true, 1.0).unwrap()];
        let plan = FodReorientation::new(&contrasts, false).unwrap().unwrap();
        let rot = Rotation3::from_axis_angle(&Vector3::x_axis(), 0.7);
        let matrices = plan.matrices(rot.matrix()).unwrap();
        let mut values = vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        plan.apply(&matrices, &mut values);
        assert_eq!(values, vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_background_voxels_skip_jacobian() {
        use mireg_core::image::Header;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let contrasts = vec![
            MultiContrastSetting::new(0, 1, false, 1.0).unwrap(),
            MultiContrastSetting::new(1, 6, true, 1.0).unwrap(),
        ];
        let plan = FodReorientation::new(&contrasts, false).unwrap().unwrap();
        let mut image = Image::zeros(Header::unit([4, 1, 1]).with_volumes(7));
        // voxel 0 has a scalar value but no FOD, voxel 2 carries a fibre
        image.voxel_mut(0)[0] = 3.0;
        for (o, v) in image.voxel_mut(2)[1..].iter_mut().zip(fod_along(2, &Vector3::z())) {
            *o = v as f32;
        }
        let before = image.clone();

        let calls = AtomicUsize::new(0);
        let rot = Rotation3::from_axis_angle(&Vector3::x_axis(), 0.7);
        plan.apply_to_image(&mut image, |_| {
            calls.fetch_add(1, Ordering::Relaxed);
            Some(*rot.matrix())
        });

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        for i in [0, 1, 3] {
            assert_eq!(image.voxel(i), before.voxel(i));
        }
        assert_ne!(image.voxel(2), before.voxel(2));
    }

    #[test]
    fn test_scalar_only_needs_no_plan() {
        let contrasts = vec![MultiContrastSetting::scalar(1)];
        assert!(FodReorientation::new(&contrasts, false).unwrap().is_none());
    }
}

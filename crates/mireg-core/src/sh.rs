//! Real, even-order spherical harmonics as used for FOD images.
//!
//! Coefficients of degree `l` (even) and order `m ∈ [-l, l]` live at index
//! `l(l+1)/2 + m`. The basis is orthonormal on the sphere, with
//! `√2 P̄_l^m cos(mφ)` for `m > 0`, `√2 P̄_l^|m| sin(|m|φ)` for `m < 0`, and no
//! Condon–Shortley phase.

use std::f64::consts::PI;

use nalgebra::{DMatrix, Vector3};

/// Number of coefficients of an even-order series truncated at `lmax`.
#[inline]
pub fn n_for_l(lmax: usize) -> usize {
    (lmax + 1) * (lmax + 2) / 2
}

/// Largest even `lmax` with `n_for_l(lmax) <= n`.
pub fn l_for_n(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let mut l = 0;
    while n_for_l(l + 2) <= n {
        l += 2;
    }
    l
}

/// Coefficient index of degree `l` (even) and order `m`.
#[inline]
pub fn index(l: usize, m: isize) -> usize {
    ((l * (l + 1) / 2) as isize + m) as usize
}

/// Fully normalised associated Legendre values `P̄_l^m(x)` for `0 <= m <= l <= lmax`,
/// triangular layout `l(l+1)/2 + m`.
fn legendre_table(lmax: usize, x: f64) -> Vec<f64> {
    let tri = |l: usize, m: usize| l * (l + 1) / 2 + m;
    let mut p = vec![0.0; tri(lmax, lmax) + 1];
    let s = (1.0 - x * x).max(0.0).sqrt();

    p[0] = 1.0 / (4.0 * PI).sqrt();
    for m in 1..=lmax {
        p[tri(m, m)] = p[tri(m - 1, m - 1)] * ((2 * m + 1) as f64 / (2 * m) as f64).sqrt() * s;
    }
    for m in 0..lmax {
        p[tri(m + 1, m)] = x * ((2 * m + 3) as f64).sqrt() * p[tri(m, m)];
    }
    for m in 0..=lmax {
        for l in (m + 2)..=lmax {
            let (lf, mf) = (l as f64, m as f64);
            let a = ((4.0 * lf * lf - 1.0) / (lf * lf - mf * mf)).sqrt();
            let b = (((lf - 1.0) * (lf - 1.0) - mf * mf) / (4.0 * (lf - 1.0) * (lf - 1.0) - 1.0)).sqrt();
            p[tri(l, m)] = a * (x * p[tri(l - 1, m)] - b * p[tri(l - 2, m)]);
        }
    }
    p
}

/// All basis functions up to `lmax` evaluated along the unit vector `dir`.
pub fn basis(lmax: usize, dir: &Vector3<f64>) -> Vec<f64> {
    let x = dir.z.clamp(-1.0, 1.0);
    let phi = dir.y.atan2(dir.x);
    let legendre = legendre_table(lmax, x);
    let tri = |l: usize, m: usize| l * (l + 1) / 2 + m;

    let mut out = vec![0.0; n_for_l(lmax)];
    for l in (0..=lmax).step_by(2) {
        out[index(l, 0)] = legendre[tri(l, 0)];
        for m in 1..=l {
            let p = std::f64::consts::SQRT_2 * legendre[tri(l, m)];
            let (s, c) = (m as f64 * phi).sin_cos();
            out[index(l, m as isize)] = p * c;
            out[index(l, -(m as isize))] = p * s;
        }
    }
    out
}

/// Amplitude of the series `coefs` along `dir`.
pub fn value(coefs: &[f64], dir: &Vector3<f64>) -> f64 {
    let lmax = l_for_n(coefs.len());
    basis(lmax, dir).iter().zip(coefs).map(|(b, c)| b * c).sum()
}

/// Hann taper applied to degree `l` of an apodised point spread function.
#[inline]
pub fn apodisation(l: usize, lmax: usize) -> f64 {
    0.5 * (1.0 + (PI * l as f64 / (lmax as f64 + 2.0)).cos())
}

/// Coefficients of an apodised point spread function (a smoothed delta) oriented along `dir`.
pub fn apsf(lmax: usize, dir: &Vector3<f64>) -> Vec<f64> {
    let mut out = basis(lmax, dir);
    for l in (0..=lmax).step_by(2) {
        let w = apodisation(l, lmax);
        let start = index(l, -(l as isize));
        out[start..start + 2 * l + 1].iter_mut().for_each(|c| *c *= w);
    }
    out
}

/// Matrix mapping coefficients to amplitudes, one row per direction.
pub fn transform_matrix(lmax: usize, dirs: &[Vector3<f64>]) -> DMatrix<f64> {
    let n = n_for_l(lmax);
    let mut m = DMatrix::zeros(dirs.len(), n);
    for (r, d) in dirs.iter().enumerate() {
        for (c, v) in basis(lmax, d).into_iter().enumerate() {
            m[(r, c)] = v;
        }
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        assert_eq!(n_for_l(0), 1);
        assert_eq!(n_for_l(2), 6);
        assert_eq!(n_for_l(4), 15);
        assert_eq!(n_for_l(8), 45);
        assert_eq!(l_for_n(45), 8);
        assert_eq!(l_for_n(16), 4);
        assert_eq!(index(2, -2), 1);
        assert_eq!(index(4, 4), 14);
    }

    #[test]
    fn test_known_values_on_z_axis() {
        let b = basis(2, &Vector3::z());
        assert!((b[0] - 1.0 / (4.0 * PI).sqrt()).abs() < 1e-12);
        assert!((b[index(2, 0)] - (5.0 / (4.0 * PI)).sqrt()).abs() < 1e-12);
        for m in [-2isize, -1, 1, 2] {
            assert!(b[index(2, m)].abs() < 1e-12);
        }
    }

    #[test]
    fn test_addition_theorem() {
        let d = Vector3::new(0.3, -0.5, 0.8).normalize();
        let b = basis(8, &d);
        for l in (0..=8).step_by(2) {
            let start = index(l, -(l as isize));
            let power: f64 = b[start..start + 2 * l + 1].iter().map(|v| v * v).sum();
            let expected = (2 * l + 1) as f64 / (4.0 * PI);
            assert!((power - expected).abs() < 1e-10, "l = {}", l);
        }
    }

    #[test]
    fn test_apsf_peaks_along_its_axis() {
        let d = Vector3::new(1.0, 1.0, 0.0).normalize();
        let psf = apsf(8, &d);
        let along = value(&psf, &d);
        let across = value(&psf, &Vector3::z());
        assert!(along > 0.0);
        assert!(along > 5.0 * across.abs());
    }
}

//! Spatial derivatives of images and displacement fields.

use mireg_core::image::Image;
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;

/// Scanner-space gradient of every volume at every voxel, by central
/// differences (one-sided at the grid edges, zero along axes of length one).
///
/// Element `index * nvols + v` holds the gradient of volume `v`.
pub fn central_gradient(image: &Image) -> Vec<Vector3<f64>> {
    let header = image.header();
    let dims = header.dims();
    let nv = image.nvols();
    let to_scanner = header.index_gradient_to_scanner();
    let mut out = vec![Vector3::zeros(); header.nvoxels() * nv];

    out.par_chunks_mut(nv).enumerate().for_each(|(i, grads)| {
        let c = header.coords(i);
        for axis in 0..3 {
            if dims[axis] < 2 {
                continue;
            }
            let (lo, hi) = (c[axis].saturating_sub(1), (c[axis] + 1).min(dims[axis] - 1));
            let mut a = c;
            let mut b = c;
            a[axis] = lo;
            b[axis] = hi;
            let width = (hi - lo) as f64;
            let va = image.voxel(header.linear_index(a[0], a[1], a[2]));
            let vb = image.voxel(header.linear_index(b[0], b[1], b[2]));
            for v in 0..nv {
                grads[v][axis] = (vb[v] as f64 - va[v] as f64) / width;
            }
        }
        for g in grads.iter_mut() {
            *g = to_scanner * *g;
        }
    });
    out
}

/// Jacobian `I + ∂d/∂p` of `id + displacement` at every voxel.
pub fn jacobian_matrices(displacement: &Image) -> Vec<Matrix3<f64>> {
    let grads = central_gradient(displacement);
    grads
        .par_chunks(3)
        .map(|g| Matrix3::from_rows(&[g[0].transpose(), g[1].transpose(), g[2].transpose()]) + Matrix3::identity())
        .collect()
}

pub fn jacobian_determinants(displacement: &Image) -> Vec<f64> {
    jacobian_matrices(displacement)
        .par_iter()
        .map(|j| j.determinant())
        .collect()
}

/// Number of voxels where the map folds (`det J <= 0`).
pub fn negative_jacobian_count(displacement: &Image) -> usize {
    jacobian_determinants(displacement)
        .par_iter()
        .filter(|d| **d <= 0.0)
        .count()
}

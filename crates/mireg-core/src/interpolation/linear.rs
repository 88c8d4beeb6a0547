//! Trilinear interpolation with analytic spatial gradient.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use super::{in_bounds, Interpolator};
use crate::image::Image;

/// Trilinear interpolator.
///
/// Neighbour indices are clamped to the grid, so values are replicated out to
/// the half-voxel border and the gradient there is zero along the clamped axis.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LinearInterpolator;

struct AxisWeights {
    i0: usize,
    i1: usize,
    t: f64,
}

#[inline]
fn axis_weights(v: f64, n: usize) -> AxisWeights {
    let f = v.floor();
    let base = f as isize;
    let hi = n as isize - 1;
    AxisWeights {
        i0: base.clamp(0, hi) as usize,
        i1: (base + 1).clamp(0, hi) as usize,
        t: v - f,
    }
}

impl LinearInterpolator {
    /// Create a new linear interpolator.
    pub fn new() -> Self {
        Self
    }

    /// Sample all volumes and their gradients along the voxel axes.
    ///
    /// `gradients[v]` receives `∂value_v/∂index`; convert to scanner space with
    /// [`crate::image::Header::index_gradient_to_scanner`].
    pub fn sample_with_gradient(
        &self,
        image: &Image,
        index: &Vector3<f64>,
        values: &mut [f64],
        gradients: &mut [Vector3<f64>],
    ) -> bool {
        let header = image.header();
        let dims = header.dims();
        if !in_bounds(dims, index) {
            return false;
        }
        let nv = image.nvols();
        let ax = axis_weights(index.x, dims[0]);
        let ay = axis_weights(index.y, dims[1]);
        let az = axis_weights(index.z, dims[2]);

        values[..nv].iter_mut().for_each(|v| *v = 0.0);
        gradients[..nv].iter_mut().for_each(|g| *g = Vector3::zeros());

        let xs = [(ax.i0, 1.0 - ax.t, -1.0), (ax.i1, ax.t, 1.0)];
        let ys = [(ay.i0, 1.0 - ay.t, -1.0), (ay.i1, ay.t, 1.0)];
        let zs = [(az.i0, 1.0 - az.t, -1.0), (az.i1, az.t, 1.0)];
        let data = image.data();

        for &(z, wz, dz) in &zs {
            for &(y, wy, dy) in &ys {
                for &(x, wx, dx) in &xs {
                    let w = wx * wy * wz;
                    let gw = Vector3::new(dx * wy * wz, wx * dy * wz, wx * wy * dz);
                    let base = header.linear_index(x, y, z) * nv;
                    for v in 0..nv {
                        let val = data[base + v] as f64;
                        values[v] += w * val;
                        gradients[v] += gw * val;
                    }
                }
            }
        }
        // Clamped axes contribute identical samples at both ends, so the
        // finite difference above is already zero there.
        true
    }
}

impl Interpolator for LinearInterpolator {
    fn sample(&self, image: &Image, index: &Vector3<f64>, out: &mut [f64]) -> bool {
        let header = image.header();
        let dims = header.dims();
        if !in_bounds(dims, index) {
            return false;
        }
        let nv = image.nvols();
        let ax = axis_weights(index.x, dims[0]);
        let ay = axis_weights(index.y, dims[1]);
        let az = axis_weights(index.z, dims[2]);
        out[..nv].iter_mut().for_each(|v| *v = 0.0);

        let data = image.data();
        for &(z, wz) in &[(az.i0, 1.0 - az.t), (az.i1, az.t)] {
            for &(y, wy) in &[(ay.i0, 1.0 - ay.t), (ay.i1, ay.t)] {
                for &(x, wx) in &[(ax.i0, 1.0 - ax.t), (ax.i1, ax.t)] {
                    let w = wx * wy * wz;
                    if w == 0.0 {
                        continue;
                    }
                    let base = header.linear_index(x, y, z) * nv;
                    for v in 0..nv {
                        out[v] += w * data[base + v] as f64;
                    }
                }
            }
        }
        true
    }
}

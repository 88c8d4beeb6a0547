//! Fixed-point inversion of displacement fields.

use mireg_core::image::Image;
use mireg_core::interpolation::ImageSampler;
use nalgebra::Vector3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::sample_vector;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InversionConfig {
    pub max_iterations: usize,
    /// Per-voxel stopping tolerance, in voxels.
    pub tolerance: f64,
}

impl Default for InversionConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-4,
        }
    }
}

/// Inverse of `id + displacement` on the same grid.
///
/// Solves `v(y) = -d(y + v(y))` independently at every voxel by fixed-point
/// iteration, starting from `initial` when given (e.g. the previous inverse)
/// and from `-d(y)` otherwise.
pub fn invert_displacement(displacement: &Image, initial: Option<&Image>, config: &InversionConfig) -> Image {
    let header = displacement.header().clone();
    let tolerance = config.tolerance * header.spacing().min_spacing();
    let sampler = ImageSampler::new(displacement);
    let mut out = match initial {
        Some(init) => init.clone(),
        None => {
            let mut f = displacement.clone();
            f.data_mut().par_iter_mut().for_each(|v| *v = -*v);
            f
        }
    };

    out.data_mut()
        .par_chunks_mut(3)
        .enumerate()
        .for_each(|(i, v)| {
            let [x, y, z] = header.coords(i);
            let p = header.voxel_position(x, y, z);
            let mut inv = Vector3::new(v[0] as f64, v[1] as f64, v[2] as f64);
            for _ in 0..config.max_iterations {
                let next = -sample_vector(&sampler, &(p + inv));
                let change = (next - inv).norm();
                inv = next;
                if change < tolerance {
                    break;
                }
            }
            v.copy_from_slice(&[inv.x as f32, inv.y as f32, inv.z as f32]);
        });
    out
}

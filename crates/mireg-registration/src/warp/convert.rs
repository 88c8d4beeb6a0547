//! Conversion between displacement and deformation representations.

use mireg_core::image::Image;
use rayon::prelude::*;

fn shift_by_position(field: &Image, sign: f64) -> Image {
    let mut out = field.clone();
    let header = field.header().clone();
    out.data_mut()
        .par_chunks_mut(3)
        .enumerate()
        .for_each(|(i, v)| {
            let [x, y, z] = header.coords(i);
            let p = header.voxel_position(x, y, z);
            for a in 0..3 {
                v[a] = (v[a] as f64 + sign * p[a]) as f32;
            }
        });
    out
}

/// `p + d(p)` at every voxel.
pub fn displacement2deformation(displacement: &Image) -> Image {
    shift_by_position(displacement, 1.0)
}

/// `φ(p) - p` at every voxel.
pub fn deformation2displacement(deformation: &Image) -> Image {
    shift_by_position(deformation, -1.0)
}

//! Composition of linear transforms and displacement fields.

use mireg_core::image::Image;
use mireg_core::interpolation::ImageSampler;
use mireg_core::transform::Transform;
use rayon::prelude::*;

use super::sample_vector;

/// Deformation `m ↦ L(m + d(m))` on the grid of `displacement`.
pub fn compose_linear_displacement(linear: &Transform, displacement: &Image) -> Image {
    let mut out = displacement.clone();
    let header = displacement.header().clone();
    out.data_mut()
        .par_chunks_mut(3)
        .enumerate()
        .for_each(|(i, v)| {
            let [x, y, z] = header.coords(i);
            let p = header.voxel_position(x, y, z);
            let d = nalgebra::Vector3::new(v[0] as f64, v[1] as f64, v[2] as f64);
            let q = linear.apply(&(p + d));
            v.copy_from_slice(&[q.x as f32, q.y as f32, q.z as f32]);
        });
    out
}

/// Deformation `m ↦ L(φ(m))`.
pub fn compose_linear_deformation(linear: &Transform, deformation: &Image) -> Image {
    let mut out = deformation.clone();
    out.data_mut().par_chunks_mut(3).for_each(|v| {
        let p = nalgebra::Vector3::new(v[0] as f64, v[1] as f64, v[2] as f64);
        let q = linear.apply(&p);
        v.copy_from_slice(&[q.x as f32, q.y as f32, q.z as f32]);
    });
    out
}

/// Displacement of the map `p ↦ φ₂(φ₁(p))` where `φ₁ = id + first` and
/// `φ₂ = id + second`: `first(p) + second(p + first(p))`.
///
/// The result lives on the grid of `first`; `second` is interpolated.
pub fn compose_displacements(first: &Image, second: &Image) -> Image {
    let mut out = first.clone();
    let header = first.header().clone();
    let sampler = ImageSampler::new(second);
    out.data_mut()
        .par_chunks_mut(3)
        .enumerate()
        .for_each(|(i, v)| {
            let [x, y, z] = header.coords(i);
            let p = header.voxel_position(x, y, z);
            let d = nalgebra::Vector3::new(v[0] as f64, v[1] as f64, v[2] as f64);
            let total = d + sample_vector(&sampler, &(p + d));
            v.copy_from_slice(&[total.x as f32, total.y as f32, total.z as f32]);
        });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warp::zero_field;
    use mireg_core::image::Header;
    use mireg_core::transform::TransformKind;
    use nalgebra::Vector3;

    fn constant(header: &Header, v: Vector3<f64>) -> Image {
        let mut f = zero_field(header);
        for i in 0..header.nvoxels() {
            f.set_vector(i, &v);
        }
        f
    }

    #[test]
    fn test_linear_displacement_composition() {
        let header = Header::unit([4, 4, 4]);
        let d = constant(&header, Vector3::new(1.0, 0.0, 0.0));
        let mut t = Transform::identity(TransformKind::Rigid);
        t.set_translation(Vector3::new(0.0, 2.0, 0.0));
        let def = compose_linear_displacement(&t, &d);
        let i = header.linear_index(1, 1, 1);
        assert!((def.vector(i) - Vector3::new(2.0, 3.0, 1.0)).norm() < 1e-6);

        let def2 = compose_linear_deformation(&t, &def);
        assert!((def2.vector(i) - Vector3::new(2.0, 5.0, 1.0)).norm() < 1e-6);
    }

    #[test]
    fn test_constant_displacements_add() {
        let header = Header::unit([6, 6, 6]);
        let a = constant(&header, Vector3::new(1.0, 0.0, 0.0));
        let b = constant(&header, Vector3::new(0.0, -1.0, 0.5));
        let c = compose_displacements(&a, &b);
        let i = header.linear_index(2, 3, 2);
        assert!((c.vector(i) - Vector3::new(1.0, -1.0, 0.5)).norm() < 1e-6);
    }

    #[test]
    fn test_outside_second_field_contributes_nothing() {
        let header = Header::unit([4, 4, 4]);
        let a = constant(&header, Vector3::new(10.0, 0.0, 0.0));
        let b = constant(&header, Vector3::new(0.0, 1.0, 0.0));
        let c = compose_displacements(&a, &b);
        assert!((c.vector(0) - Vector3::new(10.0, 0.0, 0.0)).norm() < 1e-6);
    }
}

use mireg_core::image::Header;
use mireg_core::spatial::{Direction3, Point3, Spacing3};
use mireg_core::transform::matrix::euler_to_matrix;
use mireg_core::transform::{Transform, TransformKind};
use nalgebra::Vector3;
use proptest::prelude::*;

fn assert_close(a: &Vector3<f64>, b: &Vector3<f64>, tol: f64) -> Result<(), TestCaseError> {
    prop_assert!((a - b).norm() < tol, "{:?} vs {:?}", a, b);
    Ok(())
}

proptest! {
    #[test]
    fn test_rigid_half_consistency(
        tx in -20.0f64..20.0, ty in -20.0f64..20.0, tz in -20.0f64..20.0,
        ax in -3.0f64..3.0, ay in -1.4f64..1.4, az in -3.0f64..3.0,
        cx in -50.0f64..50.0, cy in -50.0f64..50.0, cz in -50.0f64..50.0,
        px in -50.0f64..50.0, py in -50.0f64..50.0, pz in -50.0f64..50.0
    ) {
        let mut t = Transform::identity(TransformKind::Rigid);
        t.set_centre(Vector3::new(cx, cy, cz));
        t.set_parameters(&[tx, ty, tz, ax, ay, az]);

        let half = t.half().unwrap();
        let half_inv = t.half_inverse().unwrap();
        let p = Vector3::new(px, py, pz);

        assert_close(&half.apply(&half.apply(&p)), &t.apply(&p), 1e-8)?;
        assert_close(&half_inv.apply(&half.apply(&p)), &p, 1e-8)?;
        assert_close(&half.apply(&half_inv.apply(&p)), &p, 1e-8)?;
    }

    #[test]
    fn test_affine_half_consistency(
        m in proptest::collection::vec(-0.3f64..0.3, 9),
        tx in -10.0f64..10.0, ty in -10.0f64..10.0, tz in -10.0f64..10.0,
        px in -30.0f64..30.0, py in -30.0f64..30.0, pz in -30.0f64..30.0
    ) {
        let mut t = Transform::identity(TransformKind::Affine);
        t.set_centre(Vector3::new(3.0, -7.0, 11.0));
        let mut params = t.parameters();
        for i in 0..3 {
            for j in 0..3 {
                params[i * 4 + j] += m[i * 3 + j];
            }
        }
        params[3] = tx;
        params[7] = ty;
        params[11] = tz;
        t.set_parameters(&params);

        let half = t.half().unwrap();
        let half_inv = t.half_inverse().unwrap();
        let p = Vector3::new(px, py, pz);

        assert_close(&half.apply(&half.apply(&p)), &t.apply(&p), 1e-7)?;
        assert_close(&half_inv.apply(&half.apply(&p)), &p, 1e-7)?;
    }

    #[test]
    fn test_header_coordinate_roundtrip(
        ox in -100.0f64..100.0, oy in -100.0f64..100.0, oz in -100.0f64..100.0,
        sx in 0.1f64..5.0, sy in 0.1f64..5.0, sz in 0.1f64..5.0,
        ax in -3.14f64..3.14, ay in -1.5f64..1.5, az in -3.14f64..3.14,
        ix in -5.0f64..40.0, iy in -5.0f64..40.0, iz in -5.0f64..40.0
    ) {
        let header = Header::new(
            [32, 32, 32],
            Point3::new([ox, oy, oz]),
            Spacing3::new([sx, sy, sz]),
            Direction3::new(euler_to_matrix(&[ax, ay, az])),
        );
        let index = Vector3::new(ix, iy, iz);
        let p = header.index_to_scanner(&index);
        let back = (header.scanner_to_voxel().unwrap() * p.push(1.0)).xyz();
        assert_close(&back, &index, 1e-6)?;
    }
}

#[test]
fn test_half_of_rotation_about_centre() {
    // 90° about z through (10, 10, 10) halves to 45° about the same axis
    let mut t = Transform::identity(TransformKind::Rigid);
    t.set_centre(Vector3::new(10.0, 10.0, 10.0));
    t.set_parameters(&[0.0, 0.0, 0.0, 0.0, 0.0, std::f64::consts::FRAC_PI_2]);

    let half = t.half().unwrap();
    let angles = half.parameters();
    assert!((angles[5] - std::f64::consts::FRAC_PI_4).abs() < 1e-10);
    assert!((half.apply(&Vector3::new(10.0, 10.0, 10.0)) - Vector3::new(10.0, 10.0, 10.0)).norm() < 1e-10);
}

#[test]
fn test_affine_file_like_roundtrip_through_matrix4() {
    let mut t = Transform::identity(TransformKind::Affine);
    t.set_parameters(&[1.0, 0.1, 0.0, 2.0, 0.0, 0.9, 0.0, -1.0, 0.0, 0.0, 1.2, 0.5]);
    t.set_centre(Vector3::new(4.0, 5.0, 6.0));

    let rebuilt = Transform::from_matrix4(TransformKind::Affine, &t.to_matrix4(), *t.centre());
    let p = Vector3::new(-3.0, 2.0, 9.0);
    assert!((rebuilt.apply(&p) - t.apply(&p)).norm() < 1e-12);
    assert_eq!(rebuilt.centre(), t.centre());
}

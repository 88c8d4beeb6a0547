use mireg_core::transform::matrix::euler_to_matrix;
use mireg_core::transform::{Transform, TransformKind};
use mireg_io::{load_transform, save_transform};
use nalgebra::Vector3;

#[test]
fn test_save_load_keeps_mapping_and_centre() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rigid.txt");

    let mut transform = Transform::identity(TransformKind::Rigid);
    transform.set_centre(Vector3::new(12.5, -3.0, 40.0));
    transform.set_matrix(euler_to_matrix(&[0.1, -0.2, 0.3]));
    transform.set_translation(Vector3::new(1.0, 2.0, -4.0));
    save_transform(&transform, &path).unwrap();

    let loaded = load_transform(&path, TransformKind::Rigid).unwrap();
    assert_eq!(loaded.kind(), TransformKind::Rigid);
    assert!((loaded.centre() - transform.centre()).norm() < 1e-12);
    for p in [Vector3::zeros(), Vector3::new(10.0, -5.0, 2.0)] {
        assert!((loaded.apply(&p) - transform.apply(&p)).norm() < 1e-9);
    }
}

#[test]
fn test_missing_file_reports_context() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_transform(dir.path().join("absent.txt"), TransformKind::Affine).unwrap_err();
    assert!(err.to_string().contains("Failed to read transform file"));
}

#[test]
fn test_affine_loaded_as_rigid_is_projected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("affine.txt");
    std::fs::write(&path, "1.1 0 0 0\n0 0.9 0 0\n0 0 1 0\n").unwrap();
    let loaded = load_transform(&path, TransformKind::Rigid).unwrap();
    assert!(mireg_core::transform::matrix::is_rotation(loaded.matrix()));
}

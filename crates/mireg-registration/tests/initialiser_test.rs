mod common_images;

use burn_ndarray::NdArray;
use common_images::blobs;
use mireg_core::image::{Header, Image};
use mireg_core::transform::{Transform, TransformKind};
use mireg_registration::initialiser::{
    CentreOfMass, Moments, RotationSearch, RotationSearchConfig, SearchMode,
};
use mireg_registration::{Initialiser, InitialiserInput};
use nalgebra::{Matrix3, Rotation3, Vector3};

type B = NdArray<f32>;

const LAYOUT: [([f64; 3], f64, f64); 3] = [
    ([10.0, 10.0, 10.0], 3.0, 100.0),
    ([14.0, 10.0, 11.0], 1.5, 60.0),
    ([10.0, 6.0, 13.0], 1.5, 30.0),
];

/// Image of `LAYOUT` moved by `x -> r (x - g) + g` about the grid centre `g`.
fn rotated(header: &Header, r: &Matrix3<f64>) -> Image {
    let g = header.centre();
    let moved: Vec<_> = LAYOUT
        .iter()
        .map(|(c, s, a)| {
            let p = r * (Vector3::new(c[0], c[1], c[2]) - g) + g;
            ([p.x, p.y, p.z], *s, *a)
        })
        .collect();
    blobs(header, &moved)
}

fn angle_between(a: &Matrix3<f64>, b: &Matrix3<f64>) -> f64 {
    let cos = (((a.transpose() * b).trace() - 1.0) * 0.5).clamp(-1.0, 1.0);
    cos.acos().to_degrees()
}

#[test]
fn test_local_search_finds_quarter_turn() {
    let header = Header::unit([21, 21, 21]);
    let truth = *Rotation3::from_axis_angle(&Vector3::z_axis(), std::f64::consts::FRAC_PI_2).matrix();
    let image1 = blobs(&header, &LAYOUT);
    let image2 = rotated(&header, &truth);

    let input = InitialiserInput::new(&image1, &image2, &[]);
    let mut transform = Transform::identity(TransformKind::Affine);
    CentreOfMass.initialise(&input, &mut transform).unwrap();
    let search = RotationSearch::<B>::new(RotationSearchConfig::default().with_scale(0.5), Default::default());
    let result = search.run(&input, &mut transform).unwrap();

    assert!(result.best_index > 0);
    let error = angle_between(transform.matrix(), &truth);
    assert!(error < 2.0, "rotation error {} degrees", error);
}

#[test]
fn test_global_search_finds_oblique_rotation() {
    let header = Header::unit([21, 21, 21]);
    let truth = *Rotation3::from_euler_angles(0.9, -0.6, 1.2).matrix();
    let image1 = blobs(&header, &LAYOUT);
    let image2 = rotated(&header, &truth);

    let input = InitialiserInput::new(&image1, &image2, &[]);
    let mut transform = Transform::identity(TransformKind::Affine);
    CentreOfMass.initialise(&input, &mut transform).unwrap();
    let start_error = angle_between(transform.matrix(), &truth);

    let mut config = RotationSearchConfig::default()
        .with_mode(SearchMode::Global)
        .with_scale(0.5)
        .with_global_iterations(10_000, 7);
    config.translation_extent = 0.0;
    let result = RotationSearch::<B>::new(config, Default::default())
        .run(&input, &mut transform)
        .unwrap();

    assert_eq!(result.candidates, 10_001);
    assert!(result.best_index > 0);
    let error = angle_between(transform.matrix(), &truth);
    assert!(error < 20.0, "rotation error {} degrees, started at {}", error, start_error);
}

#[test]
fn test_moments_idempotent() {
    let header = Header::unit([21, 21, 21]);
    let truth = *Rotation3::from_euler_angles(0.3, -0.2, 0.5).matrix();
    let image1 = blobs(&header, &LAYOUT);
    let image2 = rotated(&header, &truth);
    let input = InitialiserInput::new(&image1, &image2, &[]);

    let mut first = Transform::identity(TransformKind::Affine);
    Moments.initialise(&input, &mut first).unwrap();
    let mut second = Transform::identity(TransformKind::Affine);
    Moments.initialise(&input, &mut second).unwrap();

    assert_eq!(first.to_matrix4(), second.to_matrix4());
    assert_eq!(first.centre(), second.centre());
}

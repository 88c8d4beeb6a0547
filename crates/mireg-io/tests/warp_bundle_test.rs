use burn_ndarray::NdArray;
use mireg_core::image::{Header, Image};
use mireg_core::transform::{Transform, TransformKind};
use mireg_io::{full_deformations, pack_warp_bundle, unpack_warp_bundle};
use mireg_registration::{NonLinearConfig, NonLinearInit, NonLinearRegistration, PipelineConfig, PipelineInit, RegistrationPipeline, RegistrationType};
use nalgebra::Vector3;

type B = NdArray<f32>;

fn blob(header: &Header, centre: Vector3<f64>) -> Image {
    Image::from_fn(header.clone(), move |p| (100.0 * (-(p - centre).norm_squared() / 12.5).exp()) as f32)
}

#[test]
fn test_bundle_resumes_registration() {
    let header = Header::unit([12, 12, 12]);
    let image1 = blob(&header, Vector3::new(5.5, 5.5, 5.5));
    let image2 = blob(&header, Vector3::new(6.0, 5.5, 5.0));
    let mut start = Transform::identity(TransformKind::Affine);
    start.set_centre_without_transform_update(header.centre());

    let config = NonLinearConfig::default()
        .with_scale_factors(vec![0.5, 1.0])
        .with_max_iterations(vec![5]);
    let first = NonLinearRegistration::<B>::new(config.clone(), Default::default())
        .run(&image1, &image2, None, None, &[], &NonLinearInit::Linear(start))
        .unwrap();

    let bundle = pack_warp_bundle(&first.warps).unwrap();
    let warps = unpack_warp_bundle(&bundle).unwrap();
    let (forward, backward) = full_deformations(&warps, &header, &header).unwrap();
    assert_eq!(forward.nvols(), 3);
    assert!(forward.vector(header.linear_index(6, 6, 6)).iter().all(|v| v.is_finite()));
    assert!(backward.header().same_grid(&header));

    let pipeline = PipelineConfig::new(RegistrationType::NonLinear)
        .with_init(PipelineInit::Warp(warps))
        .with_nonlinear(config);
    let resumed = RegistrationPipeline::<B>::new(pipeline, Default::default())
        .run(&image1, &image2, None, None, &[])
        .unwrap();
    assert_eq!(resumed.nonlinear.unwrap().levels.len(), 1);
}

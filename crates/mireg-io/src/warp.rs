//! Five-dimensional warp bundles.
//!
//! The four midway deformation fields are packed on a trailing axis of size
//! four, in the order im1→mid, mid→im1, im2→mid, mid→im2. Voxel `i`, field
//! `f` and component `c` live at `i * 12 + f * 3 + c`. The two linear half
//! transforms are stored as header key/values.

use anyhow::{anyhow, bail, Context, Result};
use mireg_core::image::{Header, Image};
use mireg_core::transform::{Transform, TransformKind};
use mireg_registration::WarpFields;
use nalgebra::Matrix4;

/// Value of the `nl_warp_type` key.
pub const WARP_TYPE: &str = "symmetric_deformation";

const KEY_TYPE: &str = "nl_warp_type";
const KEY_LINEAR1: &str = "linear1";
const KEY_LINEAR2: &str = "linear2";
const FIELDS: usize = 4;

/// Pack the fields of a warp into one image with volume shape `[3, 4]`.
pub fn pack_warp_bundle(warps: &WarpFields) -> Result<Image> {
    let fields = [&warps.im1_to_mid, &warps.mid_to_im1, &warps.im2_to_mid, &warps.mid_to_im2];
    let midway = warps.midway();
    for (f, field) in fields.iter().enumerate() {
        if field.nvols() != 3 || !field.header().same_grid(midway) {
            bail!("warp field {} is not a 3-vector field on the midway grid", f);
        }
    }

    let mut header = midway.clone().with_vol_shape(vec![3, FIELDS]);
    let keyval = header.keyval_mut();
    keyval.insert(KEY_TYPE.to_string(), WARP_TYPE.to_string());
    keyval.insert(KEY_LINEAR1.to_string(), format_matrix(&warps.linear1));
    keyval.insert(KEY_LINEAR2.to_string(), format_matrix(&warps.linear2));

    let mut bundle = Image::zeros(header);
    for i in 0..midway.nvoxels() {
        let voxel = bundle.voxel_mut(i);
        for (f, field) in fields.iter().enumerate() {
            voxel[f * 3..f * 3 + 3].copy_from_slice(field.voxel(i));
        }
    }
    Ok(bundle)
}

/// Recover the fields and half transforms from a bundle.
pub fn unpack_warp_bundle(bundle: &Image) -> Result<WarpFields> {
    let header = bundle.header();
    if header.vol_shape() != [3, FIELDS] {
        bail!("warp bundle must have volume shape [3, 4], found {:?}", header.vol_shape());
    }
    match header.keyval().get(KEY_TYPE) {
        Some(t) if t == WARP_TYPE => {}
        Some(t) => bail!("unsupported warp type {:?}", t),
        None => bail!("warp bundle has no {} entry", KEY_TYPE),
    }
    let centre = header.centre();
    let linear1 = parse_matrix(header, KEY_LINEAR1)?;
    let linear2 = parse_matrix(header, KEY_LINEAR2)?;

    let mut field_header = header.clone().with_volumes(3);
    field_header.keyval_mut().clear();
    let mut fields: Vec<Image> = (0..FIELDS).map(|_| Image::zeros(field_header.clone())).collect();
    for i in 0..header.nvoxels() {
        let voxel = bundle.voxel(i);
        for (f, field) in fields.iter_mut().enumerate() {
            field.voxel_mut(i).copy_from_slice(&voxel[f * 3..f * 3 + 3]);
        }
    }
    let mut fields = fields.into_iter();
    let mut next = || fields.next().ok_or_else(|| anyhow!("missing warp field"));
    Ok(WarpFields {
        im1_to_mid: next()?,
        mid_to_im1: next()?,
        im2_to_mid: next()?,
        mid_to_im2: next()?,
        linear1: Transform::from_matrix4(TransformKind::Affine, &linear1, centre),
        linear2: Transform::from_matrix4(TransformKind::Affine, &linear2, centre),
    })
}

/// Full deformations on each input grid: image1 voxels to image2 positions,
/// and image2 voxels to image1 positions.
pub fn full_deformations(warps: &WarpFields, header1: &Header, header2: &Header) -> Result<(Image, Image)> {
    let forward = warps
        .image1_to_image2(header1)
        .ok_or_else(|| anyhow!("image2 half transform is singular"))?;
    let backward = warps
        .image2_to_image1(header2)
        .ok_or_else(|| anyhow!("image1 half transform is singular"))?;
    Ok((forward, backward))
}

fn format_matrix(transform: &Transform) -> String {
    let m = transform.to_matrix4();
    (0..3)
        .flat_map(|r| (0..4).map(move |c| (r, c)))
        .map(|(r, c)| m[(r, c)].to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_matrix(header: &Header, key: &str) -> Result<Matrix4<f64>> {
    let text = header
        .keyval()
        .get(key)
        .ok_or_else(|| anyhow!("warp bundle has no {} entry", key))?;
    let values = text
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("{} is not a list of numbers", key))?;
    if values.len() != 12 {
        bail!("{} must hold 12 values, found {}", key, values.len());
    }
    let mut m = Matrix4::identity();
    for (k, v) in values.iter().enumerate() {
        m[(k / 4, k % 4)] = *v;
    }
    Ok(m)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mireg_registration::warp::{displacement2deformation, zero_field};
    use nalgebra::Vector3;

    fn sample_warps() -> WarpFields {
        let header = Header::unit([3, 2, 2]);
        let mut fields: Vec<Image> = (0..4).map(|_| zero_field(&header)).collect();
        for (f, field) in fields.iter_mut().enumerate() {
            for i in 0..header.nvoxels() {
                field.set_vector(i, &Vector3::new(f as f64, i as f64 * 0.25, -0.5));
            }
        }
        let mut fields = fields.into_iter().map(|d| displacement2deformation(&d));
        let mut linear1 = Transform::identity(TransformKind::Affine);
        linear1.set_translation(Vector3::new(0.5, -1.0, 2.0));
        WarpFields {
            im1_to_mid: fields.next().unwrap(),
            mid_to_im1: fields.next().unwrap(),
            im2_to_mid: fields.next().unwrap(),
            mid_to_im2: fields.next().unwrap(),
            linear2: linear1.inverse().unwrap(),
            linear1,
        }
    }

    #[test]
    fn test_bundle_layout() {
        let warps = sample_warps();
        let bundle = pack_warp_bundle(&warps).unwrap();
        assert_eq!(bundle.header().vol_shape(), &[3, 4]);
        assert_eq!(bundle.header().ndim(), 5);
        // voxel 5, field 2 (im2_to_mid), component 1
        assert_eq!(bundle.data()[5 * 12 + 2 * 3 + 1], warps.im2_to_mid.voxel(5)[1]);
        assert_eq!(bundle.header().keyval()["nl_warp_type"], WARP_TYPE);
        assert_eq!(bundle.header().keyval()["linear1"].split(',').count(), 12);
    }

    #[test]
    fn test_unpack_restores_fields_and_mapping() {
        let warps = sample_warps();
        let restored = unpack_warp_bundle(&pack_warp_bundle(&warps).unwrap()).unwrap();
        assert_eq!(restored.mid_to_im2.data(), warps.mid_to_im2.data());
        assert_eq!(restored.im1_to_mid.data(), warps.im1_to_mid.data());
        let p = Vector3::new(1.0, 2.0, 3.0);
        assert!((restored.linear1.apply(&p) - warps.linear1.apply(&p)).norm() < 1e-12);
        assert!((restored.linear2.apply(&p) - warps.linear2.apply(&p)).norm() < 1e-12);
    }

    #[test]
    fn test_unpack_rejects_wrong_shape_and_type() {
        let plain = Image::zeros(Header::unit([2, 2, 2]).with_volumes(12));
        assert!(unpack_warp_bundle(&plain).is_err());

        let mut bundle = pack_warp_bundle(&sample_warps()).unwrap();
        bundle
            .header_mut()
            .keyval_mut()
            .insert("nl_warp_type".to_string(), "other".to_string());
        assert!(unpack_warp_bundle(&bundle).is_err());
    }
}

//! Plain-text affine transform files.
//!
//! Three or four rows of four whitespace-separated numbers hold the
//! homogeneous matrix. A `# centre: x y z` comment records the centre of
//! rotation; other `#` lines are ignored.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use mireg_core::transform::matrix::is_rotation;
use mireg_core::transform::{Transform, TransformKind};
use nalgebra::{Matrix4, Vector3};

const CENTRE_TAG: &str = "centre:";

/// Render a transform in the text format.
pub fn format_transform(transform: &Transform) -> String {
    let m = transform.to_matrix4();
    let c = transform.centre();
    let mut out = format!("# {} {} {} {}\n", CENTRE_TAG, c.x, c.y, c.z);
    for r in 0..4 {
        out.push_str(&format!("{} {} {} {}\n", m[(r, 0)], m[(r, 1)], m[(r, 2)], m[(r, 3)]));
    }
    out
}

/// Parse the text format into a transform of the given kind.
///
/// Without a centre line the centre is the origin. A rigid kind projects a
/// non-orthonormal matrix onto the nearest rotation.
pub fn parse_transform(text: &str, kind: TransformKind) -> Result<Transform> {
    let mut rows: Vec<[f64; 4]> = Vec::with_capacity(4);
    let mut centre = Vector3::zeros();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix('#') {
            if let Some(values) = comment.trim().strip_prefix(CENTRE_TAG) {
                let c = parse_numbers(values).with_context(|| format!("line {}: bad centre", n + 1))?;
                if c.len() != 3 {
                    bail!("line {}: centre needs 3 values, found {}", n + 1, c.len());
                }
                centre = Vector3::new(c[0], c[1], c[2]);
            }
            continue;
        }
        let values = parse_numbers(line).with_context(|| format!("line {}", n + 1))?;
        if values.len() != 4 {
            bail!("line {}: expected 4 values per row, found {}", n + 1, values.len());
        }
        rows.push([values[0], values[1], values[2], values[3]]);
    }
    if rows.len() != 3 && rows.len() != 4 {
        bail!("expected 3 or 4 matrix rows, found {}", rows.len());
    }
    if rows.len() == 4 && rows[3] != [0.0, 0.0, 0.0, 1.0] {
        bail!("last row of a homogeneous matrix must be 0 0 0 1");
    }

    let mut m = Matrix4::identity();
    for (r, row) in rows.iter().take(3).enumerate() {
        for (c, v) in row.iter().enumerate() {
            m[(r, c)] = *v;
        }
    }
    if m.fixed_view::<3, 3>(0, 0).clone_owned().determinant().abs() < 1e-12 {
        bail!("transform matrix is singular");
    }
    let transform = Transform::from_matrix4(TransformKind::Affine, &m, centre);
    if kind == TransformKind::Rigid && !is_rotation(transform.matrix()) {
        tracing::warn!("rigid transform file holds a non-rotation matrix; projecting onto nearest rotation");
    }
    Ok(transform.with_kind(kind))
}

pub fn save_transform<P: AsRef<Path>>(transform: &Transform, path: P) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, format_transform(transform)).context("Failed to write transform file")?;
    tracing::debug!(path = %path.display(), "wrote transform");
    Ok(())
}

pub fn load_transform<P: AsRef<Path>>(path: P, kind: TransformKind) -> Result<Transform> {
    let text = fs::read_to_string(path.as_ref()).context("Failed to read transform file")?;
    parse_transform(&text, kind).context("Invalid transform file")
}

fn parse_numbers(text: &str) -> Result<Vec<f64>> {
    text.split_whitespace()
        .map(|t| t.parse::<f64>().with_context(|| format!("not a number: {:?}", t)))
        .collect()
}

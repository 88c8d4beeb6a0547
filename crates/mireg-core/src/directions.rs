//! Near-uniform direction sets on the unit sphere.

use nalgebra::Vector3;

/// `n` unit vectors on a golden-angle spiral.
///
/// Heights run linearly from `+1` to `-1` inclusive, so both poles are part
/// of the set whenever `n >= 2`.
pub fn golden_spiral(n: usize) -> Vec<Vector3<f64>> {
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![Vector3::z()];
    }
    let golden_angle = std::f64::consts::PI * (3.0 - 5f64.sqrt());
    (0..n)
        .map(|i| {
            let z = 1.0 - 2.0 * i as f64 / (n - 1) as f64;
            let r = (1.0 - z * z).max(0.0).sqrt();
            let phi = golden_angle * i as f64;
            Vector3::new(r * phi.cos(), r * phi.sin(), z)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spiral_is_unit_and_includes_poles() {
        let dirs = golden_spiral(250);
        assert_eq!(dirs.len(), 250);
        for d in &dirs {
            assert!((d.norm() - 1.0).abs() < 1e-12);
        }
        assert!((dirs[0] - Vector3::z()).norm() < 1e-12);
        assert!((dirs[249] + Vector3::z()).norm() < 1e-12);
    }

    #[test]
    fn test_spiral_is_roughly_balanced() {
        let dirs = golden_spiral(300);
        let mean: Vector3<f64> = dirs.iter().sum::<Vector3<f64>>() / 300.0;
        assert!(mean.norm() < 0.02);
    }
}

//! Small 3×3 matrix utilities: square root, polar rotation and Euler angles.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion};

/// Principal square root of a 3×3 matrix, `S` with `S * S = m`.
///
/// Proper rotations are handled through the quaternion half angle, which also
/// covers 180° turns where the real principal root is not unique. Other
/// matrices use the Denman–Beavers iteration. Returns `None` if an iterate
/// becomes singular or the iteration does not converge.
pub fn sqrtm(m: &Matrix3<f64>) -> Option<Matrix3<f64>> {
    if is_rotation(m) {
        let q = UnitQuaternion::from_matrix(m);
        return Some(*q.powf(0.5).to_rotation_matrix().matrix());
    }

    let mut y = *m;
    let mut z = Matrix3::identity();
    for _ in 0..100 {
        let y_inv = y.try_inverse()?;
        let z_inv = z.try_inverse()?;
        let y_next = (y + z_inv) * 0.5;
        let z_next = (z + y_inv) * 0.5;
        let delta = (y_next - y).abs().max();
        y = y_next;
        z = z_next;
        if delta < 1e-14 * (1.0 + y.abs().max()) {
            return y.iter().all(|v| v.is_finite()).then_some(y);
        }
    }
    None
}

/// True if `m` is orthonormal with determinant +1 (to 1e-9).
pub fn is_rotation(m: &Matrix3<f64>) -> bool {
    ((m.transpose() * m) - Matrix3::identity()).abs().max() < 1e-9 && (m.determinant() - 1.0).abs() < 1e-9
}

/// Closest proper rotation to `m` (orthogonal polar factor).
///
/// Falls back to the identity when `m` is rank deficient.
pub fn polar_rotation(m: &Matrix3<f64>) -> Matrix3<f64> {
    let svd = m.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Matrix3::identity();
    };
    if svd.singular_values.min() < 1e-12 {
        return Matrix3::identity();
    }
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u = u;
        u.column_mut(2).neg_mut();
        r = u * v_t;
    }
    r
}

/// Rotation `Rz(angles[2]) * Ry(angles[1]) * Rx(angles[0])`.
pub fn euler_to_matrix(angles: &[f64; 3]) -> Matrix3<f64> {
    *Rotation3::from_euler_angles(angles[0], angles[1], angles[2]).matrix()
}

/// Inverse of [`euler_to_matrix`] for the branch `|angles[1]| <= π/2`.
pub fn matrix_to_euler(r: &Matrix3<f64>) -> [f64; 3] {
    let beta = (-r[(2, 0)]).clamp(-1.0, 1.0).asin();
    let alpha = r[(2, 1)].atan2(r[(2, 2)]);
    let gamma = r[(1, 0)].atan2(r[(0, 0)]);
    [alpha, beta, gamma]
}

/// Partial derivatives of [`euler_to_matrix`] with respect to each angle.
pub fn euler_derivatives(angles: &[f64; 3]) -> [Matrix3<f64>; 3] {
    let (sa, ca) = angles[0].sin_cos();
    let (sb, cb) = angles[1].sin_cos();
    let (sg, cg) = angles[2].sin_cos();

    let rx = Matrix3::new(1.0, 0.0, 0.0, 0.0, ca, -sa, 0.0, sa, ca);
    let ry = Matrix3::new(cb, 0.0, sb, 0.0, 1.0, 0.0, -sb, 0.0, cb);
    let rz = Matrix3::new(cg, -sg, 0.0, sg, cg, 0.0, 0.0, 0.0, 1.0);

    let drx = Matrix3::new(0.0, 0.0, 0.0, 0.0, -sa, -ca, 0.0, ca, -sa);
    let dry = Matrix3::new(-sb, 0.0, cb, 0.0, 0.0, 0.0, -cb, 0.0, -sb);
    let drz = Matrix3::new(-sg, -cg, 0.0, cg, -sg, 0.0, 0.0, 0.0, 0.0);

    [rz * ry * drx, rz * dry * rx, drz * ry * rx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqrtm_general_matrix() {
        let m = Matrix3::new(2.0, 0.3, 0.0, 0.1, 1.5, 0.2, 0.0, -0.1, 1.2);
        let s = sqrtm(&m).unwrap();
        assert!((s * s - m).abs().max() < 1e-10);
    }

    #[test]
    fn test_sqrtm_half_turn() {
        let r = euler_to_matrix(&[0.0, 0.0, std::f64::consts::PI]);
        let s = sqrtm(&r).unwrap();
        assert!((s * s - r).abs().max() < 1e-10);
        assert!(is_rotation(&s));
    }

    #[test]
    fn test_sqrtm_singular_fails() {
        let m = Matrix3::new(1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        assert!(sqrtm(&m).is_none());
    }

    #[test]
    fn test_euler_roundtrip() {
        let angles = [0.3, -0.4, 1.1];
        let back = matrix_to_euler(&euler_to_matrix(&angles));
        for (a, b) in angles.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_euler_derivatives_match_finite_differences() {
        let angles = [0.2, 0.5, -0.7];
        let d = euler_derivatives(&angles);
        let h = 1e-6;
        for k in 0..3 {
            let mut plus = angles;
            let mut minus = angles;
            plus[k] += h;
            minus[k] -= h;
            let fd = (euler_to_matrix(&plus) - euler_to_matrix(&minus)) / (2.0 * h);
            assert!((fd - d[k]).abs().max() < 1e-8, "angle {}", k);
        }
    }

    #[test]
    fn test_polar_rotation_of_scaled_rotation() {
        let r = euler_to_matrix(&[0.1, 0.2, 0.3]);
        let m = r * Matrix3::from_diagonal(&nalgebra::Vector3::new(2.0, 1.5, 0.7));
        let p = polar_rotation(&(r * 3.0));
        assert!((p - r).abs().max() < 1e-10);
        assert!(is_rotation(&polar_rotation(&m)));
    }
}

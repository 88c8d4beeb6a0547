//! Rigid / affine transform with an explicit centre and half transforms.

use nalgebra::{Matrix3, Matrix4, Vector3};
use serde::{Deserialize, Serialize};

use super::matrix::{euler_derivatives, euler_to_matrix, matrix_to_euler, sqrtm};

/// Degrees of freedom of a linear transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformKind {
    /// Translation plus Euler ZYX rotation, 6 parameters.
    Rigid,
    /// Full 3×4 matrix, 12 parameters.
    Affine,
}

impl TransformKind {
    pub fn nparams(self) -> usize {
        match self {
            TransformKind::Rigid => 6,
            TransformKind::Affine => 12,
        }
    }
}

/// Default optimiser weight for rotation angles and matrix entries.
///
/// One millimetre of translation moves points far more than one radian of
/// rotation scaled by this factor moves them for typical head-sized images.
pub const DEFAULT_LINEAR_WEIGHT: f64 = 0.0003;

/// A linear transform `T(x) = M (x - c) + c + t` mapping image1 scanner space
/// onto image2 scanner space.
///
/// The centre `c` only affects parameterisation (what rotations pivot
/// around), so [`Transform::set_centre`] keeps the mapping fixed while
/// [`Transform::set_centre_without_transform_update`] moves it.
///
/// The half transform `H` satisfies `H ∘ H = T`; midway space is reached from
/// image1 by `H` and image2 by `H⁻¹`, so sampling at a midway point `m` reads
/// image1 at `H⁻¹(m)` and image2 at `H(m)`.
///
/// # Examples
/// ```rust
/// use mireg_core::transform::{Transform, TransformKind};
/// use nalgebra::Vector3;
///
/// let mut t = Transform::identity(TransformKind::Rigid);
/// t.set_parameters(&[2.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
/// let half = t.half().unwrap();
/// let p = half.apply(&half.apply(&Vector3::zeros()));
/// assert!((p - Vector3::new(2.0, 0.0, 0.0)).norm() < 1e-12);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    kind: TransformKind,
    matrix: Matrix3<f64>,
    translation: Vector3<f64>,
    centre: Vector3<f64>,
    optimiser_weights: Option<Vec<f64>>,
}

impl Transform {
    pub fn identity(kind: TransformKind) -> Self {
        Self {
            kind,
            matrix: Matrix3::identity(),
            translation: Vector3::zeros(),
            centre: Vector3::zeros(),
            optimiser_weights: None,
        }
    }

    /// Build from a homogeneous matrix (`x' = A x + o`) and a centre.
    pub fn from_matrix4(kind: TransformKind, affine: &Matrix4<f64>, centre: Vector3<f64>) -> Self {
        let mut t = Self::identity(kind);
        t.set_matrix4(affine);
        t.set_centre(centre);
        t
    }

    pub fn kind(&self) -> TransformKind {
        self.kind
    }

    /// Same mapping reinterpreted with different degrees of freedom.
    ///
    /// Converting an affine to rigid projects the matrix onto the closest
    /// rotation.
    pub fn with_kind(mut self, kind: TransformKind) -> Self {
        if kind == TransformKind::Rigid && self.kind != TransformKind::Rigid {
            let offset = self.offset();
            self.matrix = super::matrix::polar_rotation(&self.matrix);
            self.translation = offset - self.centre + self.matrix * self.centre;
        }
        if kind != self.kind {
            self.optimiser_weights = None;
        }
        self.kind = kind;
        self
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    pub fn centre(&self) -> &Vector3<f64> {
        &self.centre
    }

    /// Offset `o` of the equivalent uncentred form `x' = M x + o`.
    pub fn offset(&self) -> Vector3<f64> {
        self.translation + self.centre - self.matrix * self.centre
    }

    /// Replace the linear part, keeping centre and translation.
    pub fn set_matrix(&mut self, matrix: Matrix3<f64>) {
        self.matrix = matrix;
    }

    pub fn set_translation(&mut self, translation: Vector3<f64>) {
        self.translation = translation;
    }

    /// Homogeneous form of the mapping.
    pub fn to_matrix4(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.matrix);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.offset());
        m
    }

    /// Replace the whole mapping, keeping the current centre.
    pub fn set_matrix4(&mut self, affine: &Matrix4<f64>) {
        self.matrix = affine.fixed_view::<3, 3>(0, 0).into_owned();
        let offset: Vector3<f64> = affine.fixed_view::<3, 1>(0, 3).into_owned();
        self.translation = offset - self.centre + self.matrix * self.centre;
    }

    /// Move the centre while keeping the mapping unchanged.
    pub fn set_centre(&mut self, centre: Vector3<f64>) {
        let offset = self.offset();
        self.centre = centre;
        self.translation = offset - centre + self.matrix * centre;
    }

    /// Move the centre, keeping matrix and translation (the mapping changes).
    pub fn set_centre_without_transform_update(&mut self, centre: Vector3<f64>) {
        self.centre = centre;
    }

    #[inline]
    pub fn apply(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.matrix * (p - self.centre) + self.centre + self.translation
    }

    /// Inverse mapping, pivoting around the image of the centre.
    pub fn inverse(&self) -> Option<Transform> {
        let inv = self.matrix.try_inverse()?;
        Some(Transform {
            kind: self.kind,
            matrix: inv,
            translation: -self.translation,
            centre: self.centre + self.translation,
            optimiser_weights: self.optimiser_weights.clone(),
        })
    }

    /// Square root of the mapping, `H` with `H ∘ H = self`.
    ///
    /// In homogeneous form the root of `[M o; 0 1]` is `[S u; 0 1]` with
    /// `S = sqrt(M)` and `u = (S + I)⁻¹ o`.
    pub fn half(&self) -> Option<Transform> {
        let s = sqrtm(&self.matrix)?;
        let u = (s + Matrix3::identity()).try_inverse()? * self.offset();
        let mut h = Transform {
            kind: self.kind,
            matrix: s,
            translation: Vector3::zeros(),
            centre: self.centre,
            optimiser_weights: self.optimiser_weights.clone(),
        };
        h.translation = u - self.centre + s * self.centre;
        Some(h)
    }

    /// Inverse of [`Transform::half`]: maps image2 onto midway space.
    pub fn half_inverse(&self) -> Option<Transform> {
        self.half()?.inverse()
    }

    /// Composition `self ∘ other` (apply `other` first), centred like `self`.
    pub fn compose(&self, other: &Transform) -> Transform {
        let m = self.to_matrix4() * other.to_matrix4();
        Transform::from_matrix4(self.kind, &m, self.centre)
    }

    pub fn nparams(&self) -> usize {
        self.kind.nparams()
    }

    /// Parameter vector.
    ///
    /// Rigid: `[tx, ty, tz, ax, ay, az]` with `M = Rz(az) Ry(ay) Rx(ax)`.
    /// Affine: row-major `[M | t]`, i.e. `[m00, m01, m02, tx, m10, ...]`.
    pub fn parameters(&self) -> Vec<f64> {
        match self.kind {
            TransformKind::Rigid => {
                let a = matrix_to_euler(&self.matrix);
                vec![
                    self.translation.x,
                    self.translation.y,
                    self.translation.z,
                    a[0],
                    a[1],
                    a[2],
                ]
            }
            TransformKind::Affine => {
                let mut p = Vec::with_capacity(12);
                for i in 0..3 {
                    for j in 0..3 {
                        p.push(self.matrix[(i, j)]);
                    }
                    p.push(self.translation[i]);
                }
                p
            }
        }
    }

    /// Set matrix and translation from a parameter vector (centre unchanged).
    ///
    /// # Panics
    /// Panics if `params.len()` differs from [`Transform::nparams`].
    pub fn set_parameters(&mut self, params: &[f64]) {
        assert_eq!(params.len(), self.nparams(), "parameter count mismatch");
        match self.kind {
            TransformKind::Rigid => {
                self.translation = Vector3::new(params[0], params[1], params[2]);
                self.matrix = euler_to_matrix(&[params[3], params[4], params[5]]);
            }
            TransformKind::Affine => {
                for i in 0..3 {
                    for j in 0..3 {
                        self.matrix[(i, j)] = params[i * 4 + j];
                    }
                    self.translation[i] = params[i * 4 + 3];
                }
            }
        }
    }

    /// Per-parameter step scaling used to precondition gradient descent.
    pub fn optimiser_weights(&self) -> Vec<f64> {
        if let Some(w) = &self.optimiser_weights {
            return w.clone();
        }
        match self.kind {
            TransformKind::Rigid => {
                let w = DEFAULT_LINEAR_WEIGHT;
                vec![1.0, 1.0, 1.0, w, w, w]
            }
            TransformKind::Affine => (0..12)
                .map(|k| if k % 4 == 3 { 1.0 } else { DEFAULT_LINEAR_WEIGHT })
                .collect(),
        }
    }

    /// Override the optimiser weights.
    ///
    /// # Panics
    /// Panics if `weights.len()` differs from [`Transform::nparams`].
    pub fn set_optimiser_weights(&mut self, weights: Vec<f64>) {
        assert_eq!(weights.len(), self.nparams(), "weight count mismatch");
        self.optimiser_weights = Some(weights);
    }

    /// Add `Jᵀ g` to `out`, where `J = ∂T(p)/∂params` evaluated at `p`.
    pub fn accumulate_parameter_gradient(&self, p: &Vector3<f64>, g: &Vector3<f64>, out: &mut [f64]) {
        let d = p - self.centre;
        match self.kind {
            TransformKind::Rigid => {
                out[0] += g.x;
                out[1] += g.y;
                out[2] += g.z;
                let angles = matrix_to_euler(&self.matrix);
                let dr = euler_derivatives(&angles);
                for k in 0..3 {
                    out[3 + k] += g.dot(&(dr[k] * d));
                }
            }
            TransformKind::Affine => {
                for i in 0..3 {
                    for j in 0..3 {
                        out[i * 4 + j] += g[i] * d[j];
                    }
                    out[i * 4 + 3] += g[i];
                }
            }
        }
    }

    /// Full parameter Jacobian at `p`, one row per output coordinate.
    pub fn parameter_jacobian(&self, p: &Vector3<f64>) -> Vec<[f64; 3]> {
        let n = self.nparams();
        let mut cols = vec![[0.0; 3]; n];
        for axis in 0..3 {
            let mut e = Vector3::zeros();
            e[axis] = 1.0;
            let mut row = vec![0.0; n];
            self.accumulate_parameter_gradient(p, &e, &mut row);
            for k in 0..n {
                cols[k][axis] = row[k];
            }
        }
        cols
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_affine() -> Transform {
        let mut t = Transform::identity(TransformKind::Affine);
        t.set_centre(Vector3::new(5.0, -3.0, 10.0));
        t.set_parameters(&[
            1.1, 0.05, -0.02, 3.0, //
            -0.03, 0.95, 0.1, -1.5, //
            0.02, -0.08, 1.05, 0.5,
        ]);
        t
    }

    #[test]
    fn test_set_centre_keeps_mapping() {
        let mut t = sample_affine();
        let p = Vector3::new(1.0, 2.0, 3.0);
        let before = t.apply(&p);
        t.set_centre(Vector3::new(-20.0, 4.0, 7.0));
        assert!((t.apply(&p) - before).norm() < 1e-10);
    }

    #[test]
    fn test_set_centre_without_update_changes_mapping() {
        let mut t = sample_affine();
        let p = Vector3::new(1.0, 2.0, 3.0);
        let before = t.apply(&p);
        t.set_centre_without_transform_update(Vector3::new(-20.0, 4.0, 7.0));
        assert!((t.apply(&p) - before).norm() > 1e-3);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = sample_affine();
        let inv = t.inverse().unwrap();
        let p = Vector3::new(-4.0, 8.0, 1.5);
        assert!((inv.apply(&t.apply(&p)) - p).norm() < 1e-10);
    }

    #[test]
    fn test_half_squares_to_full() {
        let t = sample_affine();
        let h = t.half().unwrap();
        let hi = t.half_inverse().unwrap();
        let p = Vector3::new(7.0, -2.0, 0.25);
        assert!((h.apply(&h.apply(&p)) - t.apply(&p)).norm() < 1e-9);
        assert!((hi.apply(&h.apply(&p)) - p).norm() < 1e-9);
    }

    #[test]
    fn test_rigid_parameters_roundtrip() {
        let mut t = Transform::identity(TransformKind::Rigid);
        let params = [1.0, -2.0, 0.5, 0.1, -0.2, 0.3];
        t.set_parameters(&params);
        for (a, b) in t.parameters().iter().zip(params.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_parameter_jacobian_matches_finite_differences() {
        for kind in [TransformKind::Rigid, TransformKind::Affine] {
            let mut t = Transform::identity(kind);
            t.set_centre(Vector3::new(1.0, 2.0, 3.0));
            let mut params = t.parameters();
            params[0] += 0.3;
            if kind == TransformKind::Rigid {
                params[3] = 0.2;
                params[5] = -0.1;
            }
            t.set_parameters(&params);

            let p = Vector3::new(4.0, -1.0, 6.0);
            let jac = t.parameter_jacobian(&p);
            let h = 1e-6;
            for k in 0..t.nparams() {
                let mut plus = params.clone();
                plus[k] += h;
                let mut minus = params.clone();
                minus[k] -= h;
                let mut tp = t.clone();
                tp.set_parameters(&plus);
                let mut tm = t.clone();
                tm.set_parameters(&minus);
                let fd = (tp.apply(&p) - tm.apply(&p)) / (2.0 * h);
                for a in 0..3 {
                    assert!((fd[a] - jac[k][a]).abs() < 1e-6, "{:?} param {} axis {}", kind, k, a);
                }
            }
        }
    }

    #[test]
    fn test_default_optimiser_weights() {
        let rigid = Transform::identity(TransformKind::Rigid).optimiser_weights();
        assert_eq!(rigid[..3], [1.0, 1.0, 1.0]);
        assert_eq!(rigid[3], DEFAULT_LINEAR_WEIGHT);
        let affine = Transform::identity(TransformKind::Affine).optimiser_weights();
        assert_eq!(affine[3], 1.0);
        assert_eq!(affine[0], DEFAULT_LINEAR_WEIGHT);
    }

    #[test]
    fn test_compose_matches_sequential_application() {
        let a = sample_affine();
        let mut b = Transform::identity(TransformKind::Rigid);
        b.set_parameters(&[0.0, 1.0, 0.0, 0.0, 0.0, 0.5]);
        let p = Vector3::new(3.0, 1.0, -2.0);
        assert!((a.compose(&b).apply(&p) - a.apply(&b.apply(&p))).norm() < 1e-10);
    }
}

//! Image geometry: grid size, voxel-to-scanner mapping and key/value metadata.

use std::collections::BTreeMap;

use nalgebra::{Matrix3, Matrix4, Vector3};
use serde::{Deserialize, Serialize};

use crate::spatial::{Direction3, Point3, Spacing3};

/// Geometry of a (possibly multi-volume) 3-D image.
///
/// The first three axes are spatial. Any further axes are flattened into the
/// per-voxel "volume" dimension, whose shape is kept in `vol_shape` so that
/// 4-D (`[n]`) and 5-D (`[3, 4]`) images round-trip.
///
/// Voxel index `i` maps to scanner space as
/// `p = origin + direction * (spacing ⊙ i)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    dims: [usize; 3],
    vol_shape: Vec<usize>,
    origin: Point3,
    spacing: Spacing3,
    direction: Direction3,
    keyval: BTreeMap<String, String>,
}

impl Header {
    /// Create a scalar (single-volume) header.
    pub fn new(dims: [usize; 3], origin: Point3, spacing: Spacing3, direction: Direction3) -> Self {
        Self {
            dims,
            vol_shape: Vec::new(),
            origin,
            spacing,
            direction,
            keyval: BTreeMap::new(),
        }
    }

    /// Axis-aligned header with unit spacing and the origin at zero.
    pub fn unit(dims: [usize; 3]) -> Self {
        Self::new(dims, Point3::origin(), Spacing3::uniform(1.0), Direction3::identity())
    }

    /// Same geometry with `n` volumes per voxel (4-D image).
    pub fn with_volumes(mut self, n: usize) -> Self {
        self.vol_shape = if n == 1 { Vec::new() } else { vec![n] };
        self
    }

    /// Same geometry with an explicit shape for the non-spatial axes.
    pub fn with_vol_shape(mut self, shape: Vec<usize>) -> Self {
        self.vol_shape = shape;
        self
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Number of spatial voxels.
    pub fn nvoxels(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    /// Number of values stored per voxel.
    pub fn nvols(&self) -> usize {
        self.vol_shape.iter().product::<usize>().max(1)
    }

    pub fn vol_shape(&self) -> &[usize] {
        &self.vol_shape
    }

    /// Total number of axes (3 for scalar images).
    pub fn ndim(&self) -> usize {
        3 + self.vol_shape.len()
    }

    pub fn origin(&self) -> &Point3 {
        &self.origin
    }

    pub fn spacing(&self) -> &Spacing3 {
        &self.spacing
    }

    pub fn direction(&self) -> &Direction3 {
        &self.direction
    }

    pub fn keyval(&self) -> &BTreeMap<String, String> {
        &self.keyval
    }

    pub fn keyval_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.keyval
    }

    /// Linear part of the voxel-to-scanner map (`direction * diag(spacing)`).
    pub fn voxel_to_scanner_linear(&self) -> Matrix3<f64> {
        self.direction.0 * Matrix3::from_diagonal(&self.spacing.0)
    }

    /// Homogeneous voxel-to-scanner matrix.
    pub fn voxel_to_scanner(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.voxel_to_scanner_linear());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.origin.0.coords);
        m
    }

    /// Homogeneous scanner-to-voxel matrix, or `None` when the direction
    /// matrix or a spacing is singular.
    pub fn scanner_to_voxel(&self) -> Option<Matrix4<f64>> {
        self.voxel_to_scanner().try_inverse()
    }

    /// Scanner-space position of a continuous voxel index.
    pub fn index_to_scanner(&self, index: &Vector3<f64>) -> Vector3<f64> {
        self.origin.0.coords + self.voxel_to_scanner_linear() * index
    }

    /// Scanner-space position of the centre of voxel `(x, y, z)`.
    pub fn voxel_position(&self, x: usize, y: usize, z: usize) -> Vector3<f64> {
        self.index_to_scanner(&Vector3::new(x as f64, y as f64, z as f64))
    }

    /// Row-major linear index with x varying fastest.
    #[inline]
    pub fn linear_index(&self, x: usize, y: usize, z: usize) -> usize {
        (z * self.dims[1] + y) * self.dims[0] + x
    }

    /// Inverse of [`Header::linear_index`].
    #[inline]
    pub fn coords(&self, index: usize) -> [usize; 3] {
        let x = index % self.dims[0];
        let y = (index / self.dims[0]) % self.dims[1];
        let z = index / (self.dims[0] * self.dims[1]);
        [x, y, z]
    }

    /// Convert a gradient taken along voxel axes into a scanner-space gradient.
    ///
    /// With `p = M i + o` the chain rule gives `∇_p f = M^{-T} ∇_i f`.
    pub fn index_gradient_to_scanner(&self) -> Matrix3<f64> {
        self.voxel_to_scanner_linear()
            .try_inverse()
            .map(|m| m.transpose())
            .unwrap_or_else(Matrix3::identity)
    }

    /// Scanner-space positions of the eight corner voxel centres.
    pub fn corners(&self) -> [Vector3<f64>; 8] {
        let hi = [
            self.dims[0].saturating_sub(1) as f64,
            self.dims[1].saturating_sub(1) as f64,
            self.dims[2].saturating_sub(1) as f64,
        ];
        let mut out = [Vector3::zeros(); 8];
        for (n, corner) in out.iter_mut().enumerate() {
            let idx = Vector3::new(
                if n & 1 == 0 { 0.0 } else { hi[0] },
                if n & 2 == 0 { 0.0 } else { hi[1] },
                if n & 4 == 0 { 0.0 } else { hi[2] },
            );
            *corner = self.index_to_scanner(&idx);
        }
        out
    }

    /// Scanner-space centre of the voxel grid.
    pub fn centre(&self) -> Vector3<f64> {
        let idx = Vector3::new(
            (self.dims[0] as f64 - 1.0) * 0.5,
            (self.dims[1] as f64 - 1.0) * 0.5,
            (self.dims[2] as f64 - 1.0) * 0.5,
        );
        self.index_to_scanner(&idx)
    }

    /// True if both headers describe the same voxel grid.
    pub fn same_grid(&self, other: &Header) -> bool {
        self.dims == other.dims
            && (self.voxel_to_scanner() - other.voxel_to_scanner()).abs().max() < 1e-6
    }
}

//! Host-side voxel buffer with geometry.

use std::ops::Range;

use nalgebra::Vector3;

use super::header::Header;

/// A 3-D image with an arbitrary number of values per voxel.
///
/// Values are stored voxel-major with the volume index innermost:
/// `data[linear_index(x, y, z) * nvols + v]`. This keeps each voxel's
/// coefficient vector (an FOD, a displacement) contiguous, which is what
/// every per-voxel kernel in the registration engine wants.
///
/// # Examples
/// ```rust
/// use mireg_core::image::{Header, Image};
///
/// let header = Header::unit([4, 4, 4]).with_volumes(3);
/// let mut field = Image::zeros(header);
/// field.voxel_mut(0).copy_from_slice(&[1.0, 2.0, 3.0]);
/// assert_eq!(field.value(0, 0, 0, 2), 3.0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    header: Header,
    data: Vec<f32>,
}

impl Image {
    /// Allocate a zero-filled image.
    pub fn zeros(header: Header) -> Self {
        let len = header.nvoxels() * header.nvols();
        Self {
            header,
            data: vec![0.0; len],
        }
    }

    /// Wrap existing data.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the header.
    pub fn from_data(header: Header, data: Vec<f32>) -> Self {
        assert_eq!(
            data.len(),
            header.nvoxels() * header.nvols(),
            "image data length must match header geometry"
        );
        Self { header, data }
    }

    /// Build a scalar image by evaluating `f` at every voxel's scanner position.
    pub fn from_fn(header: Header, f: impl Fn(Vector3<f64>) -> f32) -> Self {
        let header = header.with_volumes(1);
        let data = (0..header.nvoxels())
            .map(|i| {
                let [x, y, z] = header.coords(i);
                f(header.voxel_position(x, y, z))
            })
            .collect();
        Self { header, data }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn nvols(&self) -> usize {
        self.header.nvols()
    }

    /// All values of the voxel with linear index `index`.
    #[inline]
    pub fn voxel(&self, index: usize) -> &[f32] {
        let n = self.header.nvols();
        &self.data[index * n..(index + 1) * n]
    }

    #[inline]
    pub fn voxel_mut(&mut self, index: usize) -> &mut [f32] {
        let n = self.header.nvols();
        &mut self.data[index * n..(index + 1) * n]
    }

    #[inline]
    pub fn value(&self, x: usize, y: usize, z: usize, v: usize) -> f32 {
        self.data[self.header.linear_index(x, y, z) * self.header.nvols() + v]
    }

    /// Read a 3-vector from a three-volume image (displacement or deformation).
    #[inline]
    pub fn vector(&self, index: usize) -> Vector3<f64> {
        let v = self.voxel(index);
        Vector3::new(v[0] as f64, v[1] as f64, v[2] as f64)
    }

    #[inline]
    pub fn set_vector(&mut self, index: usize, value: &Vector3<f64>) {
        let v = self.voxel_mut(index);
        v[0] = value.x as f32;
        v[1] = value.y as f32;
        v[2] = value.z as f32;
    }

    /// Copy the listed volume ranges, in order, into a new image.
    pub fn select_volumes(&self, ranges: &[Range<usize>]) -> Image {
        let nout: usize = ranges.iter().map(|r| r.len()).sum();
        let header = self.header.clone().with_volumes(nout);
        let mut data = Vec::with_capacity(self.header.nvoxels() * nout);
        for i in 0..self.header.nvoxels() {
            let voxel = self.voxel(i);
            for r in ranges {
                data.extend_from_slice(&voxel[r.clone()]);
            }
        }
        Image { header, data }
    }

    /// Concatenate two images on the same grid along the volume axis.
    ///
    /// # Panics
    /// Panics if the spatial grids differ.
    pub fn concat_volumes(&self, other: &Image) -> Image {
        assert!(self.header.same_grid(other.header()), "images must share a voxel grid");
        let (na, nb) = (self.nvols(), other.nvols());
        let header = self.header.clone().with_volumes(na + nb);
        let mut data = Vec::with_capacity(self.header.nvoxels() * (na + nb));
        for i in 0..self.header.nvoxels() {
            data.extend_from_slice(self.voxel(i));
            data.extend_from_slice(other.voxel(i));
        }
        Image { header, data }
    }

    /// Largest absolute value across all voxels and volumes.
    pub fn max_abs(&self) -> f32 {
        self.data.iter().fold(0.0f32, |m, v| m.max(v.abs()))
    }
}

//! Per-voxel samples of both images on the midway grid.

use mireg_core::image::Header;
use nalgebra::Vector3;
use rayon::prelude::*;

/// Mutable view of one voxel's sample slots while filling.
pub struct SampleSlot<'a> {
    pub values1: &'a mut [f64],
    pub values2: &'a mut [f64],
    pub grads1: &'a mut [Vector3<f64>],
    pub grads2: &'a mut [Vector3<f64>],
}

/// Values and scanner-space gradients of image1 and image2 at every midway
/// voxel, plus a validity flag (inside both fields of view and masks).
///
/// Metrics read these instead of sampling images themselves, which lets
/// neighbourhood metrics look at adjacent voxels without resampling.
#[derive(Debug, Clone)]
pub struct MidwaySamples {
    header: Header,
    nvols: usize,
    weights: Vec<f64>,
    values1: Vec<f64>,
    values2: Vec<f64>,
    grads1: Vec<Vector3<f64>>,
    grads2: Vec<Vector3<f64>>,
    valid: Vec<bool>,
}

impl MidwaySamples {
    /// Allocate samples for the spatial grid of `header`; one weight per volume.
    pub fn new(header: &Header, weights: Vec<f64>) -> Self {
        let n = header.nvoxels();
        let nvols = weights.len().max(1);
        Self {
            header: header.clone().with_volumes(1),
            nvols,
            weights: if weights.is_empty() { vec![1.0] } else { weights },
            values1: vec![0.0; n * nvols],
            values2: vec![0.0; n * nvols],
            grads1: vec![Vector3::zeros(); n * nvols],
            grads2: vec![Vector3::zeros(); n * nvols],
            valid: vec![false; n],
        }
    }

    /// Fill every voxel in parallel; `f` returns whether the voxel is valid.
    pub fn fill<F>(&mut self, f: F)
    where
        F: Fn(usize, SampleSlot<'_>) -> bool + Sync,
    {
        let nv = self.nvols;
        self.values1
            .par_chunks_mut(nv)
            .zip(self.values2.par_chunks_mut(nv))
            .zip(self.grads1.par_chunks_mut(nv))
            .zip(self.grads2.par_chunks_mut(nv))
            .zip(self.valid.par_iter_mut())
            .enumerate()
            .for_each(|(i, ((((values1, values2), grads1), grads2), valid))| {
                *valid = f(
                    i,
                    SampleSlot {
                        values1,
                        values2,
                        grads1,
                        grads2,
                    },
                );
            });
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn nvoxels(&self) -> usize {
        self.valid.len()
    }

    pub fn nvols(&self) -> usize {
        self.nvols
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    #[inline]
    pub fn is_valid(&self, index: usize) -> bool {
        self.valid[index]
    }

    #[inline]
    pub fn values1(&self, index: usize) -> &[f64] {
        &self.values1[index * self.nvols..(index + 1) * self.nvols]
    }

    #[inline]
    pub fn values2(&self, index: usize) -> &[f64] {
        &self.values2[index * self.nvols..(index + 1) * self.nvols]
    }

    #[inline]
    pub fn grads1(&self, index: usize) -> &[Vector3<f64>] {
        &self.grads1[index * self.nvols..(index + 1) * self.nvols]
    }

    #[inline]
    pub fn grads2(&self, index: usize) -> &[Vector3<f64>] {
        &self.grads2[index * self.nvols..(index + 1) * self.nvols]
    }

    /// Number of valid voxels.
    pub fn valid_count(&self) -> usize {
        self.valid.iter().filter(|v| **v).count()
    }

    /// Squared mean spacing of the grid, the Demons normaliser.
    pub fn spacing_normaliser(&self) -> f64 {
        let s = self.header.spacing().mean_spacing();
        s * s
    }
}

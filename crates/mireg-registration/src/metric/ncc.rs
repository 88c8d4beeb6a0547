//! Local normalised cross-correlation.

use rayon::prelude::*;

use super::samples::MidwaySamples;
use super::{Metric, VoxelTerm};

const MIN_VARIANCE: f64 = 1e-10;

/// Neighbourhood statistics of one voxel and volume.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NccStats {
    /// `Σ f̃ m̃` over the neighbourhood (mean-subtracted).
    pub a: f64,
    /// `Σ f̃²`.
    pub b: f64,
    /// `Σ m̃²`.
    pub c: f64,
    /// Centre value of image1 minus the neighbourhood mean.
    pub f_hat: f64,
    /// Centre value of image2 minus the neighbourhood mean.
    pub m_hat: f64,
}

impl NccStats {
    /// Statistics of paired samples; `centre` indexes the centre voxel.
    pub fn from_neighbourhood(f: &[f64], m: &[f64], centre: usize) -> Self {
        let n = f.len().min(m.len());
        if n == 0 {
            return Self::default();
        }
        let f_mean = f[..n].iter().sum::<f64>() / n as f64;
        let m_mean = m[..n].iter().sum::<f64>() / n as f64;
        let mut s = Self {
            f_hat: f[centre] - f_mean,
            m_hat: m[centre] - m_mean,
            ..Self::default()
        };
        for (fv, mv) in f[..n].iter().zip(&m[..n]) {
            let (df, dm) = (fv - f_mean, mv - m_mean);
            s.a += df * dm;
            s.b += df * df;
            s.c += dm * dm;
        }
        s
    }

    /// `A² / (B C)` when both variances are non-degenerate.
    pub fn correlation_squared(&self) -> Option<f64> {
        (self.b > MIN_VARIANCE && self.c > MIN_VARIANCE).then(|| self.a * self.a / (self.b * self.c))
    }
}

/// Compute per-voxel, per-volume neighbourhood statistics over valid voxels.
pub fn neighbourhood_stats(samples: &MidwaySamples, radius: [usize; 3]) -> Vec<NccStats> {
    let header = samples.header();
    let dims = header.dims();
    let nv = samples.nvols();
    let mut stats = vec![NccStats::default(); samples.nvoxels() * nv];

    stats
        .par_chunks_mut(nv)
        .enumerate()
        .for_each_init(
            || (Vec::new(), Vec::new()),
            |(f, m), (i, out)| {
                if !samples.is_valid(i) {
                    return;
                }
                let [x, y, z] = header.coords(i);
                let range = |c: usize, a: usize| {
                    c.saturating_sub(radius[a])..(c + radius[a] + 1).min(dims[a])
                };
                for v in 0..nv {
                    f.clear();
                    m.clear();
                    let mut centre = 0;
                    for zz in range(z, 2) {
                        for yy in range(y, 1) {
                            for xx in range(x, 0) {
                                let j = header.linear_index(xx, yy, zz);
                                if !samples.is_valid(j) {
                                    continue;
                                }
                                if j == i {
                                    centre = f.len();
                                }
                                f.push(samples.values1(j)[v]);
                                m.push(samples.values2(j)[v]);
                            }
                        }
                    }
                    out[v] = NccStats::from_neighbourhood(f, m, centre);
                }
            },
        );
    stats
}

/// Negative squared local correlation, summed over volumes with their weights.
#[derive(Debug, Clone)]
pub struct LocalCrossCorrelation {
    radius: [usize; 3],
    stats: Vec<NccStats>,
}

impl LocalCrossCorrelation {
    /// `extent` is the odd neighbourhood size along each axis (3 gives 3×3×3).
    pub fn new(extent: [usize; 3]) -> Self {
        Self {
            radius: [extent[0] / 2, extent[1] / 2, extent[2] / 2],
            stats: Vec::new(),
        }
    }
}

impl Default for LocalCrossCorrelation {
    fn default() -> Self {
        Self::new([3, 3, 3])
    }
}

impl Metric for LocalCrossCorrelation {
    fn name(&self) -> &'static str {
        "local cross-correlation"
    }

    fn is_neighbourhood(&self) -> bool {
        true
    }

    fn requires_precompute(&self) -> bool {
        true
    }

    fn precompute(&mut self, samples: &MidwaySamples) {
        self.stats = neighbourhood_stats(samples, self.radius);
    }

    fn evaluate(&self, index: usize, samples: &MidwaySamples) -> Option<VoxelTerm> {
        if !samples.is_valid(index) {
            return None;
        }
        let nv = samples.nvols();
        let stats = self.stats.get(index * nv..(index + 1) * nv)?;
        let (g1, g2) = (samples.grads1(index), samples.grads2(index));
        let mut term = VoxelTerm::default();
        let mut any = false;
        for (v, w) in samples.weights().iter().enumerate() {
            let s = &stats[v];
            let Some(r2) = s.correlation_squared() else { continue };
            any = true;
            term.cost -= w * r2;
            let k = 2.0 * s.a / (s.b * s.c);
            let dcost_di2 = -w * k * (s.f_hat - s.a / s.c * s.m_hat);
            let dcost_di1 = -w * k * (s.m_hat - s.a / s.b * s.f_hat);
            term.grad += VoxelTerm::symmetric_gradient(dcost_di2, &g2[v], dcost_di1, &g1[v]);
        }
        any.then_some(term)
    }
}

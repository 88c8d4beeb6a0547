//! Brute-force rotation search at low resolution.

use std::marker::PhantomData;

use burn::tensor::backend::Backend;
use mireg_core::directions::golden_spiral;
use mireg_core::filter::{downscale, ResampleImageFilter};
use mireg_core::image::Image;
use mireg_core::interpolation::ImageSampler;
use mireg_core::transform::Transform;
use nalgebra::{Matrix3, Quaternion, Rotation3, Unit, UnitQuaternion, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::centre_of_mass::centre_of_mass;
use super::{in_mask, intensity_image, Initialiser, InitialiserInput};
use crate::error::{RegistrationError, Result};
use crate::validation::validate_scale_factor;

/// Which candidate set to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SearchMode {
    /// Every angle about every direction of a golden-angle spiral.
    #[default]
    Local,
    /// Uniformly random rotations with optional translation jitter.
    Global,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationSearchConfig {
    pub mode: SearchMode,
    /// Rotation angles tried in local mode, in degrees.
    pub angles: Vec<f64>,
    /// Number of rotation axes in local mode.
    pub directions: usize,
    /// Resolution of the images the cost is evaluated on.
    pub scale: f64,
    /// Number of random candidates in global mode.
    pub global_iterations: usize,
    /// Translation jitter in global mode, as a fraction of image2's field of view.
    pub translation_extent: f64,
    pub seed: u64,
}

impl Default for RotationSearchConfig {
    fn default() -> Self {
        Self {
            mode: SearchMode::Local,
            angles: vec![
                2.0, 5.0, 10.0, 15.0, 20.0, 30.0, 45.0, 60.0, 90.0, 120.0, 150.0, 180.0,
            ],
            directions: 250,
            scale: 0.15,
            global_iterations: 10_000,
            translation_extent: 0.1,
            seed: 0,
        }
    }
}

impl RotationSearchConfig {
    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_angles(mut self, angles: Vec<f64>) -> Self {
        self.angles = angles;
        self
    }

    pub fn with_directions(mut self, directions: usize) -> Self {
        self.directions = directions;
        self
    }

    pub fn with_global_iterations(mut self, iterations: usize, seed: u64) -> Self {
        self.global_iterations = iterations;
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_scale_factor(self.scale)?;
        match self.mode {
            SearchMode::Local => {
                if self.angles.is_empty() || self.directions == 0 {
                    return Err(RegistrationError::invalid_configuration(
                        "local rotation search needs at least one angle and one direction",
                    ));
                }
                if self.angles.iter().any(|a| !a.is_finite()) {
                    return Err(RegistrationError::invalid_configuration(
                        "rotation search angles must be finite",
                    ));
                }
            }
            SearchMode::Global => {
                if self.global_iterations == 0 {
                    return Err(RegistrationError::invalid_configuration(
                        "global rotation search needs at least one candidate",
                    ));
                }
                if !(self.translation_extent >= 0.0 && self.translation_extent.is_finite()) {
                    return Err(RegistrationError::invalid_configuration(format!(
                        "translation extent must be finite and non-negative, got {}",
                        self.translation_extent
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Outcome of a search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    /// Mean squared difference of the winning candidate.
    pub cost: f64,
    /// Overlapping voxels of the winning candidate.
    pub overlap: usize,
    /// Index of the winner; 0 is the starting transform.
    pub best_index: usize,
    pub candidates: usize,
}

/// Image1 voxels used by the cost: scanner position and intensity.
struct SearchGrid {
    points: Vec<(Vector3<f64>, f64)>,
    image2: Image,
    mask2: Option<Image>,
}

impl SearchGrid {
    /// Mean squared difference over the overlap, and the overlap size.
    fn cost(&self, transform: &Transform) -> (f64, usize) {
        let sampler = ImageSampler::new(&self.image2);
        let mask_sampler = self.mask2.as_ref().map(ImageSampler::new);
        let mut value = [0.0];
        let mut mask_value = [0.0];
        let mut sum = 0.0;
        let mut count = 0usize;
        for (p, v1) in &self.points {
            let q = transform.apply(p);
            if !sampler.value(&q, &mut value) {
                continue;
            }
            if let Some(ms) = &mask_sampler {
                if !ms.nearest(&q, &mut mask_value) || mask_value[0] <= 0.5 {
                    continue;
                }
            }
            let d = value[0] - v1;
            sum += d * d;
            count += 1;
        }
        if count == 0 {
            (f64::INFINITY, 0)
        } else {
            (sum / count as f64, count)
        }
    }
}

/// Evaluates candidate rotations of the current transform and keeps the best.
///
/// Candidates rotate the mapped image about `A(c1)`, the current image of
/// image1's centre of mass: `A' = R (A - q) + q`. The starting transform is
/// always candidate 0. Candidates whose overlap is below the mean overlap of
/// all candidates are discarded before picking the lowest cost.
#[derive(Debug, Clone)]
pub struct RotationSearch<B: Backend> {
    config: RotationSearchConfig,
    device: B::Device,
    _backend: PhantomData<B>,
}

impl<B: Backend> RotationSearch<B> {
    pub fn new(config: RotationSearchConfig, device: B::Device) -> Self {
        Self {
            config,
            device,
            _backend: PhantomData,
        }
    }

    fn grid(&self, input: &InitialiserInput<'_>) -> SearchGrid {
        let scale = self.config.scale;
        let image1 = downscale::<B>(&intensity_image(input.image1, input.contrasts), scale, &self.device);
        let image2 = downscale::<B>(&intensity_image(input.image2, input.contrasts), scale, &self.device);
        let mask1 = input
            .mask1
            .map(|m| ResampleImageFilter::new(image1.header().clone()).apply(m));
        let mask2 = input.mask2.cloned();

        let header = image1.header();
        let points = (0..header.nvoxels())
            .filter(|&i| in_mask(mask1.as_ref(), i))
            .map(|i| {
                let [x, y, z] = header.coords(i);
                (header.voxel_position(x, y, z), image1.voxel(i)[0] as f64)
            })
            .collect();
        SearchGrid {
            points,
            image2,
            mask2,
        }
    }

    fn candidates(&self, transform: &Transform, pivot: &Vector3<f64>, fov: &Vector3<f64>) -> Vec<Transform> {
        let rotate = |r: &Matrix3<f64>, jitter: Vector3<f64>| {
            let mut t = transform.clone();
            let c = *transform.centre();
            t.set_matrix(r * transform.matrix());
            t.set_translation(r * (c + transform.translation() - pivot) + pivot - c + jitter);
            t
        };

        let mut out = vec![transform.clone()];
        match self.config.mode {
            SearchMode::Local => {
                let axes = golden_spiral(self.config.directions);
                for angle in &self.config.angles {
                    let radians = angle.to_radians();
                    for axis in &axes {
                        let r = Rotation3::from_axis_angle(&Unit::new_normalize(*axis), radians);
                        out.push(rotate(r.matrix(), Vector3::zeros()));
                    }
                }
            }
            SearchMode::Global => {
                let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
                let extent = self.config.translation_extent;
                for _ in 0..self.config.global_iterations {
                    let q = random_rotation(&mut rng);
                    let jitter = if extent > 0.0 {
                        Vector3::new(
                            rng.gen_range(-1.0..=1.0),
                            rng.gen_range(-1.0..=1.0),
                            rng.gen_range(-1.0..=1.0),
                        )
                        .component_mul(fov)
                            * extent
                    } else {
                        Vector3::zeros()
                    };
                    out.push(rotate(q.to_rotation_matrix().matrix(), jitter));
                }
            }
        }
        out
    }

    /// Replace `transform` with the best candidate.
    pub fn run(&self, input: &InitialiserInput<'_>, transform: &mut Transform) -> Result<SearchResult> {
        self.config.validate()?;
        let c1 = centre_of_mass(input.image1, input.mask1, input.contrasts)?;
        let pivot = transform.apply(&c1);
        let h2 = input.image2.header();
        let dims = h2.dims();
        let fov = Vector3::new(
            dims[0] as f64 * h2.spacing()[0],
            dims[1] as f64 * h2.spacing()[1],
            dims[2] as f64 * h2.spacing()[2],
        );

        let grid = self.grid(input);
        let candidates = self.candidates(transform, &pivot, &fov);
        let scores: Vec<(f64, usize)> = candidates.par_iter().map(|t| grid.cost(t)).collect();

        let mean_overlap = scores.iter().map(|s| s.1 as f64).sum::<f64>() / scores.len() as f64;
        let best = scores
            .iter()
            .enumerate()
            .filter(|(_, (cost, overlap))| *overlap > 0 && *overlap as f64 >= mean_overlap && cost.is_finite())
            .min_by(|a, b| a.1 .0.total_cmp(&b.1 .0).then(a.0.cmp(&b.0)))
            .map(|(i, s)| (i, *s))
            .ok_or_else(|| {
                RegistrationError::degenerate_input("rotation search found no candidate with any overlap")
            })?;

        let (best_index, (cost, overlap)) = best;
        *transform = candidates[best_index].clone();
        tracing::info!(
            candidates = candidates.len(),
            best_index,
            cost,
            overlap,
            mean_overlap,
            "rotation search finished"
        );
        Ok(SearchResult {
            cost,
            overlap,
            best_index,
            candidates: candidates.len(),
        })
    }
}

impl<B: Backend> Initialiser for RotationSearch<B> {
    fn initialise(&self, input: &InitialiserInput<'_>, transform: &mut Transform) -> Result<()> {
        self.run(input, transform).map(|_| ())
    }
}

/// Uniformly distributed rotation (Shoemake's subgroup algorithm).
fn random_rotation(rng: &mut impl Rng) -> UnitQuaternion<f64> {
    let (u1, u2, u3): (f64, f64, f64) = (rng.gen(), rng.gen(), rng.gen());
    let tau = std::f64::consts::TAU;
    let (a, b) = ((1.0 - u1).sqrt(), u1.sqrt());
    UnitQuaternion::from_quaternion(Quaternion::new(
        b * (tau * u3).cos(),
        a * (tau * u2).sin(),
        a * (tau * u2).cos(),
        b * (tau * u3).sin(),
    ))
}

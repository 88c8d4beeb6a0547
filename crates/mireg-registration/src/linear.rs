//! Multi-resolution rigid and affine registration.

use std::sync::Arc;

use burn::tensor::backend::Backend;
use mireg_core::filter::{downscale, ResampleImageFilter};
use mireg_core::image::{Header, Image};
use mireg_core::interpolation::ImageSampler;
use mireg_core::transform::{Transform, TransformKind};
use nalgebra::Vector3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::diagnostics::DiagnosticsSink;
use crate::error::{RegistrationError, Result, ResultExt};
use crate::metric::{LinearMetricKind, Metric, MidwaySamples};
use crate::midway::midway_header;
use crate::multi_contrast::{
    select_level_volumes, set_level_lmax, validate_contrasts, volume_weights, MultiContrastSetting,
};
use crate::optimizer::{
    BarzilaiBorwein, ControlPointConvergence, ConvergenceConfig, Evaluation, GradientDescent,
    IterationRecord, Objective, OptimiserResult,
};
use crate::progress::{ProgressInfo, ProgressTracker};
use crate::reorient::FodReorientation;
use crate::stage::{build_stages, OptimiserKind, StageSetting};
use crate::validation::{validate_image_pair, validate_mask, validate_positive};

/// Settings of one linear stage (rigid or affine).
///
/// Per-level vectors hold one value for all levels or one per scale factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearConfig {
    pub kind: TransformKind,
    pub scale_factors: Vec<f64>,
    pub max_iterations: Vec<usize>,
    pub loop_density: Vec<f64>,
    pub fod_lmax: Vec<usize>,
    pub optimisers: Vec<OptimiserKind>,
    pub metric: LinearMetricKind,
    /// First optimiser step, in midway voxels.
    pub initial_step: f64,
    pub convergence: ConvergenceConfig,
    /// Scale reoriented FODs by the local volume change.
    pub modulate_fods: bool,
}

impl LinearConfig {
    pub fn new(kind: TransformKind) -> Self {
        Self {
            kind,
            scale_factors: vec![0.25, 0.5, 1.0],
            max_iterations: vec![500],
            loop_density: vec![1.0],
            fod_lmax: vec![0, 2, 4],
            optimisers: vec![OptimiserKind::GradientDescent],
            metric: LinearMetricKind::default(),
            initial_step: 0.5,
            convergence: ConvergenceConfig::default(),
            modulate_fods: false,
        }
    }

    pub fn rigid() -> Self {
        Self::new(TransformKind::Rigid)
    }

    pub fn affine() -> Self {
        Self::new(TransformKind::Affine)
    }

    /// Use `scales` with one shared value for every other per-level option.
    pub fn with_scale_factors(mut self, scales: Vec<f64>) -> Self {
        self.scale_factors = scales;
        if self.fod_lmax.len() != 1 && self.fod_lmax.len() != self.scale_factors.len() {
            self.fod_lmax = vec![*self.fod_lmax.last().unwrap_or(&0)];
        }
        self
    }

    pub fn with_max_iterations(mut self, iterations: Vec<usize>) -> Self {
        self.max_iterations = iterations;
        self
    }

    pub fn with_loop_density(mut self, density: Vec<f64>) -> Self {
        self.loop_density = density;
        self
    }

    pub fn with_fod_lmax(mut self, lmax: Vec<usize>) -> Self {
        self.fod_lmax = lmax;
        self
    }

    pub fn with_optimisers(mut self, optimisers: Vec<OptimiserKind>) -> Self {
        self.optimisers = optimisers;
        self
    }

    pub fn with_metric(mut self, metric: LinearMetricKind) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_initial_step(mut self, step: f64) -> Self {
        self.initial_step = step;
        self
    }

    pub fn stages(&self) -> Result<Vec<StageSetting>> {
        build_stages(
            &self.scale_factors,
            &self.max_iterations,
            &self.loop_density,
            &self.fod_lmax,
            &self.optimisers,
        )
    }

    pub fn validate(&self) -> Result<()> {
        self.stages()?;
        self.metric.validate()?;
        validate_positive("initial step", self.initial_step)
    }

    pub fn stage_name(&self) -> &'static str {
        match self.kind {
            TransformKind::Rigid => "rigid",
            TransformKind::Affine => "affine",
        }
    }
}

/// What happened at one pyramid level.
#[derive(Debug, Clone)]
pub struct LevelReport {
    pub scale: f64,
    pub cost: f64,
    pub evaluations: usize,
    pub converged: bool,
    pub history: Vec<IterationRecord>,
}

#[derive(Debug, Clone)]
pub struct LinearResult {
    pub transform: Transform,
    pub levels: Vec<LevelReport>,
}

impl LinearResult {
    pub fn final_cost(&self) -> f64 {
        self.levels.last().map_or(f64::NAN, |l| l.cost)
    }
}

/// Coarse-to-fine optimisation of a rigid or affine transform.
///
/// At each level both images are smoothed and downsampled, FOD contrasts are
/// truncated to the level's order, the midway grid is rebuilt from the
/// current half transforms and the configured optimiser passes run against
/// the symmetric cost in midway space.
pub struct LinearRegistration<B: Backend> {
    config: LinearConfig,
    device: B::Device,
    tracker: ProgressTracker,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
}

impl<B: Backend> LinearRegistration<B> {
    pub fn new(config: LinearConfig, device: B::Device) -> Self {
        Self {
            config,
            device,
            tracker: ProgressTracker::new(),
            diagnostics: None,
        }
    }

    pub fn with_tracker(mut self, tracker: ProgressTracker) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Optimise `transform` in place. Its kind is converted to the configured
    /// kind first; the centre is kept.
    pub fn run(
        &self,
        image1: &Image,
        image2: &Image,
        mask1: Option<&Image>,
        mask2: Option<&Image>,
        contrasts: &[MultiContrastSetting],
        transform: &mut Transform,
    ) -> Result<LinearResult> {
        let stage = self.config.stage_name();
        self.config.validate().context(format!("{} configuration", stage))?;
        validate_image_pair(image1, image2)?;
        validate_mask("mask1", image1, mask1)?;
        validate_mask("mask2", image2, mask2)?;
        let contrasts = if contrasts.is_empty() {
            vec![MultiContrastSetting::scalar(image1.nvols())]
        } else {
            contrasts.to_vec()
        };
        validate_contrasts(&contrasts, image1.nvols())?;

        let stages = self.config.stages()?;
        *transform = transform.clone().with_kind(self.config.kind);
        self.tracker.start(stage);
        tracing::info!(stage, levels = stages.len(), "starting linear registration");

        let mut levels = Vec::with_capacity(stages.len());
        for (level, setting) in stages.iter().enumerate() {
            let report = self
                .run_level(image1, image2, mask1, mask2, &contrasts, transform, level, stages.len(), setting)
                .map_err(|e| {
                    self.tracker.error(&e.to_string());
                    e
                })
                .with_context(|| format!("{} level {}", stage, level))?;
            levels.push(report);
        }

        let result = LinearResult {
            transform: transform.clone(),
            levels,
        };
        self.tracker.complete(stage, result.final_cost());
        tracing::info!(stage, cost = result.final_cost(), matrix = ?transform.to_matrix4(), "linear registration finished");
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_level(
        &self,
        image1: &Image,
        image2: &Image,
        mask1: Option<&Image>,
        mask2: Option<&Image>,
        contrasts: &[MultiContrastSetting],
        transform: &mut Transform,
        level: usize,
        nlevels: usize,
        setting: &StageSetting,
    ) -> Result<LevelReport> {
        let stage = self.config.stage_name();
        let scale = setting.scale_factor;
        self.tracker.level(stage, level, nlevels, scale);

        let mut level_contrasts = contrasts.to_vec();
        set_level_lmax(&mut level_contrasts, setting.fod_lmax);
        let im1 = downscale::<B>(&select_level_volumes(image1, &level_contrasts), scale, &self.device);
        let im2 = downscale::<B>(&select_level_volumes(image2, &level_contrasts), scale, &self.device);

        let (half, half_inverse) = halves(transform)?;
        let midway = midway_header(im1.header(), im2.header(), &half, &half_inverse, 1.0)?;
        let spacing = midway.spacing().mean_spacing();
        tracing::debug!(stage, level, scale, dims = ?midway.dims(), "linear level");

        let reorientation = FodReorientation::new(&level_contrasts, self.config.modulate_fods)?;
        let mut objective = LinearObjective {
            transform: transform.clone(),
            image1: &im1,
            image2: &im2,
            mask1,
            mask2,
            samples: MidwaySamples::new(&midway, volume_weights(&level_contrasts)),
            metric: self.config.metric.build(),
            reorientation,
            subset: density_subset(midway.nvoxels(), setting.loop_density),
            convergence: ControlPointConvergence::new(*transform.centre(), spacing, self.config.convergence),
            tracker: &self.tracker,
            stage,
            level,
            max_iterations: setting.max_iterations,
        };

        let weights = transform.optimiser_weights();
        let step = self.config.initial_step * spacing;
        let mut params = transform.parameters();
        let mut history = Vec::new();
        let mut last: Option<OptimiserResult> = None;
        for kind in &setting.optimisers {
            let result = match kind {
                OptimiserKind::GradientDescent => GradientDescent::new(weights.clone(), setting.max_iterations)
                    .with_initial_step(step)
                    .run(&mut objective, &params)?,
                OptimiserKind::BarzilaiBorwein => BarzilaiBorwein::new(weights.clone(), setting.max_iterations)
                    .with_initial_step(step)
                    .run(&mut objective, &params)?,
            };
            params = result.params.clone();
            history.extend(result.history.iter().copied());
            last = Some(result);
        }
        let last = last.ok_or_else(|| RegistrationError::invalid_configuration("no optimiser configured"))?;
        transform.set_parameters(&params);

        if let Some(sink) = &self.diagnostics {
            let (half, half_inverse) = halves(transform)?;
            sink.level_complete(stage, level, &midway_pair(&im1, &im2, &midway, &half, &half_inverse));
        }

        tracing::info!(
            stage,
            level,
            cost = last.cost,
            evaluations = history.len(),
            converged = last.converged,
            "linear level finished"
        );
        Ok(LevelReport {
            scale,
            cost: last.cost,
            evaluations: history.len(),
            converged: last.converged,
            history,
        })
    }
}

/// `(H, H⁻¹)` of a transform.
pub(crate) fn halves(transform: &Transform) -> Result<(Transform, Transform)> {
    let half = transform
        .half()
        .ok_or_else(|| RegistrationError::transform("transform matrix has no real square root"))?;
    let half_inverse = half
        .inverse()
        .ok_or_else(|| RegistrationError::transform("half transform is singular"))?;
    Ok((half, half_inverse))
}

/// Both images resampled into midway space, concatenated along volumes.
pub(crate) fn midway_pair(
    image1: &Image,
    image2: &Image,
    midway: &Header,
    half: &Transform,
    half_inverse: &Transform,
) -> Image {
    let filter = ResampleImageFilter::new(midway.clone());
    let a = filter.apply_mapped(image1, |m| half_inverse.apply(m));
    let b = filter.apply_mapped(image2, |m| half.apply(m));
    a.concat_volumes(&b)
}

/// Deterministic voxel subset for loop densities below one.
fn density_subset(nvoxels: usize, density: f64) -> Option<Vec<bool>> {
    if density >= 1.0 {
        return None;
    }
    let threshold = (density * u64::MAX as f64) as u64;
    Some((0..nvoxels).map(|i| splitmix64(i as u64) < threshold).collect())
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[inline]
fn in_mask(sampler: Option<&ImageSampler<'_>>, p: &Vector3<f64>) -> bool {
    match sampler {
        None => true,
        Some(s) => {
            let mut v = [0.0];
            s.value(p, &mut v) && v[0] > 0.5
        }
    }
}

/// Symmetric midway cost as a function of the transform parameters.
struct LinearObjective<'a> {
    transform: Transform,
    image1: &'a Image,
    image2: &'a Image,
    mask1: Option<&'a Image>,
    mask2: Option<&'a Image>,
    samples: MidwaySamples,
    metric: Box<dyn Metric>,
    reorientation: Option<FodReorientation>,
    subset: Option<Vec<bool>>,
    convergence: ControlPointConvergence,
    tracker: &'a ProgressTracker,
    stage: &'static str,
    level: usize,
    max_iterations: usize,
}

impl LinearObjective<'_> {
    fn sample(&mut self, half: &Transform, half_inverse: &Transform) {
        let s1 = ImageSampler::new(self.image1);
        let s2 = ImageSampler::new(self.image2);
        let m1 = self.mask1.map(ImageSampler::new);
        let m2 = self.mask2.map(ImageSampler::new);
        // image1 is pulled through H⁻¹ and image2 through H
        let reorient = self.reorientation.as_ref().and_then(|plan| {
            let r1 = plan.matrices(half_inverse.matrix())?;
            let r2 = plan.matrices(half.matrix())?;
            Some((plan, r1, r2))
        });
        let subset = self.subset.as_deref();
        let header = self.samples.header().clone();

        self.samples.fill(|i, slot| {
            if subset.is_some_and(|s| !s[i]) {
                return false;
            }
            let [x, y, z] = header.coords(i);
            let m = header.voxel_position(x, y, z);
            let p1 = half_inverse.apply(&m);
            let p2 = half.apply(&m);
            if !in_mask(m1.as_ref(), &p1) || !in_mask(m2.as_ref(), &p2) {
                return false;
            }
            if !s1.value_and_gradient(&p1, slot.values1, slot.grads1)
                || !s2.value_and_gradient(&p2, slot.values2, slot.grads2)
            {
                return false;
            }
            if let Some((plan, r1, r2)) = &reorient {
                plan.apply_to_gradients(r1, slot.values1, slot.grads1);
                plan.apply(r1, slot.values1);
                plan.apply_to_gradients(r2, slot.values2, slot.grads2);
                plan.apply(r2, slot.values2);
            }
            true
        });
    }
}

impl Objective for LinearObjective<'_> {
    fn evaluate(&mut self, params: &[f64]) -> Result<Evaluation> {
        self.transform.set_parameters(params);
        let (half, half_inverse) = halves(&self.transform)?;
        self.sample(&half, &half_inverse);
        if self.metric.requires_precompute() {
            self.metric.precompute(&self.samples);
        }

        let nparams = self.transform.nparams();
        let metric = &*self.metric;
        let samples = &self.samples;
        let transform = &self.transform;
        let header = samples.header();
        let zero = || (0.0f64, 0usize, vec![0.0f64; nparams]);
        let (cost, count, mut gradient) = (0..samples.nvoxels())
            .into_par_iter()
            .fold(zero, |(mut cost, mut count, mut grad), i| {
                if let Some(term) = metric.evaluate(i, samples) {
                    let [x, y, z] = header.coords(i);
                    let p1 = half_inverse.apply(&header.voxel_position(x, y, z));
                    cost += term.cost;
                    count += 1;
                    transform.accumulate_parameter_gradient(&p1, &term.grad, &mut grad);
                }
                (cost, count, grad)
            })
            .reduce(zero, |(c1, n1, mut g1), (c2, n2, g2)| {
                g1.iter_mut().zip(&g2).for_each(|(a, b)| *a += b);
                (c1 + c2, n1 + n2, g1)
            });

        if count == 0 {
            return Err(RegistrationError::degenerate_input(
                "images do not overlap in midway space",
            ));
        }
        let n = count as f64;
        gradient.iter_mut().for_each(|g| *g /= n);
        Ok(Evaluation {
            cost: cost / n,
            gradient,
        })
    }

    fn accepted(&mut self, params: &[f64], _cost: f64) -> bool {
        let mut t = self.transform.clone();
        t.set_parameters(params);
        self.convergence.update(&t)
    }

    fn report(&mut self, iteration: usize, cost: f64, accepted: bool, step: f64) {
        tracing::debug!(stage = self.stage, level = self.level, iteration, cost, accepted, step, "linear iteration");
        self.tracker.update(
            ProgressInfo::new(self.stage, self.level, iteration, cost)
                .with_total_iterations(self.max_iterations)
                .with_accepted(accepted)
                .with_step_size(step),
        );
    }
}

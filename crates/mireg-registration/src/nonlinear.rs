//! Symmetric diffeomorphic registration.
//!
//! Both images are pulled into midway space through their linear half
//! transform and a non-linear displacement field. Every iteration turns the
//! smoothed metric forces into a diffeomorphic field update, warps both images
//! with the candidate fields and keeps the candidates only if the cost drops.

use std::sync::Arc;

use burn::tensor::backend::Backend;
use mireg_core::filter::{downscale, Boundary, GaussianFilter};
use mireg_core::image::{Header, Image};
use mireg_core::interpolation::ImageSampler;
use mireg_core::transform::Transform;
use nalgebra::Vector3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::diagnostics::DiagnosticsSink;
use crate::error::{RegistrationError, Result, ResultExt};
use crate::linear::halves;
use crate::metric::{MidwaySamples, NonLinearMetricKind, UpdateMetric};
use crate::midway::midway_header;
use crate::multi_contrast::{
    select_level_volumes, set_level_lmax, validate_contrasts, volume_weights, MultiContrastSetting,
};
use crate::progress::{ProgressInfo, ProgressTracker};
use crate::reorient::FodReorientation;
use crate::stage::{build_stages, OptimiserKind, StageSetting};
use crate::validation::{validate_fwhm, validate_image_pair, validate_mask, validate_positive};
use crate::warp::{
    central_gradient, compose_linear_deformation, compose_linear_displacement, deformation2displacement,
    displacement2deformation, invert_displacement, jacobian_matrices, negative_jacobian_count,
    resample_field, update_displacement_scaling_and_squaring, warp_image, warp_mask, zero_field,
    InversionConfig, WarpedImage,
};

const STAGE: &str = "nonlinear";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonLinearConfig {
    pub scale_factors: Vec<f64>,
    pub max_iterations: Vec<usize>,
    pub fod_lmax: Vec<usize>,
    /// FWHM of the update smoothing, in voxels (0 disables).
    pub update_smoothing: f64,
    /// FWHM of the displacement smoothing, in voxels (0 disables).
    pub displacement_smoothing: f64,
    pub gradient_step: f64,
    pub metric: NonLinearMetricKind,
    pub inversion: InversionConfig,
    pub modulate_fods: bool,
}

impl Default for NonLinearConfig {
    fn default() -> Self {
        Self {
            scale_factors: vec![0.25, 0.5, 1.0],
            max_iterations: vec![50],
            fod_lmax: vec![2],
            update_smoothing: 2.0,
            displacement_smoothing: 1.0,
            gradient_step: 0.5,
            metric: NonLinearMetricKind::default(),
            inversion: InversionConfig::default(),
            modulate_fods: false,
        }
    }
}

impl NonLinearConfig {
    pub fn with_scale_factors(mut self, scales: Vec<f64>) -> Self {
        self.scale_factors = scales;
        self
    }

    pub fn with_max_iterations(mut self, iterations: Vec<usize>) -> Self {
        self.max_iterations = iterations;
        self
    }

    pub fn with_fod_lmax(mut self, lmax: Vec<usize>) -> Self {
        self.fod_lmax = lmax;
        self
    }

    pub fn with_smoothing(mut self, update_fwhm: f64, displacement_fwhm: f64) -> Self {
        self.update_smoothing = update_fwhm;
        self.displacement_smoothing = displacement_fwhm;
        self
    }

    pub fn with_gradient_step(mut self, step: f64) -> Self {
        self.gradient_step = step;
        self
    }

    pub fn with_metric(mut self, metric: NonLinearMetricKind) -> Self {
        self.metric = metric;
        self
    }

    pub fn stages(&self) -> Result<Vec<StageSetting>> {
        build_stages(
            &self.scale_factors,
            &self.max_iterations,
            &[1.0],
            &self.fod_lmax,
            &[OptimiserKind::GradientDescent],
        )
    }

    pub fn validate(&self) -> Result<()> {
        self.stages()?;
        self.metric.validate()?;
        validate_fwhm("update smoothing", self.update_smoothing)?;
        validate_fwhm("displacement smoothing", self.displacement_smoothing)?;
        validate_positive("gradient step", self.gradient_step)?;
        validate_positive("inversion tolerance", self.inversion.tolerance)
    }
}

/// The four canonical fields on the midway grid plus the linear halves.
///
/// Fields hold the non-linear part only. `im1_to_mid` is the deformation
/// through which image1, after its linear half `linear1`, is pulled into
/// midway space; `mid_to_im1` is its inverse. Likewise for image2.
#[derive(Debug, Clone)]
pub struct WarpFields {
    pub im1_to_mid: Image,
    pub mid_to_im1: Image,
    pub im2_to_mid: Image,
    pub mid_to_im2: Image,
    /// Half transform taking image1 into midway space.
    pub linear1: Transform,
    /// Half transform taking image2 into midway space.
    pub linear2: Transform,
}

impl WarpFields {
    pub fn midway(&self) -> &Header {
        self.im1_to_mid.header()
    }

    /// Scanner position in image1 read by every midway voxel.
    pub fn image1_deformation(&self) -> Option<Image> {
        Some(compose_linear_deformation(&self.linear1.inverse()?, &self.im1_to_mid))
    }

    /// Scanner position in image2 read by every midway voxel.
    pub fn image2_deformation(&self) -> Option<Image> {
        Some(compose_linear_deformation(&self.linear2.inverse()?, &self.im2_to_mid))
    }

    /// Deformation on image1's grid giving each voxel's position in image2.
    ///
    /// Voxels whose path leaves the midway grid are NaN.
    pub fn image1_to_image2(&self, header1: &Header) -> Option<Image> {
        let pull = self.linear2.inverse()?;
        Some(full_warp(header1, &self.linear1, &self.mid_to_im1, &self.im2_to_mid, &pull))
    }

    /// Deformation on image2's grid giving each voxel's position in image1.
    pub fn image2_to_image1(&self, header2: &Header) -> Option<Image> {
        let pull = self.linear1.inverse()?;
        Some(full_warp(header2, &self.linear2, &self.mid_to_im2, &self.im1_to_mid, &pull))
    }
}

/// `x -> pull(forward(inverse(push(x))))` sampled on `header`.
fn full_warp(header: &Header, push: &Transform, inverse: &Image, forward: &Image, pull: &Transform) -> Image {
    let inverse = ImageSampler::new(inverse);
    let forward = ImageSampler::new(forward);
    let mut out = Image::zeros(header.clone().with_volumes(3));
    out.data_mut().par_chunks_mut(3).enumerate().for_each(|(i, v)| {
        let [x, y, z] = header.coords(i);
        let mut m = [0.0; 3];
        let mut q = [0.0; 3];
        let hit = inverse.value(&push.apply(&header.voxel_position(x, y, z)), &mut m)
            && forward.value(&Vector3::new(m[0], m[1], m[2]), &mut q);
        if hit {
            let p = pull.apply(&Vector3::new(q[0], q[1], q[2]));
            v.copy_from_slice(&[p.x as f32, p.y as f32, p.z as f32]);
        } else {
            v.fill(f32::NAN);
        }
    });
    out
}

/// Starting point of a non-linear run.
#[derive(Debug, Clone)]
pub enum NonLinearInit {
    /// Split a linear transform into halves; fields start at zero.
    Linear(Transform),
    /// Continue from existing fields: a single full-resolution level is run.
    Warp(WarpFields),
}

/// Named buffers of the field arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSlot {
    Im1ToMid,
    Im2ToMid,
    MidToIm1,
    MidToIm2,
    Im1Update,
    Im2Update,
}

impl FieldSlot {
    const ALL: [FieldSlot; 6] = [
        FieldSlot::Im1ToMid,
        FieldSlot::Im2ToMid,
        FieldSlot::MidToIm1,
        FieldSlot::MidToIm2,
        FieldSlot::Im1Update,
        FieldSlot::Im2Update,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Displacement fields of one run: an active buffer per slot plus an
/// optional candidate that [`FieldStore::commit`] swaps in.
#[derive(Debug, Clone)]
pub struct FieldStore {
    active: Vec<Image>,
    candidate: Vec<Option<Image>>,
}

impl FieldStore {
    /// All slots zero on the grid of `header`.
    pub fn zeros(header: &Header) -> Self {
        Self {
            active: FieldSlot::ALL.iter().map(|_| zero_field(header)).collect(),
            candidate: vec![None; FieldSlot::ALL.len()],
        }
    }

    pub fn header(&self) -> &Header {
        self.active[0].header()
    }

    pub fn get(&self, slot: FieldSlot) -> &Image {
        &self.active[slot.index()]
    }

    /// Overwrite an active buffer directly.
    pub fn set(&mut self, slot: FieldSlot, field: Image) {
        self.active[slot.index()] = field;
    }

    pub fn stage(&mut self, slot: FieldSlot, field: Image) {
        self.candidate[slot.index()] = Some(field);
    }

    pub fn candidate(&self, slot: FieldSlot) -> Option<&Image> {
        self.candidate[slot.index()].as_ref()
    }

    /// Make the staged candidate active; returns false if none was staged.
    pub fn commit(&mut self, slot: FieldSlot) -> bool {
        match self.candidate[slot.index()].take() {
            Some(mut field) => {
                std::mem::swap(&mut self.active[slot.index()], &mut field);
                true
            }
            None => false,
        }
    }

    pub fn discard(&mut self) {
        self.candidate.iter_mut().for_each(|c| *c = None);
    }

    /// Regrid every active buffer (coarse to fine level change).
    pub fn resample(&mut self, header: &Header) {
        self.discard();
        for field in self.active.iter_mut() {
            *field = resample_field(field, header);
        }
    }
}

#[derive(Debug, Clone)]
pub struct NonLinearLevelReport {
    pub scale: f64,
    pub dims: [usize; 3],
    pub cost: f64,
    /// Metric evaluations, including the rejected final one.
    pub iterations: usize,
}

#[derive(Debug, Clone)]
pub struct NonLinearResult {
    /// Deformation fields (absolute midway coordinates).
    pub warps: WarpFields,
    pub levels: Vec<NonLinearLevelReport>,
    /// Voxels with non-positive Jacobian determinant in `im1_to_mid` and `im2_to_mid`.
    pub folded_voxels: [usize; 2],
}

/// Coarse-to-fine symmetric Demons-style registration.
pub struct NonLinearRegistration<B: Backend> {
    config: NonLinearConfig,
    device: B::Device,
    tracker: ProgressTracker,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
}

/// Working state of one level after an accepted iteration.
struct Accepted {
    cost: f64,
    warped1: Image,
    warped2: Image,
}

impl<B: Backend> NonLinearRegistration<B> {
    pub fn new(config: NonLinearConfig, device: B::Device) -> Self {
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

    pub fn run(
        &self,
        image1: &Image,
        image2: &Image,
        mask1: Option<&Image>,
        mask2: Option<&Image>,
        contrasts: &[MultiContrastSetting],
        init: &NonLinearInit,
    ) -> Result<NonLinearResult> {
        self.config.validate().context("nonlinear configuration")?;
        validate_image_pair(image1, image2)?;
        validate_mask("mask1", image1, mask1)?;
        validate_mask("mask2", image2, mask2)?;
        let contrasts = if contrasts.is_empty() {
            vec![MultiContrastSetting::scalar(image1.nvols())]
        } else {
            contrasts.to_vec()
        };
        validate_contrasts(&contrasts, image1.nvols())?;

        let mut stages = self.config.stages()?;
        let (linear1, linear2, mut store) = match init {
            NonLinearInit::Linear(transform) => {
                let (half, half_inverse) = halves(transform)?;
                let coarsest = stages.first().map_or(1.0, |s| s.scale_factor);
                let first = midway_header(image1.header(), image2.header(), &half, &half_inverse, coarsest)?;
                (half, half_inverse, FieldStore::zeros(&first))
            }
            NonLinearInit::Warp(fields) => {
                let mut store = FieldStore::zeros(fields.midway());
                store.set(FieldSlot::Im1ToMid, deformation2displacement(&fields.im1_to_mid));
                store.set(FieldSlot::MidToIm1, deformation2displacement(&fields.mid_to_im1));
                store.set(FieldSlot::Im2ToMid, deformation2displacement(&fields.im2_to_mid));
                store.set(FieldSlot::MidToIm2, deformation2displacement(&fields.mid_to_im2));
                let last = stages.pop().ok_or_else(|| {
                    RegistrationError::invalid_configuration("at least one level is required")
                })?;
                stages = vec![StageSetting { scale_factor: 1.0, ..last }];
                (fields.linear1.clone(), fields.linear2.clone(), store)
            }
        };
        let pull1 = linear1
            .inverse()
            .ok_or_else(|| RegistrationError::transform("image1 half transform is singular"))?;
        let pull2 = linear2
            .inverse()
            .ok_or_else(|| RegistrationError::transform("image2 half transform is singular"))?;

        self.tracker.start(STAGE);
        tracing::info!(levels = stages.len(), metric = ?self.config.metric, "starting nonlinear registration");

        let mut levels = Vec::with_capacity(stages.len());
        let from_warp = matches!(init, NonLinearInit::Warp(_));
        for (level, setting) in stages.iter().enumerate() {
            let header = if from_warp {
                store.header().clone()
            } else {
                midway_header(image1.header(), image2.header(), &linear1, &linear2, setting.scale_factor)?
            };
            if !store.header().same_grid(&header) {
                store.resample(&header);
            }
            let report = self
                .run_level(
                    image1, image2, mask1, mask2, &contrasts, &pull1, &pull2, &mut store, level,
                    stages.len(), setting,
                )
                .map_err(|e| {
                    self.tracker.error(&e.to_string());
                    e
                })
                .with_context(|| format!("nonlinear level {}", level))?;
            levels.push(report);
        }

        let folded_voxels = [
            negative_jacobian_count(store.get(FieldSlot::Im1ToMid)),
            negative_jacobian_count(store.get(FieldSlot::Im2ToMid)),
        ];
        if folded_voxels.iter().any(|n| *n > 0) {
            tracing::warn!(
                ?folded_voxels,
                "warp is not diffeomorphic (non-positive Jacobian determinants); consider stronger smoothing"
            );
        }

        let warps = WarpFields {
            im1_to_mid: displacement2deformation(store.get(FieldSlot::Im1ToMid)),
            mid_to_im1: displacement2deformation(store.get(FieldSlot::MidToIm1)),
            im2_to_mid: displacement2deformation(store.get(FieldSlot::Im2ToMid)),
            mid_to_im2: displacement2deformation(store.get(FieldSlot::MidToIm2)),
            linear1,
            linear2,
        };
        let final_cost = levels.last().map_or(f64::NAN, |l: &NonLinearLevelReport| l.cost);
        self.tracker.complete(STAGE, final_cost);
        tracing::info!(cost = final_cost, "nonlinear registration finished");
        Ok(NonLinearResult {
            warps,
            levels,
            folded_voxels,
        })
    }

    fn smooth(&self, field: &Image, fwhm: f64, boundary: Boundary) -> Image {
        if fwhm <= 0.0 {
            return field.clone();
        }
        GaussianFilter::<B>::from_fwhm_voxels(fwhm)
            .with_boundary(boundary)
            .apply(field, &self.device)
    }

    /// Pull an image through `linear ∘ (id + displacement)`, reorienting FODs.
    fn pull(
        &self,
        image: &Image,
        linear: &Transform,
        displacement: &Image,
        reorientation: Option<&FodReorientation>,
    ) -> (WarpedImage, Image) {
        let deformation = compose_linear_displacement(linear, displacement);
        let mut warped = warp_image(image, &deformation);
        if let Some(plan) = reorientation {
            let jacobians = jacobian_matrices(displacement);
            let m = *linear.matrix();
            plan.apply_to_image(&mut warped.image, |i| Some(m * jacobians[i]));
        }
        (warped, deformation)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_level(
        &self,
        image1: &Image,
        image2: &Image,
        mask1: Option<&Image>,
        mask2: Option<&Image>,
        contrasts: &[MultiContrastSetting],
        pull1: &Transform,
        pull2: &Transform,
        store: &mut FieldStore,
        level: usize,
        nlevels: usize,
        setting: &StageSetting,
    ) -> Result<NonLinearLevelReport> {
        let scale = setting.scale_factor;
        self.tracker.level(STAGE, level, nlevels, scale);
        let header = store.header().clone();

        let mut level_contrasts = contrasts.to_vec();
        set_level_lmax(&mut level_contrasts, setting.fod_lmax);
        let im1 = downscale::<B>(&select_level_volumes(image1, &level_contrasts), scale, &self.device);
        let im2 = downscale::<B>(&select_level_volumes(image2, &level_contrasts), scale, &self.device);
        let reorientation = FodReorientation::new(&level_contrasts, self.config.modulate_fods)?;
        let mut metric = self.config.metric.build();
        let mut samples = MidwaySamples::new(&header, volume_weights(&level_contrasts));
        tracing::debug!(level, scale, dims = ?header.dims(), "nonlinear level");

        let mut best: Option<Accepted> = None;
        let mut iterations = 0;
        while iterations < setting.max_iterations {
            iterations += 1;

            let update1 = self.smooth(store.get(FieldSlot::Im1Update), self.config.update_smoothing, Boundary::Renormalise);
            let update2 = self.smooth(store.get(FieldSlot::Im2Update), self.config.update_smoothing, Boundary::Renormalise);
            let step = self.config.gradient_step;
            let field1 = update_displacement_scaling_and_squaring(store.get(FieldSlot::Im1ToMid), &update1, step);
            let field2 = update_displacement_scaling_and_squaring(store.get(FieldSlot::Im2ToMid), &update2, step);
            let field1 = self.smooth(&field1, self.config.displacement_smoothing, Boundary::Zero);
            let field2 = self.smooth(&field2, self.config.displacement_smoothing, Boundary::Zero);

            let (warped1, deformation1) = self.pull(&im1, pull1, &field1, reorientation.as_ref());
            let (warped2, deformation2) = self.pull(&im2, pull2, &field2, reorientation.as_ref());
            let valid_mask1 = mask1.map(|m| warp_mask(m, &deformation1));
            let valid_mask2 = mask2.map(|m| warp_mask(m, &deformation2));
            let grads1 = central_gradient(&warped1.image);
            let grads2 = central_gradient(&warped2.image);

            let nv = samples.nvols();
            samples.fill(|i, slot| {
                if !(warped1.valid[i] && warped2.valid[i]) {
                    return false;
                }
                if valid_mask1.as_ref().is_some_and(|m| m.voxel(i)[0] < 0.5)
                    || valid_mask2.as_ref().is_some_and(|m| m.voxel(i)[0] < 0.5)
                {
                    return false;
                }
                for v in 0..nv {
                    slot.values1[v] = warped1.image.voxel(i)[v] as f64;
                    slot.values2[v] = warped2.image.voxel(i)[v] as f64;
                    slot.grads1[v] = grads1[i * nv + v];
                    slot.grads2[v] = grads2[i * nv + v];
                }
                true
            });
            if metric.requires_precompute() {
                metric.precompute(&samples);
            }

            let (cost, new_update1, new_update2) = evaluate_updates(&*metric, &samples, &header)?;
            let accepted = best.as_ref().map_or(true, |b| cost < b.cost);
            self.tracker.update(
                ProgressInfo::new(STAGE, level, iterations, cost)
                    .with_total_iterations(setting.max_iterations)
                    .with_accepted(accepted)
                    .with_step_size(step),
            );
            tracing::debug!(level, iteration = iterations, cost, accepted, "nonlinear iteration");
            if !accepted {
                store.discard();
                break;
            }

            let inverse1 = invert_displacement(&field1, Some(store.get(FieldSlot::MidToIm1)), &self.config.inversion);
            let inverse2 = invert_displacement(&field2, Some(store.get(FieldSlot::MidToIm2)), &self.config.inversion);
            store.stage(FieldSlot::Im1ToMid, field1);
            store.stage(FieldSlot::Im2ToMid, field2);
            store.stage(FieldSlot::MidToIm1, inverse1);
            store.stage(FieldSlot::MidToIm2, inverse2);
            store.stage(FieldSlot::Im1Update, new_update1);
            store.stage(FieldSlot::Im2Update, new_update2);
            for slot in FieldSlot::ALL {
                store.commit(slot);
            }
            best = Some(Accepted {
                cost,
                warped1: warped1.image,
                warped2: warped2.image,
            });
        }

        let best = best.ok_or_else(|| RegistrationError::optimizer("no nonlinear iteration was evaluated"))?;
        if let Some(sink) = &self.diagnostics {
            sink.level_complete(STAGE, level, &best.warped1.concat_volumes(&best.warped2));
        }
        tracing::info!(level, cost = best.cost, iterations, "nonlinear level finished");
        Ok(NonLinearLevelReport {
            scale,
            dims: header.dims(),
            cost: best.cost,
            iterations,
        })
    }
}

/// Mean cost over contributing voxels and the two raw update fields.
fn evaluate_updates(
    metric: &dyn UpdateMetric,
    samples: &MidwaySamples,
    header: &Header,
) -> Result<(f64, Image, Image)> {
    let mut update1 = zero_field(header);
    let mut update2 = zero_field(header);
    let (cost, count) = update1
        .data_mut()
        .par_chunks_mut(3)
        .zip(update2.data_mut().par_chunks_mut(3))
        .enumerate()
        .fold(
            || (0.0f64, 0usize),
            |(cost, count), (i, (u1, u2))| match metric.evaluate(i, samples) {
                Some(term) => {
                    for a in 0..3 {
                        u1[a] = term.update1[a] as f32;
                        u2[a] = term.update2[a] as f32;
                    }
                    (cost + term.cost, count + 1)
                }
                None => (cost, count),
            },
        )
        .reduce(|| (0.0, 0), |a, b| (a.0 + b.0, a.1 + b.1));
    if count == 0 {
        return Err(RegistrationError::degenerate_input(
            "images do not overlap in midway space",
        ));
    }
    Ok((cost / count as f64, update1, update2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_swaps_candidate_in() {
        let header = Header::unit([2, 2, 2]);
        let mut store = FieldStore::zeros(&header);
        let mut field = zero_field(&header);
        field.set_vector(0, &Vector3::new(1.0, 0.0, 0.0));
        store.stage(FieldSlot::Im2ToMid, field.clone());
        assert_eq!(store.get(FieldSlot::Im2ToMid).vector(0), Vector3::zeros());
        assert!(store.commit(FieldSlot::Im2ToMid));
        assert_eq!(store.get(FieldSlot::Im2ToMid), &field);
        assert!(store.candidate(FieldSlot::Im2ToMid).is_none());
        assert!(!store.commit(FieldSlot::Im2ToMid));
    }

    #[test]
    fn test_discard_leaves_active_untouched() {
        let header = Header::unit([2, 2, 2]);
        let mut store = FieldStore::zeros(&header);
        let mut field = zero_field(&header);
        field.set_vector(3, &Vector3::new(0.0, 2.0, 0.0));
        store.stage(FieldSlot::Im1Update, field);
        store.discard();
        assert!(!store.commit(FieldSlot::Im1Update));
        assert_eq!(store.get(FieldSlot::Im1Update).max_abs(), 0.0);
    }

    #[test]
    fn test_resample_changes_grid() {
        let header = Header::unit([8, 8, 8]);
        let mut store = FieldStore::zeros(&mireg_core::filter::scaled_header(&header, 0.5));
        store.resample(&header);
        assert_eq!(store.header().dims(), [8, 8, 8]);
        assert_eq!(store.get(FieldSlot::MidToIm2).nvols(), 3);
    }

    #[test]
    fn test_config_validation() {
        assert!(NonLinearConfig::default().validate().is_ok());
        assert!(NonLinearConfig::default().with_gradient_step(0.0).validate().is_err());
        assert!(NonLinearConfig::default()
            .with_max_iterations(vec![1, 2])
            .validate()
            .is_err());
    }
}

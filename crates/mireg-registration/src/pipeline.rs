//! End-to-end driver chaining initialisation, linear and non-linear stages.

use std::sync::Arc;

use burn::tensor::backend::Backend;
use mireg_core::image::Image;
use mireg_core::transform::{Transform, TransformKind};
use serde::{Deserialize, Serialize};

use crate::diagnostics::DiagnosticsSink;
use crate::error::{RegistrationError, Result, ResultExt};
use crate::initialiser::{InitConfig, InitialiserInput};
use crate::linear::{LinearConfig, LinearRegistration, LinearResult};
use crate::multi_contrast::{validate_contrasts, MultiContrastSetting};
use crate::nonlinear::{NonLinearConfig, NonLinearInit, NonLinearRegistration, NonLinearResult, WarpFields};
use crate::progress::ProgressTracker;
use crate::validation::{validate_image_pair, validate_mask};

/// Which stages a run performs, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RegistrationType {
    Rigid,
    #[default]
    Affine,
    NonLinear,
    RigidAffine,
    RigidNonLinear,
    AffineNonLinear,
    RigidAffineNonLinear,
}

impl RegistrationType {
    pub fn does_rigid(&self) -> bool {
        matches!(
            self,
            Self::Rigid | Self::RigidAffine | Self::RigidNonLinear | Self::RigidAffineNonLinear
        )
    }

    pub fn does_affine(&self) -> bool {
        matches!(
            self,
            Self::Affine | Self::RigidAffine | Self::AffineNonLinear | Self::RigidAffineNonLinear
        )
    }

    pub fn does_nonlinear(&self) -> bool {
        matches!(
            self,
            Self::NonLinear | Self::RigidNonLinear | Self::AffineNonLinear | Self::RigidAffineNonLinear
        )
    }
}

/// How the run obtains its starting point.
#[derive(Debug, Clone)]
pub enum PipelineInit {
    /// Estimate the transform with initialisers.
    Estimate(InitConfig),
    /// Start from a given transform (matrix and centre).
    Transform(Transform),
    /// Resume the non-linear stage from existing warps; linear stages are skipped.
    Warp(WarpFields),
}

impl Default for PipelineInit {
    fn default() -> Self {
        PipelineInit::Estimate(InitConfig::default())
    }
}

/// Settings of a whole run. Stage configurations left `None` use defaults.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub registration_type: RegistrationType,
    pub init: PipelineInit,
    pub rigid: Option<LinearConfig>,
    pub affine: Option<LinearConfig>,
    pub nonlinear: Option<NonLinearConfig>,
    /// Worker threads; `None` uses the global rayon pool.
    pub threads: Option<usize>,
}

impl PipelineConfig {
    pub fn new(registration_type: RegistrationType) -> Self {
        Self {
            registration_type,
            ..Self::default()
        }
    }

    pub fn with_init(mut self, init: PipelineInit) -> Self {
        self.init = init;
        self
    }

    pub fn with_rigid(mut self, config: LinearConfig) -> Self {
        self.rigid = Some(config);
        self
    }

    pub fn with_affine(mut self, config: LinearConfig) -> Self {
        self.affine = Some(config);
        self
    }

    pub fn with_nonlinear(mut self, config: NonLinearConfig) -> Self {
        self.nonlinear = Some(config);
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    fn rigid_config(&self) -> LinearConfig {
        self.rigid.clone().unwrap_or_else(LinearConfig::rigid)
    }

    fn affine_config(&self) -> LinearConfig {
        self.affine.clone().unwrap_or_else(LinearConfig::affine)
    }

    fn nonlinear_config(&self) -> NonLinearConfig {
        self.nonlinear.clone().unwrap_or_default()
    }

    /// Reject option combinations before any work starts.
    pub fn validate(&self) -> Result<()> {
        let t = self.registration_type;
        if self.rigid.is_some() && !t.does_rigid() {
            return Err(RegistrationError::invalid_configuration(format!(
                "rigid options given but registration type {:?} has no rigid stage",
                t
            )));
        }
        if self.affine.is_some() && !t.does_affine() {
            return Err(RegistrationError::invalid_configuration(format!(
                "affine options given but registration type {:?} has no affine stage",
                t
            )));
        }
        if self.nonlinear.is_some() && !t.does_nonlinear() {
            return Err(RegistrationError::invalid_configuration(format!(
                "nonlinear options given but registration type {:?} has no nonlinear stage",
                t
            )));
        }
        if matches!(self.init, PipelineInit::Warp(_)) && !t.does_nonlinear() {
            return Err(RegistrationError::invalid_configuration(
                "an initial warp requires a nonlinear stage",
            ));
        }
        if self.threads == Some(0) {
            return Err(RegistrationError::invalid_configuration("thread count must be positive"));
        }
        if t.does_rigid() {
            let rigid = self.rigid_config();
            if rigid.kind != TransformKind::Rigid {
                return Err(RegistrationError::invalid_configuration("rigid stage needs a rigid transform kind"));
            }
            rigid.validate().context("rigid configuration")?;
        }
        if t.does_affine() {
            let affine = self.affine_config();
            if affine.kind != TransformKind::Affine {
                return Err(RegistrationError::invalid_configuration(
                    "affine stage needs an affine transform kind",
                ));
            }
            affine.validate().context("affine configuration")?;
        }
        if t.does_nonlinear() {
            self.nonlinear_config().validate().context("nonlinear configuration")?;
        }
        if let PipelineInit::Estimate(init) = &self.init {
            init.validate().context("initialisation")?;
        }
        Ok(())
    }
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// Final linear transform (image1 to image2).
    pub transform: Transform,
    pub rigid: Option<LinearResult>,
    pub affine: Option<LinearResult>,
    pub nonlinear: Option<NonLinearResult>,
}

/// Registers image1 to image2 with the configured chain of stages.
pub struct RegistrationPipeline<B: Backend> {
    config: PipelineConfig,
    device: B::Device,
    tracker: ProgressTracker,
    diagnostics: Option<Arc<dyn DiagnosticsSink>>,
}

impl<B: Backend> RegistrationPipeline<B> {
    pub fn new(config: PipelineConfig, device: B::Device) -> Self {
        Self {
            config,
            device,
            tracker: ProgressTracker::logging(),
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

    /// Run every stage. An empty `contrasts` list treats all volumes as one
    /// scalar-weighted contrast.
    pub fn run(
        &self,
        image1: &Image,
        image2: &Image,
        mask1: Option<&Image>,
        mask2: Option<&Image>,
        contrasts: &[MultiContrastSetting],
    ) -> Result<PipelineResult> {
        self.config.validate()?;
        validate_image_pair(image1, image2)?;
        validate_mask("mask1", image1, mask1)?;
        validate_mask("mask2", image2, mask2)?;
        let contrasts = if contrasts.is_empty() {
            vec![MultiContrastSetting::scalar(image1.nvols())]
        } else {
            contrasts.to_vec()
        };
        validate_contrasts(&contrasts, image1.nvols())?;

        match self.config.threads {
            Some(n) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| RegistrationError::invalid_configuration(format!("thread pool: {}", e)))?;
                tracing::debug!(threads = n, "running on dedicated thread pool");
                pool.install(|| self.run_stages(image1, image2, mask1, mask2, &contrasts))
            }
            None => self.run_stages(image1, image2, mask1, mask2, &contrasts),
        }
    }

    fn run_stages(
        &self,
        image1: &Image,
        image2: &Image,
        mask1: Option<&Image>,
        mask2: Option<&Image>,
        contrasts: &[MultiContrastSetting],
    ) -> Result<PipelineResult> {
        let t = self.config.registration_type;
        tracing::info!(registration_type = ?t, "starting registration");

        let mut transform = match &self.config.init {
            PipelineInit::Transform(transform) => transform.clone(),
            PipelineInit::Estimate(init) => {
                let mut transform = Transform::identity(TransformKind::Affine);
                transform.set_centre_without_transform_update(image1.header().centre());
                let input = InitialiserInput::new(image1, image2, contrasts).with_masks(mask1, mask2);
                init.initialise::<B>(input, &mut transform, &self.device)
                    .context("initialisation")?;
                transform
            }
            PipelineInit::Warp(fields) => {
                let nonlinear = self
                    .nonlinear_stage()
                    .run(image1, image2, mask1, mask2, contrasts, &NonLinearInit::Warp(fields.clone()))
                    .context("nonlinear registration")?;
                return Ok(PipelineResult {
                    transform: combined_linear(&nonlinear.warps)?,
                    rigid: None,
                    affine: None,
                    nonlinear: Some(nonlinear),
                });
            }
        };

        let rigid = if t.does_rigid() {
            Some(self.linear_stage(self.config.rigid_config()).run(
                image1, image2, mask1, mask2, contrasts, &mut transform,
            )?)
        } else {
            None
        };
        let affine = if t.does_affine() {
            Some(self.linear_stage(self.config.affine_config()).run(
                image1, image2, mask1, mask2, contrasts, &mut transform,
            )?)
        } else {
            None
        };
        let nonlinear = if t.does_nonlinear() {
            Some(
                self.nonlinear_stage()
                    .run(image1, image2, mask1, mask2, contrasts, &NonLinearInit::Linear(transform.clone()))
                    .context("nonlinear registration")?,
            )
        } else {
            None
        };

        tracing::info!(matrix = ?transform.to_matrix4(), "registration finished");
        Ok(PipelineResult {
            transform,
            rigid,
            affine,
            nonlinear,
        })
    }

    fn linear_stage(&self, config: LinearConfig) -> LinearRegistration<B> {
        let stage = LinearRegistration::new(config, self.device.clone()).with_tracker(self.tracker.clone());
        match &self.diagnostics {
            Some(sink) => stage.with_diagnostics(sink.clone()),
            None => stage,
        }
    }

    fn nonlinear_stage(&self) -> NonLinearRegistration<B> {
        let stage =
            NonLinearRegistration::new(self.config.nonlinear_config(), self.device.clone()).with_tracker(self.tracker.clone());
        match &self.diagnostics {
            Some(sink) => stage.with_diagnostics(sink.clone()),
            None => stage,
        }
    }
}

/// Full linear transform implied by the two half transforms of a warp.
fn combined_linear(warps: &WarpFields) -> Result<Transform> {
    let pull2 = warps
        .linear2
        .inverse()
        .ok_or_else(|| RegistrationError::transform("image2 half transform is singular"))?;
    Ok(pull2.compose(&warps.linear1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_flags() {
        assert!(RegistrationType::RigidAffineNonLinear.does_rigid());
        assert!(RegistrationType::RigidAffineNonLinear.does_affine());
        assert!(RegistrationType::RigidAffineNonLinear.does_nonlinear());
        assert!(!RegistrationType::Affine.does_rigid());
        assert!(!RegistrationType::RigidNonLinear.does_affine());
        assert!(!RegistrationType::RigidAffine.does_nonlinear());
    }

    #[test]
    fn test_options_for_missing_stage_rejected() {
        let config = PipelineConfig::new(RegistrationType::Rigid).with_affine(LinearConfig::affine());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("affine options"));

        let config = PipelineConfig::new(RegistrationType::Affine).with_nonlinear(NonLinearConfig::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mismatched_stage_kind_rejected() {
        let config = PipelineConfig::new(RegistrationType::Rigid).with_rigid(LinearConfig::affine());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let config = PipelineConfig::new(RegistrationType::Affine).with_threads(0);
        assert!(config.validate().is_err());
        assert!(PipelineConfig::new(RegistrationType::RigidAffineNonLinear).validate().is_ok());
    }
}

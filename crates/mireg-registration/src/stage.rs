//! Per pyramid-level stage settings.

use serde::{Deserialize, Serialize};

use crate::error::{RegistrationError, Result};
use crate::validation::{
    validate_iterations, validate_level_count, validate_loop_density, validate_scale_factor,
};

/// Gradient-based optimiser used for one pass of a linear level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OptimiserKind {
    #[default]
    GradientDescent,
    BarzilaiBorwein,
}

/// Configuration of one pyramid level, ordered coarse to fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSetting {
    /// Resolution relative to the input, in (0, 1].
    pub scale_factor: f64,
    /// Optimiser passes run in sequence at this level.
    pub optimisers: Vec<OptimiserKind>,
    /// Iteration cap per optimiser pass.
    pub max_iterations: usize,
    /// Fraction of midway voxels visited by the cost sweep.
    pub loop_density: f64,
    /// Spherical-harmonic order used for FOD contrasts at this level.
    pub fod_lmax: usize,
}

impl StageSetting {
    pub fn new(scale_factor: f64, max_iterations: usize) -> Self {
        Self {
            scale_factor,
            optimisers: vec![OptimiserKind::GradientDescent],
            max_iterations,
            loop_density: 1.0,
            fod_lmax: 0,
        }
    }

    pub fn with_optimisers(mut self, optimisers: Vec<OptimiserKind>) -> Self {
        self.optimisers = optimisers;
        self
    }

    pub fn with_loop_density(mut self, density: f64) -> Self {
        self.loop_density = density;
        self
    }

    pub fn with_fod_lmax(mut self, lmax: usize) -> Self {
        self.fod_lmax = lmax;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_scale_factor(self.scale_factor)?;
        validate_iterations(self.max_iterations)?;
        validate_loop_density(self.loop_density)?;
        if self.optimisers.is_empty() {
            return Err(RegistrationError::invalid_configuration(
                "at least one optimiser is required per level",
            ));
        }
        if self.fod_lmax % 2 != 0 {
            return Err(RegistrationError::invalid_configuration(format!(
                "FOD lmax must be even, got {}",
                self.fod_lmax
            )));
        }
        Ok(())
    }
}

/// Expand per-level option vectors into stage settings.
///
/// Every vector must hold either one value (used for all levels) or one value
/// per scale factor.
pub fn build_stages(
    scale_factors: &[f64],
    max_iterations: &[usize],
    loop_density: &[f64],
    fod_lmax: &[usize],
    optimisers: &[OptimiserKind],
) -> Result<Vec<StageSetting>> {
    let n = scale_factors.len();
    if n == 0 {
        return Err(RegistrationError::invalid_configuration(
            "at least one scale factor is required",
        ));
    }
    fn per_level<T: Copy>(name: &str, values: &[T], n: usize) -> Result<Vec<T>> {
        if let [single] = values {
            return Ok(vec![*single; n]);
        }
        validate_level_count(name, values.len(), n)?;
        Ok(values.to_vec())
    }
    let iters = per_level("max iterations", max_iterations, n)?;
    let density = per_level("loop density", loop_density, n)?;
    let lmax = per_level("FOD lmax", fod_lmax, n)?;
    let opt = per_level("optimiser", optimisers, n)?;

    let stages: Vec<StageSetting> = (0..n)
        .map(|i| {
            StageSetting::new(scale_factors[i], iters[i])
                .with_loop_density(density[i])
                .with_fod_lmax(lmax[i])
                .with_optimisers(vec![opt[i]])
        })
        .collect();
    for s in &stages {
        s.validate()?;
    }
    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_stages_broadcasts_single_values() {
        let stages = build_stages(
            &[0.25, 0.5, 1.0],
            &[500],
            &[1.0],
            &[0, 2, 4],
            &[OptimiserKind::GradientDescent],
        )
        .unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[1].max_iterations, 500);
        assert_eq!(stages[2].fod_lmax, 4);
    }

    #[test]
    fn test_build_stages_rejects_length_mismatch() {
        let err = build_stages(&[0.5, 1.0], &[10, 20, 30], &[1.0], &[0], &[OptimiserKind::GradientDescent]);
        assert!(err.is_err());
        let msg = build_stages(&[0.5, 1.0], &[10], &[1.0], &[0], &[])
            .unwrap_err()
            .to_string();
        assert!(msg.contains("optimiser has 0 entries but there are 2 levels"), "{}", msg);
    }

    #[test]
    fn test_stage_validation() {
        assert!(StageSetting::new(1.5, 10).validate().is_err());
        assert!(StageSetting::new(0.0, 10).validate().is_err());
        assert!(StageSetting::new(0.5, 0).validate().is_err());
        assert!(StageSetting::new(0.5, 10).with_fod_lmax(3).validate().is_err());
        assert!(StageSetting::new(0.5, 10).with_loop_density(0.0).validate().is_err());
        assert!(StageSetting::new(0.5, 10).validate().is_ok());
    }
}

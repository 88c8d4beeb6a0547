//! Convergence test on the trajectories of a few control points.

use mireg_core::transform::Transform;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Settings for [`ControlPointConvergence`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    /// Distance of the control points from the centre, in voxels.
    pub distance_voxels: f64,
    /// Holt level smoothing factor.
    pub alpha: f64,
    /// Holt trend smoothing factor.
    pub beta: f64,
    /// Converged once every smoothed trend component is below this, in voxels.
    pub slope_threshold: f64,
    /// Minimum number of updates before convergence can be declared.
    pub min_iterations: usize,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            distance_voxels: 10.0,
            alpha: 0.7,
            beta: 0.1,
            slope_threshold: 1e-4,
            min_iterations: 10,
        }
    }
}

/// Tracks where four tetrahedrally arranged points land under the current
/// transform and declares convergence once their double-exponentially
/// smoothed motion has flattened out.
#[derive(Debug, Clone)]
pub struct ControlPointConvergence {
    points: Vec<Vector3<f64>>,
    config: ConvergenceConfig,
    threshold: f64,
    level: Vec<f64>,
    trend: Vec<f64>,
    updates: usize,
}

impl ControlPointConvergence {
    /// Control points around `centre`; `spacing` is the mean midway voxel size.
    pub fn new(centre: Vector3<f64>, spacing: f64, config: ConvergenceConfig) -> Self {
        let r = config.distance_voxels * spacing / 3f64.sqrt();
        let points = [
            Vector3::new(1.0, 1.0, 1.0),
            Vector3::new(1.0, -1.0, -1.0),
            Vector3::new(-1.0, 1.0, -1.0),
            Vector3::new(-1.0, -1.0, 1.0),
        ]
        .iter()
        .map(|d| centre + d * r)
        .collect();
        Self {
            points,
            config,
            threshold: config.slope_threshold * spacing,
            level: Vec::new(),
            trend: Vec::new(),
            updates: 0,
        }
    }

    pub fn control_points(&self) -> &[Vector3<f64>] {
        &self.points
    }

    /// Feed the transform after an accepted step; returns true once converged.
    pub fn update(&mut self, transform: &Transform) -> bool {
        let x: Vec<f64> = self
            .points
            .iter()
            .flat_map(|p| {
                let q = transform.apply(p);
                [q.x, q.y, q.z]
            })
            .collect();
        self.updates += 1;

        if self.level.is_empty() {
            self.trend = vec![0.0; x.len()];
            self.level = x;
            return false;
        }

        let (a, b) = (self.config.alpha, self.config.beta);
        for i in 0..x.len() {
            let previous = self.level[i];
            self.level[i] = a * x[i] + (1.0 - a) * (previous + self.trend[i]);
            self.trend[i] = b * (self.level[i] - previous) + (1.0 - b) * self.trend[i];
        }

        self.updates >= self.config.min_iterations
            && self.trend.iter().all(|t| t.abs() < self.threshold)
    }

    /// Largest smoothed slope component, in scanner units.
    pub fn max_slope(&self) -> f64 {
        self.trend.iter().fold(0.0f64, |m, t| m.max(t.abs()))
    }
}

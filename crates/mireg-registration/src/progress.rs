//! Progress tracking and callbacks for registration workflows.
//!
//! Stages report the start of every pyramid level and every cost evaluation
//! of the optimiser, including whether the evaluated step was accepted.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Progress information for registration iterations.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Stage name ("rigid", "affine", "nonlinear").
    pub stage: String,
    /// Pyramid level, coarsest first.
    pub level: usize,
    /// Current iteration number within the level.
    pub iteration: usize,
    /// Iteration cap of the level (if known).
    pub total_iterations: Option<usize>,
    /// Cost of the evaluated state.
    pub cost: f64,
    /// Whether the evaluated state was accepted by the optimiser.
    pub accepted: bool,
    /// Current step size.
    pub step_size: f64,
    /// Time elapsed since start.
    pub elapsed: Duration,
}

impl ProgressInfo {
    /// Create new progress information.
    pub fn new(stage: impl Into<String>, level: usize, iteration: usize, cost: f64) -> Self {
        Self {
            stage: stage.into(),
            level,
            iteration,
            total_iterations: None,
            cost,
            accepted: true,
            step_size: 0.0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn with_total_iterations(mut self, total: usize) -> Self {
        self.total_iterations = Some(total);
        self
    }

    pub fn with_accepted(mut self, accepted: bool) -> Self {
        self.accepted = accepted;
        self
    }

    pub fn with_step_size(mut self, step: f64) -> Self {
        self.step_size = step;
        self
    }

    /// Calculate progress percentage within the level.
    pub fn progress_percent(&self) -> Option<f64> {
        self.total_iterations
            .map(|total| (self.iteration as f64 / total.max(1) as f64) * 100.0)
    }
}

/// Progress callback trait for monitoring registration progress.
pub trait ProgressCallback: Send + Sync {
    /// Called at each cost evaluation with progress information.
    fn on_progress(&self, info: &ProgressInfo);

    /// Called when a stage starts.
    fn on_start(&self, _stage: &str) {}

    /// Called at the start of every pyramid level.
    fn on_level(&self, _stage: &str, _level: usize, _nlevels: usize, _scale: f64) {}

    /// Called when a stage completes successfully.
    fn on_complete(&self, _info: &ProgressInfo) {}

    /// Called when registration fails.
    fn on_error(&self, _error: &str) {}
}

/// Progress callback that logs to tracing.
#[derive(Debug, Clone)]
pub struct LoggingProgress {
    /// Log interval (iterations).
    pub log_interval: usize,
}

impl Default for LoggingProgress {
    fn default() -> Self {
        Self { log_interval: 10 }
    }
}

impl LoggingProgress {
    pub fn new(log_interval: usize) -> Self {
        Self {
            log_interval: log_interval.max(1),
        }
    }
}

impl ProgressCallback for LoggingProgress {
    fn on_progress(&self, info: &ProgressInfo) {
        if info.iteration % self.log_interval == 0 || info.total_iterations == Some(info.iteration) {
            tracing::debug!(
                "{} level {} iter {}/{} | cost: {:.6} | step: {:.3e} | {}",
                info.stage,
                info.level,
                info.iteration,
                info.total_iterations
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "?".to_string()),
                info.cost,
                info.step_size,
                if info.accepted { "accepted" } else { "rejected" }
            );
        }
    }

    fn on_start(&self, stage: &str) {
        tracing::info!("{} registration started", stage);
    }

    fn on_level(&self, stage: &str, level: usize, nlevels: usize, scale: f64) {
        tracing::info!("{} level {}/{} (scale {:.3})", stage, level + 1, nlevels, scale);
    }

    fn on_complete(&self, info: &ProgressInfo) {
        tracing::info!(
            "{} registration completed in {:.2}s with final cost: {:.6}",
            info.stage,
            info.elapsed.as_secs_f64(),
            info.cost
        );
    }

    fn on_error(&self, error: &str) {
        tracing::error!("Registration failed: {}", error);
    }
}

/// History callback that records all progress information.
#[derive(Debug, Clone)]
pub struct HistoryCallback {
    history: Arc<Mutex<Vec<ProgressInfo>>>,
}

impl HistoryCallback {
    pub fn new() -> Self {
        Self {
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Get the recorded history.
    pub fn get_history(&self) -> Vec<ProgressInfo> {
        self.history.lock().unwrap().clone()
    }

    /// Recorded entries of one stage and level, in order.
    pub fn level_history(&self, stage: &str, level: usize) -> Vec<ProgressInfo> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.stage == stage && i.level == level)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.history.lock().unwrap().clear();
    }
}

impl Default for HistoryCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCallback for HistoryCallback {
    fn on_progress(&self, info: &ProgressInfo) {
        self.history.lock().unwrap().push(info.clone());
    }
}

/// Progress tracker that fans out to multiple callbacks.
#[derive(Clone)]
pub struct ProgressTracker {
    callbacks: Vec<Arc<dyn ProgressCallback>>,
    start_time: Arc<Mutex<Option<Instant>>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self {
            callbacks: Vec::new(),
            start_time: Arc::new(Mutex::new(None)),
        }
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker with a single [`LoggingProgress`] callback.
    pub fn logging() -> Self {
        let mut tracker = Self::new();
        tracker.add_callback(Arc::new(LoggingProgress::default()));
        tracker
    }

    pub fn add_callback(&mut self, callback: Arc<dyn ProgressCallback>) {
        self.callbacks.push(callback);
    }

    pub fn with_callback(mut self, callback: Arc<dyn ProgressCallback>) -> Self {
        self.add_callback(callback);
        self
    }

    fn elapsed(&self) -> Duration {
        self.start_time
            .lock()
            .unwrap()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Start tracking a stage.
    pub fn start(&self, stage: &str) {
        *self.start_time.lock().unwrap() = Some(Instant::now());
        for callback in &self.callbacks {
            callback.on_start(stage);
        }
    }

    pub fn level(&self, stage: &str, level: usize, nlevels: usize, scale: f64) {
        for callback in &self.callbacks {
            callback.on_level(stage, level, nlevels, scale);
        }
    }

    /// Report one cost evaluation.
    pub fn update(&self, mut info: ProgressInfo) {
        info.elapsed = self.elapsed();
        for callback in &self.callbacks {
            callback.on_progress(&info);
        }
    }

    /// Complete tracking of a stage.
    pub fn complete(&self, stage: &str, final_cost: f64) {
        let mut info = ProgressInfo::new(stage, 0, 0, final_cost);
        info.elapsed = self.elapsed();
        for callback in &self.callbacks {
            callback.on_complete(&info);
        }
    }

    /// Report error.
    pub fn error(&self, error: &str) {
        for callback in &self.callbacks {
            callback.on_error(error);
        }
    }
}

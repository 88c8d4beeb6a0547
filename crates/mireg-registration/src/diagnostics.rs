//! Per-level inspection output.

use std::sync::{Arc, Mutex};

use mireg_core::image::Image;

/// Receives both images resampled into midway space after every level.
///
/// The pair is a single image: image1's volumes followed by image2's.
pub trait DiagnosticsSink: Send + Sync {
    fn level_complete(&self, stage: &str, level: usize, midway_pair: &Image);
}

/// One recorded level.
#[derive(Debug, Clone)]
pub struct DiagnosticsEntry {
    pub stage: String,
    pub level: usize,
    pub midway_pair: Image,
}

/// Keeps every pair in memory.
#[derive(Debug, Clone, Default)]
pub struct CollectingDiagnostics {
    entries: Arc<Mutex<Vec<DiagnosticsEntry>>>,
}

impl CollectingDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DiagnosticsEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl DiagnosticsSink for CollectingDiagnostics {
    fn level_complete(&self, stage: &str, level: usize, midway_pair: &Image) {
        tracing::debug!(stage, level, dims = ?midway_pair.header().dims(), "diagnostics pair recorded");
        self.entries.lock().unwrap().push(DiagnosticsEntry {
            stage: stage.to_string(),
            level,
            midway_pair: midway_pair.clone(),
        });
    }
}

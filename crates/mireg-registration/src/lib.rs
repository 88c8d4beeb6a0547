//! Multi-resolution image registration: initialisers, rigid and affine stages,
//! a symmetric diffeomorphic non-linear engine and FOD-aware resampling.

pub mod diagnostics;
pub mod error;
pub mod initialiser;
pub mod linear;
pub mod metric;
pub mod midway;
pub mod multi_contrast;
pub mod nonlinear;
pub mod optimizer;
pub mod pipeline;
pub mod progress;
pub mod reorient;
pub mod stage;
pub mod validation;
pub mod warp;

pub use diagnostics::{CollectingDiagnostics, DiagnosticsSink};
pub use error::{RegistrationError, Result, ResultExt};
pub use initialiser::{InitConfig, Initialiser, InitialiserInput, RotationInit, TranslationInit};
pub use linear::{LinearConfig, LinearRegistration, LinearResult};
pub use metric::{Estimator, LinearMetricKind, NonLinearMetricKind};
pub use multi_contrast::MultiContrastSetting;
pub use nonlinear::{NonLinearConfig, NonLinearInit, NonLinearRegistration, NonLinearResult, WarpFields};
pub use pipeline::{PipelineConfig, PipelineInit, PipelineResult, RegistrationPipeline, RegistrationType};
pub use progress::{HistoryCallback, LoggingProgress, ProgressCallback, ProgressInfo, ProgressTracker};
pub use reorient::FodReorientation;
pub use stage::{OptimiserKind, StageSetting};

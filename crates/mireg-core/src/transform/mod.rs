//! Geometric transform model.

pub mod linear;
pub mod matrix;

pub use linear::{Transform, TransformKind, DEFAULT_LINEAR_WEIGHT};

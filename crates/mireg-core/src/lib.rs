//! Core data types for multi-contrast image registration: spatial primitives,
//! images with scanner geometry, interpolation, burn-backed filtering, the
//! linear transform model and spherical-harmonic utilities.

pub mod directions;
pub mod filter;
pub mod image;
pub mod interpolation;
pub mod sh;
pub mod spatial;
pub mod transform;

pub use image::{Header, Image};
pub use spatial::{Direction, Point, Spacing, Vector};
pub use transform::{Transform, TransformKind};

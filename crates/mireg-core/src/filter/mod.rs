pub mod gaussian;
pub mod pyramid;
pub mod resample;

pub use gaussian::{Boundary, GaussianFilter, KernelWidth};
pub use pyramid::{downscale, scaled_header};
pub use resample::ResampleImageFilter;

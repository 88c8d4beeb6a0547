//! Images: geometry header plus a host-side voxel buffer.

pub mod header;
pub mod image;
mod tensor;

pub use header::Header;
pub use image::Image;

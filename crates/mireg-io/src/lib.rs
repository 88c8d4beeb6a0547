pub mod transform_file;
pub mod warp;

pub use transform_file::{format_transform, load_transform, parse_transform, save_transform};
pub use warp::{full_deformations, pack_warp_bundle, unpack_warp_bundle, WARP_TYPE};

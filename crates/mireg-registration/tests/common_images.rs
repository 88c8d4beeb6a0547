#![allow(dead_code)]

use mireg_core::image::{Header, Image};
use nalgebra::Vector3;

/// Sum of isotropic Gaussian blobs `(centre, sigma, amplitude)`.
pub fn blobs(header: &Header, blobs: &[([f64; 3], f64, f64)]) -> Image {
    let blobs = blobs.to_vec();
    Image::from_fn(header.clone(), move |p| {
        blobs
            .iter()
            .map(|(c, sigma, amplitude)| {
                let d = p - Vector3::new(c[0], c[1], c[2]);
                amplitude * (-d.norm_squared() / (2.0 * sigma * sigma)).exp()
            })
            .sum::<f64>() as f32
    })
}

pub fn mean_squared_difference(a: &Image, b: &Image) -> f64 {
    let n = a.data().len() as f64;
    a.data()
        .iter()
        .zip(b.data())
        .map(|(x, y)| ((x - y) as f64).powi(2))
        .sum::<f64>()
        / n
}

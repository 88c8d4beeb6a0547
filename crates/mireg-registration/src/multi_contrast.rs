//! Multi-contrast descriptors.
//!
//! Several image pairs can be registered jointly by concatenating their
//! volumes into one working image per side. Each [`MultiContrastSetting`]
//! records where one contrast lives inside that concatenation, its weight in
//! the cost, and (for FOD contrasts) the spherical-harmonic order in use.

use std::ops::Range;

use mireg_core::image::Image;
use mireg_core::sh;
use serde::{Deserialize, Serialize};

use crate::error::{RegistrationError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiContrastSetting {
    /// First volume of this contrast in the current working image.
    pub start: usize,
    /// Volumes of this contrast in the current working image.
    pub nvols: usize,
    /// Harmonic order in use at the current level (0 for scalar contrasts).
    pub lmax: usize,
    /// Harmonic order of the full-resolution input.
    pub image_lmax: usize,
    /// Whether the volumes are SH coefficients that must be reoriented.
    pub do_reorientation: bool,
    /// Weight of this contrast in the cost.
    pub weight: f64,
    image_start: usize,
    image_nvols: usize,
}

impl MultiContrastSetting {
    /// Describe a contrast occupying `nvols` volumes from `start` in the input image.
    ///
    /// With `do_reorientation` the volume count must be a complete even-order
    /// SH series; a single volume is treated as `lmax = 0` and never reoriented.
    pub fn new(start: usize, nvols: usize, do_reorientation: bool, weight: f64) -> Result<Self> {
        if nvols == 0 {
            return Err(RegistrationError::invalid_configuration(
                "contrast must have at least one volume",
            ));
        }
        if !(weight.is_finite() && weight >= 0.0) {
            return Err(RegistrationError::invalid_configuration(format!(
                "contrast weight must be finite and non-negative, got {}",
                weight
            )));
        }
        let do_reorientation = do_reorientation && nvols > 1;
        let image_lmax = if do_reorientation {
            let l = sh::l_for_n(nvols);
            if sh::n_for_l(l) != nvols {
                return Err(RegistrationError::invalid_configuration(format!(
                    "{} volumes is not a complete even-order spherical harmonic series",
                    nvols
                )));
            }
            l
        } else {
            0
        };
        Ok(Self {
            start,
            nvols,
            lmax: image_lmax,
            image_lmax,
            do_reorientation,
            weight,
            image_start: start,
            image_nvols: nvols,
        })
    }

    /// Scalar or plain multi-volume contrast spanning a whole image.
    pub fn scalar(nvols: usize) -> Self {
        Self {
            start: 0,
            nvols,
            lmax: 0,
            image_lmax: 0,
            do_reorientation: false,
            weight: 1.0,
            image_start: 0,
            image_nvols: nvols,
        }
    }

    /// Volume range of this contrast in the full-resolution input.
    pub fn image_range(&self) -> Range<usize> {
        self.image_start..self.image_start + self.nvols
    }

    /// Volume range of this contrast in the current working image.
    pub fn range(&self) -> Range<usize> {
        self.start..self.start + self.nvols
    }

    /// True if this contrast's volumes must be reoriented at the current order.
    pub fn reorients(&self) -> bool {
        self.do_reorientation && self.lmax > 0
    }
}

/// Truncate every reorientable contrast to `min(lmax, image_lmax)` and
/// recompute working-image offsets.
///
/// Orders are derived from each contrast's full-resolution order, so
/// successive levels can never raise a contrast above its input.
pub fn set_level_lmax(contrasts: &mut [MultiContrastSetting], lmax: usize) {
    let mut start = 0;
    for c in contrasts.iter_mut() {
        if c.do_reorientation {
            c.lmax = lmax.min(c.image_lmax) & !1;
            c.nvols = sh::n_for_l(c.lmax);
        } else {
            c.nvols = c.image_nvols;
        }
        c.start = start;
        start += c.nvols;
    }
}

/// Total volumes of the current working image.
pub fn total_volumes(contrasts: &[MultiContrastSetting]) -> usize {
    contrasts.iter().map(|c| c.nvols).sum()
}

/// Largest order in use across contrasts.
pub fn max_lmax(contrasts: &[MultiContrastSetting]) -> usize {
    contrasts
        .iter()
        .filter(|c| c.do_reorientation)
        .map(|c| c.lmax)
        .max()
        .unwrap_or(0)
}

/// Extract the level's working image (truncated SH series) from a full input.
pub fn select_level_volumes(image: &Image, contrasts: &[MultiContrastSetting]) -> Image {
    let ranges: Vec<Range<usize>> = contrasts.iter().map(|c| c.image_range()).collect();
    if ranges.len() == 1 && ranges[0] == (0..image.nvols()) {
        return image.clone();
    }
    image.select_volumes(&ranges)
}

/// Per-volume cost weights of the current working image.
pub fn volume_weights(contrasts: &[MultiContrastSetting]) -> Vec<f64> {
    contrasts
        .iter()
        .flat_map(|c| std::iter::repeat(c.weight).take(c.nvols))
        .collect()
}

/// Check that contrast ranges are contiguous and non-overlapping and fit the image.
pub fn validate_contrasts(contrasts: &[MultiContrastSetting], image_nvols: usize) -> Result<()> {
    if contrasts.is_empty() {
        return Err(RegistrationError::invalid_configuration("no contrasts given"));
    }
    let mut next = 0;
    for (i, c) in contrasts.iter().enumerate() {
        if c.image_start < next {
            return Err(RegistrationError::invalid_configuration(format!(
                "contrast {} starts at volume {} which overlaps the previous contrast",
                i, c.image_start
            )));
        }
        next = c.image_start + c.image_nvols;
    }
    if next > image_nvols {
        return Err(RegistrationError::dimension_mismatch(format!(
            "contrasts need {} volumes but image has {}",
            next, image_nvols
        )));
    }
    Ok(())
}

/// Concatenate contrast pairs into two working images and describe them.
///
/// `weights` must be empty (all 1.0) or hold one weight per pair. Each pair
/// must have the same number of volumes in both images.
pub fn concatenate(
    pairs: &[(Image, Image)],
    reorient: &[bool],
    weights: &[f64],
) -> Result<(Image, Image, Vec<MultiContrastSetting>)> {
    if pairs.is_empty() {
        return Err(RegistrationError::invalid_configuration("no image pairs given"));
    }
    if !weights.is_empty() && weights.len() != pairs.len() {
        return Err(RegistrationError::invalid_configuration(format!(
            "{} contrast weights given for {} contrasts",
            weights.len(),
            pairs.len()
        )));
    }
    let mut contrasts = Vec::with_capacity(pairs.len());
    let mut start = 0;
    for (i, (a, b)) in pairs.iter().enumerate() {
        if a.nvols() != b.nvols() {
            return Err(RegistrationError::dimension_mismatch(format!(
                "contrast {}: image1 has {} volumes, image2 has {}",
                i,
                a.nvols(),
                b.nvols()
            )));
        }
        if i > 0 && !a.header().same_grid(pairs[0].0.header()) {
            return Err(RegistrationError::image_validation(format!(
                "contrast {} of image1 is not on the grid of contrast 0",
                i
            )));
        }
        if i > 0 && !b.header().same_grid(pairs[0].1.header()) {
            return Err(RegistrationError::image_validation(format!(
                "contrast {} of image2 is not on the grid of contrast 0",
                i
            )));
        }
        let weight = weights.get(i).copied().unwrap_or(1.0);
        let flag = reorient.get(i).copied().unwrap_or(false);
        contrasts.push(MultiContrastSetting::new(start, a.nvols(), flag, weight)?);
        start += a.nvols();
    }

    let (mut im1, mut im2) = pairs[0].clone();
    for (a, b) in &pairs[1..] {
        im1 = im1.concat_volumes(a);
        im2 = im2.concat_volumes(b);
    }
    Ok((im1, im2, contrasts))
}

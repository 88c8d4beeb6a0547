//! Validation utilities for registration configuration.
//!
//! Every check runs before any optimisation starts so that a bad option
//! combination is reported once, with a descriptive message.

use mireg_core::image::Image;

use crate::error::{RegistrationError, Result};

/// Validate a pyramid scale factor, which must lie in (0, 1].
pub fn validate_scale_factor(scale: f64) -> Result<()> {
    if !(scale > 0.0 && scale <= 1.0) {
        return Err(RegistrationError::invalid_configuration(format!(
            "scale factor must be in (0, 1], got {}",
            scale
        )));
    }
    Ok(())
}

/// Validate iteration count.
pub fn validate_iterations(iterations: usize) -> Result<()> {
    if iterations == 0 {
        return Err(RegistrationError::invalid_configuration(
            "Iterations must be positive",
        ));
    }

    if iterations > 1_000_000 {
        return Err(RegistrationError::invalid_configuration(format!(
            "Iterations too large: {}",
            iterations
        )));
    }

    Ok(())
}

/// Validate the fraction of voxels visited per cost sweep.
pub fn validate_loop_density(density: f64) -> Result<()> {
    if !(density > 0.0 && density <= 1.0) {
        return Err(RegistrationError::invalid_configuration(format!(
            "loop density must be in (0, 1], got {}",
            density
        )));
    }
    Ok(())
}

/// Validate a positive, finite step or smoothing width.
pub fn validate_positive(name: &str, value: f64) -> Result<()> {
    if !(value.is_finite() && value > 0.0) {
        return Err(RegistrationError::invalid_configuration(format!(
            "{} must be positive, got {}",
            name, value
        )));
    }
    Ok(())
}

/// Validate that a smoothing FWHM is finite and non-negative (0 disables it).
pub fn validate_fwhm(name: &str, value: f64) -> Result<()> {
    if !(value.is_finite() && value >= 0.0) {
        return Err(RegistrationError::invalid_configuration(format!(
            "{} must be non-negative, got {}",
            name, value
        )));
    }
    Ok(())
}

/// Validate that a per-level vector matches the number of levels.
pub fn validate_level_count(name: &str, len: usize, levels: usize) -> Result<()> {
    if len != levels {
        return Err(RegistrationError::invalid_configuration(format!(
            "{} has {} entries but there are {} levels",
            name, len, levels
        )));
    }
    Ok(())
}

/// Validate that two images can be registered together.
pub fn validate_image_pair(image1: &Image, image2: &Image) -> Result<()> {
    if image1.nvols() != image2.nvols() {
        return Err(RegistrationError::dimension_mismatch(format!(
            "image1 has {} volumes, image2 has {}",
            image1.nvols(),
            image2.nvols()
        )));
    }
    for (name, img) in [("image1", image1), ("image2", image2)] {
        if img.header().nvoxels() == 0 {
            return Err(RegistrationError::image_validation(format!("{} is empty", name)));
        }
        if img.header().scanner_to_voxel().is_none() {
            return Err(RegistrationError::image_validation(format!(
                "{} has a singular voxel-to-scanner matrix",
                name
            )));
        }
        if img.data().iter().any(|v| !v.is_finite()) {
            return Err(RegistrationError::image_validation(format!(
                "{} contains non-finite values",
                name
            )));
        }
    }
    Ok(())
}

/// Validate that a mask lies on its image's grid.
pub fn validate_mask(name: &str, image: &Image, mask: Option<&Image>) -> Result<()> {
    if let Some(mask) = mask {
        if !mask.header().same_grid(image.header()) {
            return Err(RegistrationError::ShapeMismatch {
                expected: image.header().dims().to_vec(),
                actual: mask.header().dims().to_vec(),
            }
            .with_context(format!("{} is not on its image's grid", name)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mireg_core::image::Header;
    use mireg_core::spatial::{Direction3, Point3, Spacing3};

    #[test]
    fn test_validate_scale_factor() {
        assert!(validate_scale_factor(0.25).is_ok());
        assert!(validate_scale_factor(1.0).is_ok());
        assert!(validate_scale_factor(0.0).is_err());
        assert!(validate_scale_factor(1.01).is_err());
        assert!(validate_scale_factor(f64::NAN).is_err());
    }

    #[test]
    fn test_validate_iterations() {
        assert!(validate_iterations(100).is_ok());
        assert!(validate_iterations(0).is_err());
        assert!(validate_iterations(2_000_000).is_err());
    }

    #[test]
    fn test_validate_image_pair() {
        let a = Image::zeros(Header::unit([2, 2, 2]));
        let b = Image::zeros(Header::unit([3, 3, 3]).with_volumes(2));
        assert!(validate_image_pair(&a, &a).is_ok());
        assert!(validate_image_pair(&a, &b).is_err());

        let flat = Header::new(
            [2, 2, 2],
            Point3::origin(),
            Spacing3::new([1.0, 0.0, 1.0]),
            Direction3::identity(),
        );
        let c = Image::zeros(flat);
        let err = validate_image_pair(&c, &a).unwrap_err().to_string();
        assert!(err.contains("singular"), "{}", err);
    }

    #[test]
    fn test_validate_mask_grid() {
        let a = Image::zeros(Header::unit([2, 2, 2]));
        let m = Image::zeros(Header::unit([3, 2, 2]));
        assert!(validate_mask("mask1", &a, Some(&a)).is_ok());
        assert!(validate_mask("mask1", &a, Some(&m)).is_err());
        assert!(validate_mask("mask1", &a, None).is_ok());
    }
}

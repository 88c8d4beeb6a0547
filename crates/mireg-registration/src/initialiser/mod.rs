//! Transform initialisation strategies.
//!
//! Initialisers run once on the full-resolution inputs before the first
//! linear level. Translation is set from the centres of mass or the grid
//! centres; rotation from principal axes or a brute-force search.

pub mod centre_of_mass;
pub mod moments;
pub mod rotation_search;

pub use centre_of_mass::{centre_of_mass, CentreOfMass, GeometricCentre};
pub use moments::Moments;
pub use rotation_search::{RotationSearch, RotationSearchConfig, SearchMode, SearchResult};

use burn::tensor::backend::Backend;
use mireg_core::image::{Header, Image};
use mireg_core::transform::Transform;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::multi_contrast::MultiContrastSetting;

/// Voxels per parallel chunk in deterministic reductions.
pub(crate) const REDUCTION_CHUNK: usize = 4096;

/// A strategy that writes an initial estimate into a transform.
pub trait Initialiser {
    fn initialise(&self, input: &InitialiserInput<'_>, transform: &mut Transform) -> Result<()>;
}

/// Images, masks and contrast layout an initialiser reads.
#[derive(Debug, Clone, Copy)]
pub struct InitialiserInput<'a> {
    pub image1: &'a Image,
    pub image2: &'a Image,
    pub mask1: Option<&'a Image>,
    pub mask2: Option<&'a Image>,
    pub contrasts: &'a [MultiContrastSetting],
}

impl<'a> InitialiserInput<'a> {
    pub fn new(image1: &'a Image, image2: &'a Image, contrasts: &'a [MultiContrastSetting]) -> Self {
        Self {
            image1,
            image2,
            mask1: None,
            mask2: None,
            contrasts,
        }
    }

    pub fn with_masks(mut self, mask1: Option<&'a Image>, mask2: Option<&'a Image>) -> Self {
        self.mask1 = mask1;
        self.mask2 = mask2;
        self
    }

    /// Drop either mask.
    pub fn unmasked(mut self, ignore_mask1: bool, ignore_mask2: bool) -> Self {
        if ignore_mask1 {
            self.mask1 = None;
        }
        if ignore_mask2 {
            self.mask2 = None;
        }
        self
    }
}

/// How the initial translation is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TranslationInit {
    /// Align the intensity centres of mass.
    #[default]
    CentreOfMass,
    /// Align the centres of the voxel grids.
    Geometric,
    None,
}

/// How the initial rotation is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RotationInit {
    /// Align the principal axes of the second moments.
    Moments,
    /// Evaluate many candidate rotations at low resolution.
    Search,
    #[default]
    None,
}

/// Initialisation settings for a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitConfig {
    pub translation: TranslationInit,
    pub rotation: RotationInit,
    pub search: RotationSearchConfig,
    /// Ignore image1's mask during initialisation.
    pub mask1_unmasked: bool,
    /// Ignore image2's mask during initialisation.
    pub mask2_unmasked: bool,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            translation: TranslationInit::CentreOfMass,
            rotation: RotationInit::None,
            search: RotationSearchConfig::default(),
            mask1_unmasked: false,
            mask2_unmasked: false,
        }
    }
}

impl InitConfig {
    pub fn with_translation(mut self, translation: TranslationInit) -> Self {
        self.translation = translation;
        self
    }

    pub fn with_rotation(mut self, rotation: RotationInit) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_search(mut self, search: RotationSearchConfig) -> Self {
        self.search = search;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.search.validate()
    }

    /// Run the configured strategies, translation first.
    ///
    /// Moments set both rotation and translation; search refines the rotation
    /// about whatever translation is already in place.
    pub fn initialise<B: Backend>(
        &self,
        input: InitialiserInput<'_>,
        transform: &mut Transform,
        device: &B::Device,
    ) -> Result<()> {
        let input = input.unmasked(self.mask1_unmasked, self.mask2_unmasked);
        match self.translation {
            TranslationInit::CentreOfMass => CentreOfMass.initialise(&input, transform)?,
            TranslationInit::Geometric => GeometricCentre.initialise(&input, transform)?,
            TranslationInit::None => {}
        }
        match self.rotation {
            RotationInit::Moments => Moments.initialise(&input, transform)?,
            RotationInit::Search => {
                RotationSearch::<B>::new(self.search.clone(), device.clone()).run(&input, transform)?;
            }
            RotationInit::None => {}
        }
        tracing::info!(
            translation = ?self.translation,
            rotation = ?self.rotation,
            matrix = ?transform.to_matrix4(),
            "initialised transform"
        );
        Ok(())
    }
}

/// True if voxel `index` lies inside `mask` (or there is no mask).
#[inline]
pub(crate) fn in_mask(mask: Option<&Image>, index: usize) -> bool {
    mask.map_or(true, |m| m.voxel(index)[0] > 0.5)
}

/// Contrast-weighted intensity of one voxel: Σ weight × first volume.
#[inline]
pub(crate) fn weighted_intensity(image: &Image, contrasts: &[MultiContrastSetting], index: usize) -> f64 {
    let voxel = image.voxel(index);
    if contrasts.is_empty() {
        return voxel[0] as f64;
    }
    contrasts
        .iter()
        .map(|c| c.weight * voxel[c.image_range().start] as f64)
        .sum()
}

/// Scalar image of contrast-weighted intensities.
pub(crate) fn intensity_image(image: &Image, contrasts: &[MultiContrastSetting]) -> Image {
    let header: Header = image.header().clone().with_volumes(1);
    let data = (0..header.nvoxels())
        .into_par_iter()
        .map(|i| weighted_intensity(image, contrasts, i) as f32)
        .collect();
    Image::from_data(header, data)
}

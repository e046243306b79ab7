//! Intensity augmentation producing the paired view used by mixup training

use candle_core::Tensor;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::training::uncertainty::rescale_per_sample;

/// Random gamma / contrast / brightness transform
///
/// The image is first min-max normalised, then mapped through
/// `x^gamma * contrast + shift`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntensityAugment {
    /// Gamma range
    pub gamma: (f64, f64),
    /// Multiplicative contrast range
    pub contrast: (f64, f64),
    /// Additive shift range
    pub shift: (f64, f64),
}

impl Default for IntensityAugment {
    fn default() -> Self {
        Self {
            gamma: (0.7, 1.5),
            contrast: (0.8, 1.2),
            shift: (-0.1, 0.1),
        }
    }
}

impl IntensityAugment {
    /// Check that every range is ordered and gamma stays positive
    pub fn validate(&self) -> Result<()> {
        for (name, (lo, hi)) in [
            ("gamma", self.gamma),
            ("contrast", self.contrast),
            ("shift", self.shift),
        ] {
            if !(lo <= hi) {
                return Err(Error::config(format!("augment {name} range is not ordered")));
            }
        }
        if self.gamma.0 <= 0.0 {
            return Err(Error::config("augment gamma must be positive"));
        }
        Ok(())
    }

    /// Augment a single `[C, H, W]` image
    pub fn apply<R: Rng + ?Sized>(&self, image: &Tensor, rng: &mut R) -> Result<Tensor> {
        let gamma = sample_range(rng, self.gamma);
        let contrast = sample_range(rng, self.contrast);
        let shift = sample_range(rng, self.shift);

        let normalised = rescale_per_sample(&image.unsqueeze(0)?)?.squeeze(0)?;
        Ok(normalised.powf(gamma)?.affine(contrast, shift)?)
    }
}

fn sample_range<R: Rng + ?Sized>(rng: &mut R, (lo, hi): (f64, f64)) -> f64 {
    if hi > lo {
        rng.random_range(lo..hi)
    } else {
        lo
    }
}

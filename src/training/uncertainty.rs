//! Predictive uncertainty maps and the uncertainty-guided blend between
//! the clean and augmented views.
//!
//! All maps are `[N, 1, H, W]` tensors on the device of the logits they were
//! computed from. Nothing here is attached to the autodiff graph except the
//! augmented image inside [`mix_inputs`].

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Per-pixel entropy of the class distribution, `-mean_c(p * log2 p)`
///
/// Returns `[N, 1, H, W]` without rescaling. Zero probabilities contribute 0.
pub fn entropy_map(logits: &Tensor) -> Result<Tensor> {
    let proba = candle_nn::ops::softmax(&logits.detach(), 1)?;
    let log2 = proba
        .maximum(f32::MIN_POSITIVE as f64)?
        .log()?
        .affine(std::f64::consts::LOG2_E, 0.0)?;
    Ok((proba * log2)?.mean_keepdim(1)?.neg()?)
}

/// Entropy map rescaled to `[0, 1]` per sample
pub fn uncertainty_map(logits: &Tensor) -> Result<Tensor> {
    rescale_per_sample(&entropy_map(logits)?)
}

/// Min-max rescale of every sample over all non-batch dimensions
///
/// A constant sample maps to all zeros.
pub fn rescale_per_sample(x: &Tensor) -> Result<Tensor> {
    let shape = x.shape().clone();
    let flat = x.flatten_from(1)?;
    let min = flat.min_keepdim(1)?;
    let max = flat.max_keepdim(1)?;
    let range = (&max - &min)?;
    let safe_range = (&range + range.eq(0.0)?.to_dtype(range.dtype())?)?;
    let scaled = flat.broadcast_sub(&min)?.broadcast_div(&safe_range)?;
    Ok(scaled.reshape(shape)?)
}

/// Separable Gaussian blur with reflect padding
#[derive(Debug, Clone)]
pub struct GaussianBlur {
    kernel_size: usize,
    sigma: f64,
    weights: Vec<f32>,
}

impl GaussianBlur {
    /// Create a blur with an odd `kernel_size` and positive `sigma`
    pub fn new(kernel_size: usize, sigma: f64) -> Result<Self> {
        if kernel_size == 0 || kernel_size % 2 == 0 {
            return Err(Error::config(format!(
                "blur kernel size must be odd and positive, got {kernel_size}"
            )));
        }
        if !(sigma > 0.0) {
            return Err(Error::config(format!("blur sigma must be positive, got {sigma}")));
        }

        Ok(Self {
            kernel_size,
            sigma,
            weights: gaussian_weights(kernel_size, sigma),
        })
    }

    /// Kernel side length
    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// Standard deviation in pixels
    pub fn sigma(&self) -> f64 {
        self.sigma
    }

    /// Blur every channel of an `[N, C, H, W]` tensor independently
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (n, c, h, w) = x.dims4()?;
        let device = x.device();
        let half = self.kernel_size / 2;

        let planes = x.to_dtype(DType::F32)?.reshape((n * c, 1, h, w))?;
        let padded = reflect_pad(&reflect_pad(&planes, 2, half)?, 3, half)?;

        let kernel = Tensor::from_slice(&self.weights, self.kernel_size, device)?;
        let horizontal = kernel.reshape((1, 1, 1, self.kernel_size))?;
        let vertical = kernel.reshape((1, 1, self.kernel_size, 1))?;

        let blurred = padded.conv2d(&horizontal, 0, 1, 1, 1)?.conv2d(&vertical, 0, 1, 1, 1)?;
        Ok(blurred.reshape((n, c, h, w))?.to_dtype(x.dtype())?)
    }
}

impl Default for GaussianBlur {
    fn default() -> Self {
        Self {
            kernel_size: 29,
            sigma: 10.0,
            weights: gaussian_weights(29, 10.0),
        }
    }
}

fn gaussian_weights(kernel_size: usize, sigma: f64) -> Vec<f32> {
    let half = (kernel_size / 2) as f64;
    let raw: Vec<f64> = (0..kernel_size)
        .map(|i| {
            let x = (i as f64 - half) / sigma;
            (-0.5 * x * x).exp()
        })
        .collect();
    let total: f64 = raw.iter().sum();
    raw.iter().map(|w| (w / total) as f32).collect()
}

/// Pad `dim` by `pad` on both sides, mirroring without repeating the edge
///
/// Padding wider than the input folds back and forth across it.
fn reflect_pad(x: &Tensor, dim: usize, pad: usize) -> Result<Tensor> {
    let len = x.dim(dim)?;
    let period = 2 * len.saturating_sub(1);
    let indices: Vec<u32> = (0..len + 2 * pad)
        .map(|i| {
            if period == 0 {
                return 0;
            }
            let folded = (i as i64 - pad as i64).rem_euclid(period as i64) as usize;
            let index = if folded >= len { period - folded } else { folded };
            index as u32
        })
        .collect();
    let indices = Tensor::from_vec(indices, len + 2 * pad, x.device())?;
    Ok(x.index_select(&indices, dim)?)
}

/// Combine the clean and augmented uncertainty maps into the blend mask
///
/// `UG = rescale(blur((mean(u_c, u_a) + max(u_c, u_a)) / 2))`
pub fn fuse_guidance(u_clean: &Tensor, u_aug: &Tensor, blur: &GaussianBlur) -> Result<Tensor> {
    let mean = ((u_clean + u_aug)? * 0.5)?;
    let max = u_clean.maximum(u_aug)?;
    let combined = ((mean + max)? * 0.5)?;
    rescale_per_sample(&blur.forward(&combined)?)
}

/// Mean of the blend mask over foreground pixels
///
/// Labels `>= 1` count as foreground. Returns `None` when the batch has no
/// foreground pixel.
pub fn coverage_ratio(labels: &Tensor, guidance: &Tensor) -> Result<Option<f64>> {
    let foreground = labels.ge(1u32)?.to_dtype(DType::F32)?;
    let count = foreground.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Ok(None);
    }
    let guidance = guidance.squeeze(1)?.to_dtype(DType::F32)?;
    let covered = (foreground * guidance)?.sum_all()?.to_scalar::<f32>()?;
    Ok(Some((covered / count) as f64))
}

/// How to treat batches whose labels contain no foreground
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroForegroundPolicy {
    /// Use the sum branch and record no coverage
    #[default]
    ForceSum,
    /// Record NaN coverage, which compares false and lands in the sum branch
    Propagate,
}

/// Which input the mixed branch is built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MixDecision {
    /// `clean.detach() * UG + aug * (1 - UG)`
    Blend,
    /// `clean + aug`
    Sum,
}

/// Blend decision for one batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverageDecision {
    /// Chosen mix
    pub decision: MixDecision,
    /// Coverage that drove it, `None` under [`ZeroForegroundPolicy::ForceSum`]
    /// when there is no foreground
    pub coverage: Option<f64>,
}

/// Pick blend or sum from the foreground coverage
pub fn decide_mix(
    coverage: Option<f64>,
    threshold: f64,
    policy: ZeroForegroundPolicy,
) -> CoverageDecision {
    match coverage {
        Some(value) if value < threshold => CoverageDecision {
            decision: MixDecision::Blend,
            coverage,
        },
        Some(_) => CoverageDecision {
            decision: MixDecision::Sum,
            coverage,
        },
        None => {
            warn!("Batch has no foreground pixels; using the sum mix ({policy:?})");
            CoverageDecision {
                decision: MixDecision::Sum,
                coverage: match policy {
                    ZeroForegroundPolicy::ForceSum => None,
                    ZeroForegroundPolicy::Propagate => Some(f64::NAN),
                },
            }
        }
    }
}

/// Build the mixed-branch input
///
/// `guidance` is `[N, 1, H, W]` and broadcasts over image channels.
pub fn mix_inputs(
    clean: &Tensor,
    aug: &Tensor,
    guidance: &Tensor,
    decision: MixDecision,
) -> Result<Tensor> {
    match decision {
        MixDecision::Blend => {
            let guidance = guidance.detach().to_dtype(clean.dtype())?;
            let inverse = guidance.affine(-1.0, 1.0)?;
            let anchored = clean.detach().broadcast_mul(&guidance)?;
            Ok((anchored + aug.broadcast_mul(&inverse)?)?)
        }
        MixDecision::Sum => Ok((clean + aug)?),
    }
}

/// Argmax class map `[N, H, W]` of `[N, K, H, W]` logits
pub fn predicted_classes(logits: &Tensor) -> Result<Tensor> {
    Ok(logits.detach().argmax(1)?)
}

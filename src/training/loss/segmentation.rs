//! Pixel cross entropy plus soft Dice

use candle_core::{DType, Tensor};
use candle_nn::encoding::one_hot;

use super::{Criterion, LossDict, WeightTable};
use crate::error::Result;
use crate::training::config::LossConfig;

/// Criterion producing `loss_ce` and `loss_dice`
#[derive(Debug, Clone)]
pub struct SegmentationCriterion {
    weights: WeightTable,
    smooth: f64,
}

impl SegmentationCriterion {
    /// Create a criterion from the loss configuration
    pub fn new(config: &LossConfig) -> Self {
        Self {
            weights: config.weights.clone(),
            smooth: config.dice_smooth,
        }
    }

    /// Mean cross entropy over every pixel
    pub fn cross_entropy(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (n, k, h, w) = logits.dims4()?;
        let flat_logits = logits.permute((0, 2, 3, 1))?.reshape((n * h * w, k))?;
        let flat_labels = labels.to_dtype(DType::U32)?.flatten_all()?;
        Ok(candle_nn::loss::cross_entropy(&flat_logits, &flat_labels)?)
    }

    /// `1 - mean_c(2|P∩G| / (|P| + |G|))` on softmax probabilities
    pub fn soft_dice(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (_, k, _, _) = logits.dims4()?;
        let proba = candle_nn::ops::softmax(logits, 1)?;
        let target = one_hot(labels.to_dtype(DType::U32)?, k, 1f32, 0f32)?
            .permute((0, 3, 1, 2))?
            .to_dtype(proba.dtype())?;

        let intersection = (&proba * &target)?.sum((0, 2, 3))?;
        let cardinality = (proba.sum((0, 2, 3))? + target.sum((0, 2, 3))?)?;
        let dice = ((intersection * 2.0)? + self.smooth)?.div(&(cardinality + self.smooth)?)?;
        Ok(dice.mean_all()?.affine(-1.0, 1.0)?)
    }
}

impl Criterion for SegmentationCriterion {
    fn get_loss(&self, logits: &Tensor, labels: &Tensor) -> Result<LossDict> {
        let mut losses = LossDict::new();
        losses.insert("loss_ce".to_string(), self.cross_entropy(logits, labels)?);
        losses.insert("loss_dice".to_string(), self.soft_dice(logits, labels)?);
        Ok(losses)
    }

    fn weight_dict(&self) -> &WeightTable {
        &self.weights
    }
}

//! Loss dictionaries and their weighted reduction
//!
//! A criterion returns named scalar losses ([`LossDict`]) plus a weight
//! table ([`WeightTable`]). Runners reduce them in one of two ways:
//!
//! - [`weighted_sum_strict`]: every loss must be weighted; used by warmup and
//!   the standard epoch runner.
//! - [`weighted_sum_filtered`]: losses without a weight are skipped; used by
//!   the mixup runner.

pub mod segmentation;

pub use segmentation::SegmentationCriterion;

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Named scalar losses, ordered by name
pub type LossDict = BTreeMap<String, Tensor>;

/// Weight per loss name
pub type WeightTable = BTreeMap<String, f64>;

/// Something that scores logits against labels
pub trait Criterion: Send + Sync {
    /// Named losses for `[N, K, H, W]` logits and `[N, H, W]` labels
    fn get_loss(&self, logits: &Tensor, labels: &Tensor) -> Result<LossDict>;

    /// Weight table applied to [`Criterion::get_loss`] output
    fn weight_dict(&self) -> &WeightTable;
}

/// `Σ L[k]·W[k]` over every loss, failing on an unweighted key
pub fn weighted_sum_strict(losses: &LossDict, weights: &WeightTable, device: &Device) -> Result<Tensor> {
    let mut total = Tensor::zeros((), DType::F32, device)?;
    for (key, loss) in losses {
        let weight = weights.get(key).ok_or_else(|| Error::missing_weight(key))?;
        total = (total + weighted(loss, *weight)?)?;
    }
    Ok(total)
}

/// `Σ L[k]·W[k]` over keys present in both maps
pub fn weighted_sum_filtered(losses: &LossDict, weights: &WeightTable, device: &Device) -> Result<Tensor> {
    let mut total = Tensor::zeros((), DType::F32, device)?;
    for (key, loss) in losses {
        if let Some(weight) = weights.get(key) {
            total = (total + weighted(loss, *weight)?)?;
        }
    }
    Ok(total)
}

fn weighted(loss: &Tensor, weight: f64) -> Result<Tensor> {
    Ok(loss.to_dtype(DType::F32)?.reshape(())?.affine(weight, 0.0)?)
}

/// Host values of a loss dictionary
pub fn loss_values(losses: &LossDict) -> Result<BTreeMap<String, f64>> {
    losses
        .iter()
        .map(|(key, loss)| Ok((key.clone(), scalar(loss)?)))
        .collect()
}

/// Host value of a scalar tensor
pub fn scalar(tensor: &Tensor) -> Result<f64> {
    Ok(tensor.to_dtype(DType::F64)?.reshape(())?.to_scalar::<f64>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn losses(pairs: &[(&str, f32)]) -> LossDict {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Tensor::new(*v, &Device::Cpu).unwrap()))
            .collect()
    }

    fn weights(pairs: &[(&str, f64)]) -> WeightTable {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_strict_sum() {
        let total = weighted_sum_strict(
            &losses(&[("loss_ce", 2.0), ("loss_dice", 0.5)]),
            &weights(&[("loss_ce", 1.0), ("loss_dice", 4.0)]),
            &Device::Cpu,
        )
        .unwrap();
        assert_relative_eq!(scalar(&total).unwrap(), 4.0, epsilon = 1e-6);
    }

    #[test]
    fn test_strict_sum_rejects_unweighted_key() {
        let result = weighted_sum_strict(
            &losses(&[("loss_ce", 2.0), ("loss_aux", 1.0)]),
            &weights(&[("loss_ce", 1.0)]),
            &Device::Cpu,
        );
        match result {
            Err(Error::MissingLossWeight { key }) => assert_eq!(key, "loss_aux"),
            other => panic!("expected missing weight, got {other:?}"),
        }
    }

    #[test]
    fn test_filtered_sum_skips_unweighted_key() {
        let total = weighted_sum_filtered(
            &losses(&[("loss_ce", 2.0), ("loss_aux", 100.0)]),
            &weights(&[("loss_ce", 0.5), ("loss_unused", 3.0)]),
            &Device::Cpu,
        )
        .unwrap();
        assert_relative_eq!(scalar(&total).unwrap(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_empty_selection_is_zero() {
        let total =
            weighted_sum_filtered(&losses(&[("loss_aux", 3.0)]), &weights(&[]), &Device::Cpu).unwrap();
        assert_eq!(scalar(&total).unwrap(), 0.0);
    }

    #[test]
    fn test_loss_values() {
        let values = loss_values(&losses(&[("loss_ce", 0.25)])).unwrap();
        assert_eq!(values.get("loss_ce"), Some(&0.25));
    }
}

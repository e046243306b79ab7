//! One-hot Dice scores

use candle_core::{DType, Tensor};
use candle_nn::encoding::one_hot;
use ndarray::{Array2, Axis};

use crate::error::{Error, Result};

/// One-hot encode a class map `[N, ...]` into `[N, K, ...]` (F32)
pub fn one_hot_classes(classes: &Tensor, num_classes: usize) -> Result<Tensor> {
    let rank = classes.rank();
    if rank < 2 {
        return Err(Error::batch(format!(
            "class map must be at least [N, X], got {:?}",
            classes.dims()
        )));
    }
    let encoded = one_hot(classes.to_dtype(DType::U32)?, num_classes, 1f32, 0f32)?;
    // [N, ..., K] -> [N, K, ...]
    let mut order = vec![0, rank];
    order.extend(1..rank);
    Ok(encoded.permute(order)?.contiguous()?)
}

/// Per-sample, per-class Dice of one-hot tensors `[N, K, ...]`
///
/// `2|P∩G| / (|P| + |G|)`, NaN where the ground truth has no pixel of the
/// class. Drops column 0 unless `include_background`.
pub fn mean_dice(pred: &Tensor, gt: &Tensor, include_background: bool) -> Result<Array2<f64>> {
    if pred.dims() != gt.dims() {
        return Err(Error::batch(format!(
            "prediction {:?} and ground truth {:?} differ",
            pred.dims(),
            gt.dims()
        )));
    }
    let pred = pred.to_dtype(DType::F64)?.flatten_from(2)?;
    let gt = gt.to_dtype(DType::F64)?.flatten_from(2)?;

    let intersection: Vec<Vec<f64>> = (&pred * &gt)?.sum(2)?.to_vec2()?;
    let pred_size: Vec<Vec<f64>> = pred.sum(2)?.to_vec2()?;
    let gt_size: Vec<Vec<f64>> = gt.sum(2)?.to_vec2()?;

    let samples = intersection.len();
    let classes = intersection.first().map(|r| r.len()).unwrap_or(0);
    let first = if include_background { 0 } else { 1 };
    let width = classes.saturating_sub(first);

    let mut scores = Array2::from_elem((samples, width), f64::NAN);
    for n in 0..samples {
        for k in first..classes {
            if gt_size[n][k] > 0.0 {
                scores[[n, k - first]] = 2.0 * intersection[n][k] / (pred_size[n][k] + gt_size[n][k]);
            }
        }
    }
    Ok(scores)
}

/// Column means ignoring NaN entries; an all-NaN column stays NaN
pub fn nanmean_columns(scores: &Array2<f64>) -> Vec<f64> {
    scores
        .axis_iter(Axis(1))
        .map(|column| {
            let (sum, count) = column
                .iter()
                .filter(|v| !v.is_nan())
                .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
            if count == 0 {
                f64::NAN
            } else {
                sum / count as f64
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;
    use ndarray::array;

    #[test]
    fn test_one_hot_moves_class_axis() {
        let classes = Tensor::new(&[[[0u32, 2], [1, 1]]], &Device::Cpu).unwrap();
        let encoded = one_hot_classes(&classes, 3).unwrap();
        assert_eq!(encoded.dims(), &[1, 3, 2, 2]);
        let class_one: Vec<Vec<f32>> = encoded.get(0).unwrap().get(1).unwrap().to_vec2().unwrap();
        assert_eq!(class_one, vec![vec![0.0, 0.0], vec![1.0, 1.0]]);
    }

    #[test]
    fn test_dice_values_and_missing_class() {
        let device = Device::Cpu;
        let gt = Tensor::new(&[[[0u32, 1], [1, 0]]], &device).unwrap();
        let pred = Tensor::new(&[[[0u32, 1], [0, 2]]], &device).unwrap();
        let scores = mean_dice(
            &one_hot_classes(&pred, 3).unwrap(),
            &one_hot_classes(&gt, 3).unwrap(),
            false,
        )
        .unwrap();

        assert_eq!(scores.dim(), (1, 2));
        assert_relative_eq!(scores[[0, 0]], 2.0 / 3.0, epsilon = 1e-12);
        assert!(scores[[0, 1]].is_nan());
    }

    #[test]
    fn test_include_background() {
        let device = Device::Cpu;
        let gt = Tensor::new(&[[[0u32, 1]]], &device).unwrap();
        let scores = mean_dice(
            &one_hot_classes(&gt, 2).unwrap(),
            &one_hot_classes(&gt, 2).unwrap(),
            true,
        )
        .unwrap();
        assert_eq!(scores, array![[1.0, 1.0]]);
    }

    #[test]
    fn test_nanmean_columns() {
        let scores = array![[1.0, f64::NAN, f64::NAN], [0.5, 0.25, f64::NAN]];
        let means = nanmean_columns(&scores);
        assert_eq!(means[0], 0.75);
        assert_eq!(means[1], 0.25);
        assert!(means[2].is_nan());
    }
}

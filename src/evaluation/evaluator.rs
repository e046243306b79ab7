//! Slice-level Dice evaluation

use candle_core::Device;
use ndarray::{concatenate, Array2, Axis};
use tracing::{info, instrument};

use super::dice::{mean_dice, nanmean_columns, one_hot_classes};
use super::wrapper::release_transient_buffers;
use crate::error::{Error, Result};
use crate::training::data::BatchSource;
use crate::training::model::SegmentationModel;
use crate::training::uncertainty::predicted_classes;

/// Foreground Dice per class over a full pass of `loader`
///
/// Scores are computed per batch element, stacked across batches and
/// averaged per class ignoring NaN entries, so a class missing from some
/// slices only counts where it is present.
#[instrument(skip_all)]
pub fn evaluate(
    model: &mut dyn SegmentationModel,
    loader: &mut dyn BatchSource,
    device: &Device,
) -> Result<Vec<f64>> {
    model.set_training(false);

    let mut rows: Vec<Array2<f64>> = Vec::with_capacity(loader.num_batches());
    for batch in loader.epoch() {
        let batch = batch?.to_device(device)?;
        let logits = model.forward(&batch.images)?.detach();
        let num_classes = logits.dim(1)?;

        let pred = one_hot_classes(&predicted_classes(&logits)?, num_classes)?;
        let gt = one_hot_classes(&batch.labels, num_classes)?;
        rows.push(mean_dice(&pred, &gt, false)?);
    }

    if rows.is_empty() {
        return Err(Error::training("evaluation loader yielded no batches"));
    }
    let views: Vec<_> = rows.iter().map(|r| r.view()).collect();
    let scores = concatenate(Axis(0), &views).map_err(|e| Error::training(e.to_string()))?;
    let means = nanmean_columns(&scores);

    info!("Evaluated {} slices, foreground dice {:?}", scores.nrows(), means);
    release_transient_buffers(device)?;
    Ok(means)
}

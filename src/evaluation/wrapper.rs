//! Epoch-level prediction and report

use std::path::PathBuf;

use candle_core::Device;
use ndarray::Array2;
use tracing::{debug, info, instrument};

use super::domain::{eval_list, EvalReport};
use super::volume::{predict_volumes, ScanPredictions};
use crate::error::Result;
use crate::training::data::BatchSource;
use crate::training::model::SegmentationModel;
use crate::training::visual::VisualSink;

/// Settings of one prediction pass
#[derive(Debug, Clone)]
pub struct PredictionOptions {
    pub epoch: usize,
    pub label_names: Vec<String>,
    /// Slice images go under `<output_dir>/vis_save`
    pub output_dir: PathBuf,
    pub mode: String,
    /// Keep the reassembled volumes in the outcome
    pub save_prediction: bool,
}

/// What a prediction pass returns
#[derive(Debug, Clone)]
pub struct PredictionOutcome {
    /// Empty unless predictions are saved
    pub volumes: ScanPredictions,
    pub dsc_table: Array2<f64>,
    pub report: EvalReport,
    pub domain_names: Vec<String>,
}

/// Drop cached device buffers after an evaluation pass
///
/// Candle frees buffers when tensors drop, so only pending work is flushed.
pub fn release_transient_buffers(device: &Device) -> Result<()> {
    device.synchronize()?;
    debug!("Released transient buffers on {:?}", device.location());
    Ok(())
}

/// Predict every scan of `loader`, dump slices and build the report
#[instrument(skip_all, fields(epoch = options.epoch, mode = %options.mode))]
pub fn prediction_wrapper(
    model: &mut dyn SegmentationModel,
    loader: &mut dyn BatchSource,
    device: &Device,
    sink: &mut dyn VisualSink,
    options: &PredictionOptions,
) -> Result<PredictionOutcome> {
    let vis_dir = options.output_dir.join("vis_save");
    let volumes = predict_volumes(model, loader, device, sink, Some(&vis_dir))?;

    info!("Epoch {} test result on mode {}", options.epoch, options.mode);
    let mut report = eval_list(&volumes, &options.label_names)?;
    report.mode = options.mode.clone();

    let outcome = PredictionOutcome {
        volumes: if options.save_prediction { volumes } else { Vec::new() },
        dsc_table: report.dsc_table.clone(),
        domain_names: report.domain_names(),
        report,
    };
    release_transient_buffers(device)?;
    Ok(outcome)
}

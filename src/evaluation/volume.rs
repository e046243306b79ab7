//! Slice-to-volume reassembly for volumetric evaluation
//!
//! Slices arrive one per batch, grouped by scan and in ascending order, with
//! `is_start` / `is_end` flags marking scan boundaries. The reassembler is an
//! explicit state machine keyed by scan id that rejects anything out of
//! protocol instead of writing into the wrong buffer.

use std::path::Path;

use candle_core::{Device, IndexOp, Tensor};
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::training::data::{Batch, BatchSource};
use crate::training::model::SegmentationModel;
use crate::training::uncertainty::predicted_classes;
use crate::training::visual::{PanelStyle, VisualSink};

/// A reassembled scan
#[derive(Debug, Clone)]
pub struct ScanPrediction {
    /// Predicted classes `[nframe, H, W]`
    pub pred: Tensor,
    /// Ground truth `[nframe, H, W]`
    pub gth: Tensor,
    /// First image channel `[H, W, nframe]`
    pub image: Tensor,
}

/// Finalized scans in completion order
pub type ScanPredictions = Vec<(String, ScanPrediction)>;

#[derive(Debug)]
struct OpenScan {
    scan_id: String,
    nframe: usize,
    slice_idx: usize,
    preds: Vec<Tensor>,
    gths: Vec<Tensor>,
    images: Vec<Tensor>,
}

#[derive(Debug)]
enum ScanState {
    Idle,
    Accumulating(OpenScan),
}

/// Where a pushed slice landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicePlacement {
    /// Owning scan
    pub scan_id: String,
    /// Slices written so far for the scan, this one included
    pub written: usize,
    /// Slice count of the scan
    pub nframe: usize,
    /// Whether this slice closed the scan
    pub finalized: bool,
}

/// Accumulates per-slice predictions into per-scan volumes
#[derive(Debug)]
pub struct VolumeReassembler {
    state: ScanState,
    finished: ScanPredictions,
}

impl Default for VolumeReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeReassembler {
    /// Start idle with no finalized scans
    pub fn new() -> Self {
        Self {
            state: ScanState::Idle,
            finished: Vec::new(),
        }
    }

    /// Scan currently being accumulated
    pub fn open_scan(&self) -> Option<&str> {
        match &self.state {
            ScanState::Idle => None,
            ScanState::Accumulating(open) => Some(&open.scan_id),
        }
    }

    /// Number of finalized scans
    pub fn finished_len(&self) -> usize {
        self.finished.len()
    }

    /// Write one slice and its `[1, H, W]` predicted class map
    pub fn push(&mut self, batch: &Batch, prediction: &Tensor) -> Result<SlicePlacement> {
        if batch.batch_size() != 1 {
            return Err(Error::batch(format!(
                "volumetric evaluation needs a batch size of 1, got {}",
                batch.batch_size()
            )));
        }
        if prediction.dims() != batch.labels.dims() {
            return Err(Error::batch(format!(
                "prediction {:?} does not match labels {:?}",
                prediction.dims(),
                batch.labels.dims()
            )));
        }
        let scan = batch.require_scan()?;
        let scan_id = scan
            .scan_ids
            .first()
            .ok_or_else(|| Error::batch("batch carries no scan id"))?;

        if scan.is_start {
            if let ScanState::Accumulating(open) = &self.state {
                return Err(Error::scan_state(format!(
                    "scan {scan_id} started while {} is still open at slice {}/{}",
                    open.scan_id, open.slice_idx, open.nframe
                )));
            }
            if self.finished.iter().any(|(id, _)| id == scan_id) {
                return Err(Error::scan_state(format!("scan {scan_id} was already finalized")));
            }
            if scan.nframe == 0 {
                return Err(Error::scan_state(format!("scan {scan_id} declares zero slices")));
            }
            self.state = ScanState::Accumulating(OpenScan {
                scan_id: scan_id.clone(),
                nframe: scan.nframe,
                slice_idx: 0,
                preds: Vec::with_capacity(scan.nframe),
                gths: Vec::with_capacity(scan.nframe),
                images: Vec::with_capacity(scan.nframe),
            });
        }

        let ScanState::Accumulating(open) = &mut self.state else {
            return Err(Error::scan_state(format!(
                "slice of {scan_id} arrived with no open scan"
            )));
        };
        if &open.scan_id != scan_id {
            return Err(Error::scan_state(format!(
                "slice of {scan_id} arrived while {} is open",
                open.scan_id
            )));
        }
        if open.nframe != scan.nframe {
            return Err(Error::scan_state(format!(
                "scan {scan_id} changed nframe from {} to {}",
                open.nframe, scan.nframe
            )));
        }
        if open.slice_idx >= open.nframe {
            return Err(Error::scan_state(format!(
                "scan {scan_id} received more than {} slices",
                open.nframe
            )));
        }

        open.preds.push(prediction.i(0)?);
        open.gths.push(batch.labels.i(0)?);
        open.images.push(batch.images.i((0, 0))?);
        open.slice_idx += 1;

        let placement = SlicePlacement {
            scan_id: scan_id.clone(),
            written: open.slice_idx,
            nframe: open.nframe,
            finalized: scan.is_end,
        };

        if scan.is_end {
            if open.slice_idx != open.nframe {
                return Err(Error::scan_state(format!(
                    "scan {scan_id} ended after {} of {} slices",
                    open.slice_idx, open.nframe
                )));
            }
            if let ScanState::Accumulating(open) = std::mem::replace(&mut self.state, ScanState::Idle) {
                self.finalize(open)?;
            }
        }
        Ok(placement)
    }

    fn finalize(&mut self, open: OpenScan) -> Result<()> {
        let prediction = ScanPrediction {
            pred: Tensor::stack(&open.preds, 0)?,
            gth: Tensor::stack(&open.gths, 0)?,
            image: Tensor::stack(&open.images, 2)?,
        };
        debug!("Finalized scan {} with {} slices", open.scan_id, open.nframe);
        self.finished.push((open.scan_id, prediction));
        Ok(())
    }

    /// Finalized scans; fails if a scan is still open
    pub fn finish(self) -> Result<ScanPredictions> {
        if let ScanState::Accumulating(open) = &self.state {
            return Err(Error::scan_state(format!(
                "scan {} still open at slice {}/{}",
                open.scan_id, open.slice_idx, open.nframe
            )));
        }
        Ok(self.finished)
    }
}

/// Predict every slice of `loader` and reassemble the scans
///
/// With `vis_dir` set, each slice is also written as
/// `img_<nframe>_<n>.png`, `gt_<nframe>_<n>.png` and `pred_<nframe>_<n>.png`,
/// where `n` counts the scan's slices from 1.
#[instrument(skip_all)]
pub fn predict_volumes(
    model: &mut dyn SegmentationModel,
    loader: &mut dyn BatchSource,
    device: &Device,
    sink: &mut dyn VisualSink,
    vis_dir: Option<&Path>,
) -> Result<ScanPredictions> {
    model.set_training(false);
    let mut reassembler = VolumeReassembler::new();

    for batch in loader.epoch() {
        let batch = batch?.to_device(device)?;
        let logits = model.forward(&batch.images)?.detach();
        let prediction = predicted_classes(&logits)?;
        let placement = reassembler.push(&batch, &prediction)?;

        if let Some(dir) = vis_dir {
            let suffix = format!("{}_{}.png", placement.nframe, placement.written);
            sink.save_image(
                &dir.join(format!("img_{suffix}")),
                &batch.images.i((0, 0))?,
                PanelStyle::Grayscale,
            )?;
            sink.save_image(
                &dir.join(format!("gt_{suffix}")),
                &batch.labels.i(0)?,
                PanelStyle::Segmentation,
            )?;
            sink.save_image(
                &dir.join(format!("pred_{suffix}")),
                &prediction.i(0)?,
                PanelStyle::Segmentation,
            )?;
        }
    }

    reassembler.finish()
}

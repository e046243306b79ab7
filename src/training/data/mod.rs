//! Data loading infrastructure for UGMix training and evaluation
//!
//! This module defines the batch contract consumed by every runner, dataset
//! abstractions over single samples, the batching data loader, and the slice
//! stream used for volumetric evaluation.

use candle_core::{Device, IndexOp, Tensor};

use crate::error::{Error, Result};

pub mod augment;
pub mod loaders;
pub mod volumes;

// Re-exports
pub use augment::IntensityAugment;
pub use loaders::{BatchList, BatchSource, DataLoader, DataLoaderConfig};
pub use volumes::{load_npy_volumes, SampleDataset, VolumeRecord, VolumeSliceDataset};

/// Scan bookkeeping attached to batches of the volumetric evaluation path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanMarker {
    /// First slice of a scan
    pub is_start: bool,
    /// Last slice of a scan
    pub is_end: bool,
    /// One scan identifier per batch element
    pub scan_ids: Vec<String>,
    /// Total slice count of the scan
    pub nframe: usize,
}

/// A training or evaluation batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// Image tensor `[N, C, H, W]`
    pub images: Tensor,
    /// Integer class ids `[N, H, W]`
    pub labels: Tensor,
    /// Paired augmented view of `images`
    pub aug_images: Option<Tensor>,
    /// Scan boundaries, present on the volumetric path only
    pub scan: Option<ScanMarker>,
}

impl Batch {
    /// Create a batch without an augmented view or scan markers
    pub fn new(images: Tensor, labels: Tensor) -> Result<Self> {
        let batch = Self {
            images,
            labels,
            aug_images: None,
            scan: None,
        };
        batch.validate()?;
        Ok(batch)
    }

    /// Attach an augmented view
    pub fn with_aug(mut self, aug_images: Tensor) -> Result<Self> {
        self.aug_images = Some(aug_images);
        self.validate()?;
        Ok(self)
    }

    /// Attach scan markers
    pub fn with_scan(mut self, scan: ScanMarker) -> Result<Self> {
        self.scan = Some(scan);
        self.validate()?;
        Ok(self)
    }

    /// Number of elements in the batch
    pub fn batch_size(&self) -> usize {
        self.images.dims().first().copied().unwrap_or(0)
    }

    /// Check shape agreement between images, labels and the augmented view
    pub fn validate(&self) -> Result<()> {
        let (n, _c, h, w) = self
            .images
            .dims4()
            .map_err(|_| Error::batch(format!("images must be [N,C,H,W], got {:?}", self.images.dims())))?;
        let (ln, lh, lw) = self
            .labels
            .dims3()
            .map_err(|_| Error::batch(format!("labels must be [N,H,W], got {:?}", self.labels.dims())))?;

        if (n, h, w) != (ln, lh, lw) {
            return Err(Error::batch(format!(
                "images {:?} and labels {:?} disagree on batch or spatial dims",
                self.images.dims(),
                self.labels.dims()
            )));
        }

        if let Some(aug) = &self.aug_images {
            if aug.dims() != self.images.dims() {
                return Err(Error::batch(format!(
                    "aug_images {:?} must match images {:?}",
                    aug.dims(),
                    self.images.dims()
                )));
            }
        }

        if let Some(scan) = &self.scan {
            if scan.scan_ids.len() != n {
                return Err(Error::batch(format!(
                    "{} scan ids for a batch of {}",
                    scan.scan_ids.len(),
                    n
                )));
            }
        }

        Ok(())
    }

    /// Move every tensor of the record to `device`
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            images: self.images.to_device(device)?,
            labels: self.labels.to_device(device)?,
            aug_images: match &self.aug_images {
                Some(aug) => Some(aug.to_device(device)?),
                None => None,
            },
            scan: self.scan.clone(),
        })
    }

    /// The augmented view, required by the mixup runner
    pub fn require_aug(&self) -> Result<&Tensor> {
        self.aug_images
            .as_ref()
            .ok_or_else(|| Error::batch("batch has no aug_images"))
    }

    /// Scan markers, required by the volumetric path
    pub fn require_scan(&self) -> Result<&ScanMarker> {
        self.scan
            .as_ref()
            .ok_or_else(|| Error::batch("batch has no scan markers"))
    }
}

/// Per-slice scan information carried by a sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceInfo {
    /// Owning scan
    pub scan_id: String,
    /// Position within the scan
    pub slice_index: usize,
    /// Total slice count of the scan
    pub nframe: usize,
}

impl SliceInfo {
    /// Whether this is the first slice of its scan
    pub fn is_start(&self) -> bool {
        self.slice_index == 0
    }

    /// Whether this is the last slice of its scan
    pub fn is_end(&self) -> bool {
        self.slice_index + 1 == self.nframe
    }
}

/// A single sample before collation
#[derive(Debug, Clone)]
pub struct Sample {
    /// Image `[C, H, W]`
    pub image: Tensor,
    /// Label map `[H, W]`
    pub label: Tensor,
    /// Augmented view `[C, H, W]`
    pub aug_image: Option<Tensor>,
    /// Scan position for volumetric streams
    pub slice: Option<SliceInfo>,
}

/// Common trait for all sample datasets
pub trait Dataset: Send + Sync {
    /// Get the number of samples in the dataset
    fn len(&self) -> usize;

    /// Check if the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get a sample by index
    fn get(&self, index: usize) -> Result<Sample>;
}

/// Stack samples into a batch
///
/// Scan markers are taken from the first sample; the volumetric path only
/// ever collates one sample per batch.
pub fn collate(samples: &[Sample]) -> Result<Batch> {
    let first = samples
        .first()
        .ok_or_else(|| Error::batch("cannot collate an empty sample list"))?;

    let images: Vec<&Tensor> = samples.iter().map(|s| &s.image).collect();
    let labels: Vec<&Tensor> = samples.iter().map(|s| &s.label).collect();
    let mut batch = Batch::new(Tensor::stack(&images, 0)?, Tensor::stack(&labels, 0)?)?;

    if samples.iter().all(|s| s.aug_image.is_some()) {
        let augs: Vec<&Tensor> = samples.iter().filter_map(|s| s.aug_image.as_ref()).collect();
        batch = batch.with_aug(Tensor::stack(&augs, 0)?)?;
    }

    if let Some(slice) = &first.slice {
        let scan_ids = samples
            .iter()
            .map(|s| {
                s.slice
                    .as_ref()
                    .map(|info| info.scan_id.clone())
                    .ok_or_else(|| Error::batch("mixed volumetric and plain samples in one batch"))
            })
            .collect::<Result<Vec<_>>>()?;
        batch = batch.with_scan(ScanMarker {
            is_start: slice.is_start(),
            is_end: slice.is_end(),
            scan_ids,
            nframe: slice.nframe,
        })?;
    }

    Ok(batch)
}

/// First image channel of the first batch element as a 2-D tensor
pub(crate) fn first_image_plane(images: &Tensor) -> Result<Tensor> {
    Ok(images.i((0, 0))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn sample(value: f32, slice: Option<SliceInfo>) -> Sample {
        let device = Device::Cpu;
        Sample {
            image: Tensor::full(value, (1, 4, 4), &device).unwrap(),
            label: Tensor::zeros((4, 4), DType::U32, &device).unwrap(),
            aug_image: None,
            slice,
        }
    }

    #[test]
    fn test_batch_rejects_mismatched_labels() {
        let device = Device::Cpu;
        let images = Tensor::zeros((2, 1, 4, 4), DType::F32, &device).unwrap();
        let labels = Tensor::zeros((2, 4, 5), DType::U32, &device).unwrap();
        assert!(matches!(Batch::new(images, labels), Err(Error::Batch(_))));
    }

    #[test]
    fn test_batch_rejects_mismatched_aug() {
        let device = Device::Cpu;
        let images = Tensor::zeros((2, 1, 4, 4), DType::F32, &device).unwrap();
        let labels = Tensor::zeros((2, 4, 4), DType::U32, &device).unwrap();
        let aug = Tensor::zeros((1, 1, 4, 4), DType::F32, &device).unwrap();
        let batch = Batch::new(images, labels).unwrap();
        assert!(batch.with_aug(aug).is_err());
    }

    #[test]
    fn test_collate_stacks_samples() {
        let batch = collate(&[sample(1.0, None), sample(2.0, None)]).unwrap();
        assert_eq!(batch.images.dims(), &[2, 1, 4, 4]);
        assert_eq!(batch.labels.dims(), &[2, 4, 4]);
        assert!(batch.aug_images.is_none());
        assert!(batch.scan.is_none());
        assert!(batch.require_aug().is_err());
    }

    #[test]
    fn test_collate_carries_scan_markers() {
        let info = SliceInfo {
            scan_id: "A_1".to_string(),
            slice_index: 2,
            nframe: 3,
        };
        let batch = collate(&[sample(1.0, Some(info))]).unwrap();
        let scan = batch.require_scan().unwrap();
        assert!(!scan.is_start);
        assert!(scan.is_end);
        assert_eq!(scan.nframe, 3);
        assert_eq!(scan.scan_ids, vec!["A_1".to_string()]);
    }
}

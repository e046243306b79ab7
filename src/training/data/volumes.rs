//! In-memory volume datasets and `.npy` volume loading

use std::path::Path;

use candle_core::{DType, IndexOp, Tensor};
use tracing::{debug, info};

use super::{Dataset, Sample, SliceInfo};
use crate::error::{Error, Result};

/// One scan held in memory
#[derive(Debug, Clone)]
pub struct VolumeRecord {
    /// `<domain>_<patient>` identifier
    pub scan_id: String,
    /// Intensities `[nframe, H, W]`
    pub image: Tensor,
    /// Class ids `[nframe, H, W]`
    pub label: Tensor,
}

impl VolumeRecord {
    /// Create a record, checking that image and label agree
    pub fn new(scan_id: impl Into<String>, image: Tensor, label: Tensor) -> Result<Self> {
        let scan_id = scan_id.into();
        let image = image.to_dtype(DType::F32)?;
        let label = label.to_dtype(DType::U32)?;
        if image.rank() != 3 || image.dims() != label.dims() {
            return Err(Error::batch(format!(
                "scan {scan_id}: image {:?} and label {:?} must both be [nframe,H,W]",
                image.dims(),
                label.dims()
            )));
        }
        Ok(Self { scan_id, image, label })
    }

    /// Number of slices
    pub fn nframe(&self) -> usize {
        self.image.dims()[0]
    }

    fn slice(&self, index: usize) -> Result<(Tensor, Tensor)> {
        Ok((self.image.i(index)?.unsqueeze(0)?, self.label.i(index)?))
    }
}

/// Slices of many volumes as independent training samples
pub struct SampleDataset {
    volumes: Vec<VolumeRecord>,
    index: Vec<(usize, usize)>,
}

impl SampleDataset {
    /// Flatten volumes into a slice-level dataset
    pub fn from_volumes(volumes: Vec<VolumeRecord>) -> Self {
        let index = index_slices(&volumes);
        Self { volumes, index }
    }
}

impl Dataset for SampleDataset {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let &(volume, slice) = self
            .index
            .get(index)
            .ok_or_else(|| Error::batch(format!("sample index {index} out of range")))?;
        let (image, label) = self.volumes[volume].slice(slice)?;
        Ok(Sample {
            image,
            label,
            aug_image: None,
            slice: None,
        })
    }
}

/// Ordered slice stream with scan boundaries, for volumetric evaluation
///
/// Slices of one scan are contiguous and ascending, so the stream satisfies
/// the start/end protocol of the volume reassembler when loaded with
/// `DataLoaderConfig::sequential()`.
pub struct VolumeSliceDataset {
    volumes: Vec<VolumeRecord>,
    index: Vec<(usize, usize)>,
}

impl VolumeSliceDataset {
    /// Create a slice stream over `volumes`
    pub fn new(volumes: Vec<VolumeRecord>) -> Self {
        let index = index_slices(&volumes);
        debug!("Slice stream over {} scans, {} slices", volumes.len(), index.len());
        Self { volumes, index }
    }

    /// Scan identifiers in stream order
    pub fn scan_ids(&self) -> Vec<&str> {
        self.volumes.iter().map(|v| v.scan_id.as_str()).collect()
    }
}

impl Dataset for VolumeSliceDataset {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let &(volume, slice) = self
            .index
            .get(index)
            .ok_or_else(|| Error::batch(format!("slice index {index} out of range")))?;
        let record = &self.volumes[volume];
        let (image, label) = record.slice(slice)?;
        Ok(Sample {
            image,
            label,
            aug_image: None,
            slice: Some(SliceInfo {
                scan_id: record.scan_id.clone(),
                slice_index: slice,
                nframe: record.nframe(),
            }),
        })
    }
}

fn index_slices(volumes: &[VolumeRecord]) -> Vec<(usize, usize)> {
    volumes
        .iter()
        .enumerate()
        .flat_map(|(v, record)| (0..record.nframe()).map(move |s| (v, s)))
        .collect()
}

/// Load every `<scan_id>_image.npy` / `<scan_id>_label.npy` pair in `dir`
///
/// Scans are returned sorted by identifier.
pub fn load_npy_volumes(dir: impl AsRef<Path>) -> Result<Vec<VolumeRecord>> {
    let dir = dir.as_ref();
    let mut scan_ids: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix("_image.npy"))
                .map(str::to_string)
        })
        .collect();
    scan_ids.sort();

    let mut volumes = Vec::with_capacity(scan_ids.len());
    for scan_id in scan_ids {
        let label_path = dir.join(format!("{scan_id}_label.npy"));
        if !label_path.exists() {
            return Err(Error::config(format!(
                "missing label volume {}",
                label_path.display()
            )));
        }
        let image = Tensor::read_npy(dir.join(format!("{scan_id}_image.npy")))?;
        let label = Tensor::read_npy(&label_path)?;
        volumes.push(VolumeRecord::new(scan_id, image, label)?);
    }

    info!("Loaded {} volumes from {}", volumes.len(), dir.display());
    Ok(volumes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn record(scan_id: &str, nframe: usize) -> VolumeRecord {
        let device = Device::Cpu;
        VolumeRecord::new(
            scan_id,
            Tensor::zeros((nframe, 4, 4), DType::F32, &device).unwrap(),
            Tensor::zeros((nframe, 4, 4), DType::U32, &device).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_slice_stream_marks_boundaries() {
        let dataset = VolumeSliceDataset::new(vec![record("A_1", 3), record("B_1", 1)]);
        assert_eq!(dataset.len(), 4);

        let flags: Vec<(bool, bool)> = (0..4)
            .map(|i| {
                let info = dataset.get(i).unwrap().slice.unwrap();
                (info.is_start(), info.is_end())
            })
            .collect();
        assert_eq!(flags, vec![(true, false), (false, false), (false, true), (true, true)]);
    }

    #[test]
    fn test_sample_dataset_shapes() {
        let dataset = SampleDataset::from_volumes(vec![record("A_1", 2)]);
        let sample = dataset.get(1).unwrap();
        assert_eq!(sample.image.dims(), &[1, 4, 4]);
        assert_eq!(sample.label.dims(), &[4, 4]);
        assert!(dataset.get(2).is_err());
    }

    #[test]
    fn test_record_rejects_shape_mismatch() {
        let device = Device::Cpu;
        let result = VolumeRecord::new(
            "A_1",
            Tensor::zeros((2, 4, 4), DType::F32, &device).unwrap(),
            Tensor::zeros((3, 4, 4), DType::U32, &device).unwrap(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_npy_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::Cpu;
        let image = Tensor::ones((2, 3, 3), DType::F32, &device).unwrap();
        let label = Tensor::zeros((2, 3, 3), DType::F32, &device).unwrap();
        image.write_npy(dir.path().join("A_1_image.npy")).unwrap();
        label.write_npy(dir.path().join("A_1_label.npy")).unwrap();

        let volumes = load_npy_volumes(dir.path()).unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].scan_id, "A_1");
        assert_eq!(volumes[0].label.dtype(), DType::U32);
    }
}

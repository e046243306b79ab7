//! Data loaders that turn sample datasets into restartable batch streams

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{collate, Batch, Dataset, IntensityAugment};
use crate::error::Result;

/// A lazy, finite, restartable sequence of batches
///
/// Every call to [`BatchSource::epoch`] starts a fresh pass over the data.
pub trait BatchSource {
    /// Number of batches one pass yields
    fn num_batches(&self) -> usize;

    /// Start a new pass over the data
    fn epoch(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_>;
}

/// Configuration for DataLoader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    /// Batch size
    pub batch_size: usize,
    /// Whether to shuffle data
    pub shuffle: bool,
    /// Whether to drop the last incomplete batch
    pub drop_last: bool,
    /// Seed for shuffling and augmentation
    pub seed: u64,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            shuffle: true,
            drop_last: false,
            seed: 42,
        }
    }
}

impl DataLoaderConfig {
    /// Ordered, batch-size-1 configuration used for the slice stream of
    /// volumetric evaluation
    pub fn sequential() -> Self {
        Self {
            batch_size: 1,
            shuffle: false,
            drop_last: false,
            seed: 0,
        }
    }
}

/// Batching data loader over a sample dataset
pub struct DataLoader<D: Dataset> {
    /// Dataset reference
    dataset: Arc<D>,
    /// DataLoader configuration
    config: DataLoaderConfig,
    /// Builds `aug_images` for each sample when set
    augment: Option<IntensityAugment>,
    /// Shuffling and augmentation randomness
    rng: StdRng,
    /// Completed passes
    epoch: usize,
}

impl<D: Dataset> DataLoader<D> {
    /// Create a new DataLoader
    pub fn new(dataset: Arc<D>, config: DataLoaderConfig) -> Self {
        info!(
            "Creating DataLoader over {} samples with batch_size={}, shuffle={}",
            dataset.len(),
            config.batch_size,
            config.shuffle
        );

        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            dataset,
            config,
            augment: None,
            rng,
            epoch: 0,
        }
    }

    /// Produce a paired augmented view for every sample
    pub fn with_augment(mut self, augment: IntensityAugment) -> Self {
        self.augment = Some(augment);
        self
    }

    /// Get dataset size
    pub fn dataset_size(&self) -> usize {
        self.dataset.len()
    }

    /// Passes started so far
    pub fn current_epoch(&self) -> usize {
        self.epoch
    }

    /// Create batches from indices
    fn create_batches(&self, indices: Vec<usize>) -> Vec<Vec<usize>> {
        let batch_size = self.config.batch_size.max(1);
        let mut batches = Vec::new();

        for chunk in indices.chunks(batch_size) {
            if self.config.drop_last && chunk.len() < batch_size {
                break;
            }
            batches.push(chunk.to_vec());
        }

        debug!("Created {} batches", batches.len());
        batches
    }

    fn load_batch(&mut self, indices: &[usize]) -> Result<Batch> {
        let mut samples = Vec::with_capacity(indices.len());
        for &index in indices {
            let mut sample = self.dataset.get(index)?;
            if let Some(augment) = &self.augment {
                if sample.aug_image.is_none() {
                    sample.aug_image = Some(augment.apply(&sample.image, &mut self.rng)?);
                }
            }
            samples.push(sample);
        }
        collate(&samples)
    }
}

impl<D: Dataset> BatchSource for DataLoader<D> {
    fn num_batches(&self) -> usize {
        let dataset_size = self.dataset.len();
        let batch_size = self.config.batch_size.max(1);
        if self.config.drop_last {
            dataset_size / batch_size
        } else {
            dataset_size.div_ceil(batch_size)
        }
    }

    fn epoch(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        self.epoch += 1;

        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            indices.shuffle(&mut self.rng);
        }
        let batches = self.create_batches(indices);
        debug!("Starting pass {} with {} batches", self.epoch, batches.len());

        Box::new(batches.into_iter().map(move |indices| self.load_batch(&indices)))
    }
}

/// Pre-built batches replayed in order on every pass
#[derive(Debug, Clone, Default)]
pub struct BatchList {
    batches: Vec<Batch>,
}

impl BatchList {
    /// Wrap a list of batches
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches }
    }
}

impl BatchSource for BatchList {
    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn epoch(&mut self) -> Box<dyn Iterator<Item = Result<Batch>> + '_> {
        Box::new(self.batches.iter().cloned().map(Ok))
    }
}

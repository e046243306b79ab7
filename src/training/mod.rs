//! Training infrastructure for segmentation models
//!
//! This module provides the pieces the trainer is assembled from: batch
//! loading, the segmentation model and criterion, optimizers with parameter
//! groups, linear warmup, the standard and uncertainty-guided mixup epoch
//! runners, and metric logging.
//!
//! # Main Components
//!
//! - **Configuration**: serde-backed [`TrainConfig`] loaded from JSON or YAML
//! - **Runners**: [`run_warmup`], [`train_one_epoch`] and [`MixupRunner`]
//! - **Uncertainty**: entropy maps, guidance fusion and input mixing
//! - **Optimizers**: AdamW and SGD over named parameter groups, plus loss scaling
//! - **Metrics**: windowed smoothed meters and periodic progress logging
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use ugmix::training::{SegTrainer, TrainConfig};
//! use candle_core::Device;
//!
//! let config = TrainConfig::from_file("train.yaml")?;
//! let mut trainer = SegTrainer::from_config(config, Box::new(train_loader), Device::Cpu)?
//!     .with_test_loader(Box::new(test_loader));
//! let summary = trainer.train()?;
//! ```

pub mod accumulate;
pub mod config;
pub mod data;
pub mod epoch;
pub mod loss;
pub mod metrics;
pub mod mixup;
pub mod model;
pub mod optimizers;
pub mod trainer;
pub mod uncertainty;
pub mod visual;
pub mod warmup;

// Tests module
#[cfg(test)]
pub mod tests;

// Configuration re-exports
pub use config::{
    DataConfig, EvaluationConfig, LossConfig, MixedPrecisionConfig, MixupConfig, ModelConfig,
    OptimizerConfig, OptimizerType, OutputConfig, RuntimeConfig, ScheduleConfig, TrainConfig,
};

// Runner re-exports
pub use accumulate::GradientAccumulator;
pub use epoch::{train_one_epoch, StepContext};
pub use mixup::{MixupEpochOutcome, MixupRunner, MixupStepRecord, VisualTarget};
pub use trainer::{SegTrainer, TrainingEvent, TrainingSummary};
pub use warmup::{run_warmup, warmup_lr};

// Data re-exports
pub use data::{
    collate, Batch, BatchList, BatchSource, DataLoader, DataLoaderConfig, Dataset, IntensityAugment,
    Sample, SampleDataset, ScanMarker, SliceInfo, VolumeRecord, VolumeSliceDataset,
};

// Model, loss and optimizer re-exports
pub use loss::{Criterion, LossDict, SegmentationCriterion, WeightTable};
pub use metrics::{MetricLogger, SmoothedValue};
pub use model::{ConvSegmenter, SegmentationModel};
pub use optimizers::{create_optimizer, AdamWOptimizer, GradScaler, Optimizer, ParamGroup, SGDOptimizer};
pub use uncertainty::{GaussianBlur, MixDecision, ZeroForegroundPolicy};
pub use visual::{FileVisualSink, NullSink, VisualSink};

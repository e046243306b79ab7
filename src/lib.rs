//! UGMix - uncertainty-guided mixup training for medical image segmentation
//!
//! This crate trains segmentation networks with a three-branch mixup scheme
//! that blends clean and augmented inputs where the model is uncertain, and
//! evaluates them per scan and per acquisition domain with volumetric Dice.

#![warn(rustdoc::broken_intra_doc_links)]

pub mod error;
pub mod evaluation;
pub mod training;

// Re-exports
pub use error::{Error, Result};
pub use evaluation::{eval_list, evaluate, prediction_wrapper, EvalReport, VolumeReassembler};
pub use training::{SegTrainer, TrainConfig, TrainingEvent, TrainingSummary};

//! Slice and volume level evaluation
//!
//! [`evaluate`] scores slices of a validation loader; the trainer runs it
//! every `eval_every` epochs. The volumetric path streams
//! one slice per batch through a [`VolumeReassembler`], scores each
//! reassembled scan and aggregates per domain.

pub mod dice;
pub mod domain;
pub mod evaluator;
pub mod volume;
pub mod wrapper;

pub use dice::{mean_dice, nanmean_columns, one_hot_classes};
pub use domain::{eval_list, split_scan_id, volume_dice, ClassStat, DomainSummary, EvalReport};
pub use evaluator::evaluate;
pub use volume::{predict_volumes, ScanPrediction, ScanPredictions, SlicePlacement, VolumeReassembler};
pub use wrapper::{prediction_wrapper, release_transient_buffers, PredictionOptions, PredictionOutcome};

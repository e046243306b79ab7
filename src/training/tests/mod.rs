//! Test suite for the training and evaluation pipeline
//!
//! Runner tests drive warmup, standard and mixup epochs against recording
//! collaborators; integration tests push synthetic volumes through the
//! evaluation path and the full trainer.

// Test modules
pub mod integration_tests;


// Re-export commonly used test utilities
pub use test_utils::{
    create_test_device, tiny_model, tiny_model_config, ExtraKeyCriterion, OracleModel,
    RecordingOptimizer, RecordingSink,
};

pub use mock_data::{create_mock_batch, create_mock_loader, create_mock_volume, create_slice_loader};

//! Training metrics: smoothed meters and the progress logger injected into
//! every runner

pub mod logger;
pub mod smoothed;

pub use logger::{MetricLogger, ProgressLog};
pub use smoothed::{SmoothedValue, DEFAULT_WINDOW};

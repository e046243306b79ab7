//! Error types for the UGMix system

use thiserror::Error;

/// Main error type for UGMix operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A loss term has no entry in the criterion's weight table
    #[error("Loss '{key}' has no entry in the weight table")]
    MissingLossWeight {
        /// Name of the unweighted loss term
        key: String,
    },

    /// Batch does not follow the expected schema
    #[error("Batch schema violation: {0}")]
    Batch(String),

    /// Slice stream violated the scan start/end protocol
    #[error("Scan state violation: {0}")]
    ScanState(String),

    /// Scan identifier could not be split into domain and patient
    #[error("Cannot parse scan id '{scan_id}': expected exactly one '_' separator")]
    ScanIdParse {
        /// Offending identifier
        scan_id: String,
    },

    /// Training loop error
    #[error("Training error: {0}")]
    Training(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Image encoding error
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for UGMix operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a batch schema error
    pub fn batch(msg: impl Into<String>) -> Self {
        Self::Batch(msg.into())
    }

    /// Create a scan state error
    pub fn scan_state(msg: impl Into<String>) -> Self {
        Self::ScanState(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a missing loss weight error
    pub fn missing_weight(key: impl Into<String>) -> Self {
        Self::MissingLossWeight { key: key.into() }
    }
}

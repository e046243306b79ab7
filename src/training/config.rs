//! Training configuration for UGMix
//!
//! One serde tree covers the model, optimizer, schedule, mixup, mixed
//! precision, loss weights, evaluation, runtime and output settings. Files
//! ending in `.json` are read as JSON, anything else as YAML.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::training::data::{DataLoaderConfig, IntensityAugment};
use crate::training::uncertainty::ZeroForegroundPolicy;

/// Main training configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Model configuration
    pub model: ModelConfig,

    /// Optimization configuration
    pub optimizer: OptimizerConfig,

    /// Warmup, epochs and iteration budget
    pub schedule: ScheduleConfig,

    /// Batching and augmentation
    pub data: DataConfig,

    /// Uncertainty-guided mixup settings
    pub mixup: MixupConfig,

    /// Mixed precision training settings
    pub mixed_precision: MixedPrecisionConfig,

    /// Loss weights
    pub loss: LossConfig,

    /// Volumetric evaluation settings
    pub evaluation: EvaluationConfig,

    /// Runtime configuration
    pub runtime: RuntimeConfig,

    /// Output locations
    pub output: OutputConfig,
}

/// Segmentation network shape
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Image channels
    pub in_channels: usize,
    /// Output classes, background included
    pub num_classes: usize,
    /// Width of the convolutional encoder
    pub hidden_channels: usize,
    /// Dropout before the head during training
    pub dropout: f64,
}

impl ModelConfig {
    /// Validate the model shape
    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 || self.hidden_channels == 0 {
            return Err(Error::config("model channels must be greater than 0"));
        }
        if self.num_classes < 2 {
            return Err(Error::config("model needs at least two classes"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::config("model dropout must be in [0.0, 1.0)"));
        }
        Ok(())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            num_classes: 2,
            hidden_channels: 16,
            dropout: 0.0,
        }
    }
}

/// Optimizer types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerType {
    AdamW,
    SGD,
}

/// Optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Optimizer type
    pub optimizer_type: OptimizerType,

    /// Base learning rate
    pub learning_rate: f64,

    /// Weight decay
    pub weight_decay: f64,

    /// AdamW beta1
    pub beta1: f64,

    /// AdamW beta2
    pub beta2: f64,

    /// AdamW epsilon
    pub epsilon: f64,

    /// SGD momentum
    pub momentum: f64,

    /// Learning rate multiplier of the encoder group
    pub encoder_lr_scale: f64,

    /// Learning rate multiplier of the head group
    pub head_lr_scale: f64,
}

impl OptimizerConfig {
    /// Validate optimizer hyperparameters
    pub fn validate(&self) -> Result<()> {
        if self.learning_rate <= 0.0 {
            return Err(Error::config("Learning rate must be positive"));
        }
        if self.weight_decay < 0.0 {
            return Err(Error::config("Weight decay must be non-negative"));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(Error::config("Adam betas must be in [0.0, 1.0)"));
        }
        if self.encoder_lr_scale < 0.0 || self.head_lr_scale < 0.0 {
            return Err(Error::config("Learning rate scales must be non-negative"));
        }
        Ok(())
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer_type: OptimizerType::AdamW,
            learning_rate: 1e-4,
            weight_decay: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            momentum: 0.9,
            encoder_lr_scale: 1.0,
            head_lr_scale: 1.0,
        }
    }
}

/// Iteration schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Linear warmup length; 0 disables warmup
    pub warmup_iterations: usize,

    /// Number of training epochs
    pub epochs: usize,

    /// Global iteration budget; 0 means unlimited
    pub max_iteration: usize,

    /// Log every this many iterations
    pub print_freq: usize,

    /// Evaluate every this many epochs
    pub eval_every: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            warmup_iterations: 1500,
            epochs: 100,
            max_iteration: 0,
            print_freq: 10,
            eval_every: 1,
        }
    }
}

/// Batching and augmentation of training data
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Batch size
    pub batch_size: usize,

    /// Whether to shuffle training data
    pub shuffle: bool,

    /// Whether to drop the last incomplete batch
    pub drop_last: bool,

    /// Augmentation producing the paired view
    pub augment: IntensityAugment,
}

impl DataConfig {
    /// Loader settings for training batches
    pub fn loader_config(&self, seed: u64) -> DataLoaderConfig {
        DataLoaderConfig {
            batch_size: self.batch_size,
            shuffle: self.shuffle,
            drop_last: self.drop_last,
            seed,
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            shuffle: true,
            drop_last: false,
            augment: IntensityAugment::default(),
        }
    }
}

/// Uncertainty-guided mixup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixupConfig {
    /// Use the mixup runner instead of the standard one
    pub enabled: bool,

    /// Dump a visual snapshot every this many iterations
    pub visual_freq: usize,

    /// Gaussian blur kernel size
    pub blur_kernel: usize,

    /// Gaussian blur sigma
    pub blur_sigma: f64,

    /// Coverage below which the inputs are blended instead of summed
    pub coverage_threshold: f64,

    /// Handling of batches without foreground
    pub zero_foreground: ZeroForegroundPolicy,
}

impl Default for MixupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            visual_freq: 200,
            blur_kernel: 29,
            blur_sigma: 10.0,
            coverage_threshold: 0.5,
            zero_foreground: ZeroForegroundPolicy::ForceSum,
        }
    }
}

/// Mixed precision training settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MixedPrecisionConfig {
    /// Enable loss scaling in the standard runner
    pub enabled: bool,

    /// Initial loss scale
    pub init_scale: f64,

    /// Scale growth factor
    pub growth_factor: f64,

    /// Scale backoff factor
    pub backoff_factor: f64,

    /// Clean steps between growths
    pub growth_interval: usize,
}

impl Default for MixedPrecisionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            init_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }
}

/// Loss weighting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    /// Weight per named loss term
    pub weights: BTreeMap<String, f64>,

    /// Smoothing term of the soft Dice loss
    pub dice_smooth: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        let weights = [("loss_ce", 1.0), ("loss_dice", 1.0)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        Self {
            weights,
            dice_smooth: 1e-5,
        }
    }
}

/// Volumetric evaluation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Class names, index 0 is background
    pub label_names: Vec<String>,

    /// Keep reassembled volumes in the prediction outcome
    pub save_prediction: bool,

    /// Tag stamped into evaluation reports
    pub mode: String,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            label_names: vec!["background".to_string(), "foreground".to_string()],
            save_prediction: false,
            mode: "base".to_string(),
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// `cpu`, `cuda:<n>` or `metal:<n>`
    pub device: String,

    /// Seed for shuffling and augmentation
    pub seed: u64,
}

impl RuntimeConfig {
    /// Resolve the configured device
    pub fn device(&self) -> Result<Device> {
        let (kind, ordinal) = match self.device.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| Error::config(format!("bad device ordinal in '{}'", self.device)))?;
                (kind, ordinal)
            }
            None => (self.device.as_str(), 0),
        };
        match kind {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::new_cuda(ordinal)?),
            "metal" => Ok(Device::new_metal(ordinal)?),
            other => Err(Error::config(format!("unknown device '{other}'"))),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: "cpu".to_string(),
            seed: 42,
        }
    }
}

/// Output locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Root of evaluation outputs; slices go under `vis_save`
    pub output_dir: PathBuf,

    /// Mixup snapshots; disabled when unset
    pub visual_dir: Option<PathBuf>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("outputs"),
            visual_dir: None,
        }
    }
}

impl TrainConfig {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let config: Self = if is_json(path) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_json(path) {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yaml::to_string(self)?
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.optimizer.validate()?;
        self.data.augment.validate()?;

        if self.schedule.epochs == 0 {
            return Err(Error::config("Number of epochs must be greater than 0"));
        }
        if self.schedule.print_freq == 0 || self.schedule.eval_every == 0 {
            return Err(Error::config("print_freq and eval_every must be greater than 0"));
        }
        if self.data.batch_size == 0 {
            return Err(Error::config("Batch size must be greater than 0"));
        }
        if self.mixup.visual_freq == 0 {
            return Err(Error::config("visual_freq must be greater than 0"));
        }
        if self.mixup.blur_kernel % 2 == 0 || self.mixup.blur_sigma <= 0.0 {
            return Err(Error::config("blur kernel must be odd and sigma positive"));
        }
        if self.loss.weights.is_empty() {
            return Err(Error::config("loss weight table is empty"));
        }
        if self.evaluation.label_names.len() != self.model.num_classes {
            return Err(Error::config(format!(
                "{} label names for {} classes",
                self.evaluation.label_names.len(),
                self.model.num_classes
            )));
        }
        if self.mixed_precision.enabled
            && (self.mixed_precision.init_scale <= 0.0 || self.mixed_precision.growth_interval == 0)
        {
            return Err(Error::config("loss scale and growth interval must be positive"));
        }
        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some("json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TrainConfig::default();
        config.validate().unwrap();
        assert_eq!(config.schedule.warmup_iterations, 1500);
        assert_eq!(config.mixup.visual_freq, 200);
        assert_eq!(config.mixup.coverage_threshold, 0.5);
        assert_eq!(config.loss.weights.get("loss_ce"), Some(&1.0));
    }

    #[test]
    fn test_round_trip_json_and_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TrainConfig::default();
        config.schedule.epochs = 3;
        config.mixup.zero_foreground = ZeroForegroundPolicy::Propagate;

        for name in ["config.json", "config.yaml"] {
            let path = dir.path().join(name);
            config.to_file(&path).unwrap();
            let loaded = TrainConfig::from_file(&path).unwrap();
            assert_eq!(loaded.schedule.epochs, 3);
            assert_eq!(loaded.mixup.zero_foreground, ZeroForegroundPolicy::Propagate);
        }
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.yaml");
        std::fs::write(&path, "schedule:\n  epochs: 7\n").unwrap();
        let config = TrainConfig::from_file(&path).unwrap();
        assert_eq!(config.schedule.epochs, 7);
        assert_eq!(config.schedule.print_freq, 10);
    }

    #[test]
    fn test_validate_rejects_label_mismatch() {
        let mut config = TrainConfig::default();
        config.model.num_classes = 3;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_device_parsing() {
        let mut runtime = RuntimeConfig::default();
        assert!(runtime.device().unwrap().is_cpu());
        runtime.device = "tpu".to_string();
        assert!(runtime.device().is_err());
    }
}

//! Optimizers with parameter groups, and the loss scaler used for mixed
//! precision
//!
//! Optimizers update `candle_core::Var`s in place from a `GradStore`. Each
//! parameter group carries its own learning rate, which the warmup schedule
//! rewrites through [`Optimizer::param_groups_mut`].

pub mod adamw;
pub mod grad_scaler;
pub mod sgd;

pub use adamw::AdamWOptimizer;
pub use grad_scaler::GradScaler;
pub use sgd::SGDOptimizer;

use candle_core::backprop::GradStore;
use candle_core::Var;
use tracing::info;

use crate::error::{Error, Result};
use crate::training::config::{OptimizerConfig, OptimizerType};

/// Trait for optimizers
pub trait Optimizer: Send {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Apply one update from accumulated gradients
    fn step(&mut self, gradients: &GradStore) -> Result<()>;

    /// Parameter groups
    fn param_groups(&self) -> &[ParamGroup];

    /// Mutable parameter groups, for learning-rate schedules
    fn param_groups_mut(&mut self) -> &mut [ParamGroup];

    /// Number of updates applied so far
    fn step_count(&self) -> usize;

    /// Learning rate of the first group
    fn learning_rate(&self) -> f64 {
        self.param_groups().first().map(|g| g.lr).unwrap_or(0.0)
    }

    /// Every variable across all groups
    fn vars(&self) -> Vec<Var> {
        self.param_groups()
            .iter()
            .flat_map(|g| g.vars.iter().cloned())
            .collect()
    }
}

/// A set of variables sharing a learning rate
#[derive(Debug, Clone)]
pub struct ParamGroup {
    /// Group name
    pub name: String,
    /// Variables updated with this group's settings
    pub vars: Vec<Var>,
    /// Current learning rate
    pub lr: f64,
    /// Multiplier applied to the base learning rate
    pub lr_scale: f64,
}

impl ParamGroup {
    /// Create a group whose learning rate starts at `base_lr * lr_scale`
    pub fn new(name: impl Into<String>, vars: Vec<Var>, base_lr: f64, lr_scale: f64) -> Self {
        Self {
            name: name.into(),
            vars,
            lr: base_lr * lr_scale,
            lr_scale,
        }
    }
}

/// Create optimizer from configuration
pub fn create_optimizer(
    config: &OptimizerConfig,
    groups: Vec<ParamGroup>,
) -> Result<Box<dyn Optimizer>> {
    config.validate()?;
    if groups.iter().all(|g| g.vars.is_empty()) {
        return Err(Error::config("optimizer has no parameters"));
    }

    info!(
        "Creating {:?} optimizer over {} groups with lr={}",
        config.optimizer_type,
        groups.len(),
        config.learning_rate
    );

    let optimizer: Box<dyn Optimizer> = match config.optimizer_type {
        OptimizerType::AdamW => Box::new(AdamWOptimizer::new(
            groups,
            config.beta1,
            config.beta2,
            config.epsilon,
            config.weight_decay,
        )),
        OptimizerType::SGD => Box::new(SGDOptimizer::new(
            groups,
            config.momentum,
            config.weight_decay,
        )),
    };
    Ok(optimizer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    #[test]
    fn test_param_group_initial_lr() {
        let var = Var::from_tensor(&Tensor::zeros(2, candle_core::DType::F32, &Device::Cpu).unwrap()).unwrap();
        let group = ParamGroup::new("head", vec![var], 1e-3, 0.5);
        assert_eq!(group.lr, 5e-4);
        assert_eq!(group.lr_scale, 0.5);
    }

    #[test]
    fn test_create_optimizer_rejects_empty_groups() {
        let config = OptimizerConfig::default();
        let result = create_optimizer(&config, vec![ParamGroup::new("empty", vec![], 1e-3, 1.0)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_create_optimizer_by_type() {
        let var = Var::from_tensor(&Tensor::zeros(2, candle_core::DType::F32, &Device::Cpu).unwrap()).unwrap();
        let mut config = OptimizerConfig::default();
        config.optimizer_type = OptimizerType::SGD;
        config.momentum = 0.0;
        let optimizer = create_optimizer(&config, vec![ParamGroup::new("all", vec![var], 0.1, 1.0)]).unwrap();
        assert_eq!(optimizer.name(), "sgd");
        assert_eq!(optimizer.vars().len(), 1);
        assert_eq!(optimizer.learning_rate(), 0.1);
    }

    #[test]
    fn test_create_optimizer_sgd_momentum_name() {
        let var = Var::from_tensor(&Tensor::zeros(2, candle_core::DType::F32, &Device::Cpu).unwrap()).unwrap();
        let mut config = OptimizerConfig::default();
        config.optimizer_type = OptimizerType::SGD;
        let optimizer = create_optimizer(&config, vec![ParamGroup::new("all", vec![var], 0.1, 1.0)]).unwrap();
        assert_eq!(optimizer.name(), "sgd_momentum");
    }
}

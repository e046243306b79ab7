//! SGD optimizer implementation with momentum
//!
//! This module provides the Stochastic Gradient Descent optimizer with
//! optional momentum and weight decay support.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, TensorId};

use super::{Optimizer, ParamGroup};
use crate::error::Result;

/// SGD optimizer with momentum
pub struct SGDOptimizer {
    /// Parameter groups
    groups: Vec<ParamGroup>,

    /// Momentum coefficient
    momentum: f64,

    /// Weight decay coefficient
    weight_decay: f64,

    /// Current step count
    step_count: usize,

    /// Momentum buffers
    momentum_buffers: HashMap<TensorId, Tensor>,
}

impl SGDOptimizer {
    /// Create a new SGD optimizer
    pub fn new(groups: Vec<ParamGroup>, momentum: f64, weight_decay: f64) -> Self {
        Self {
            groups,
            momentum,
            weight_decay,
            step_count: 0,
            momentum_buffers: HashMap::new(),
        }
    }

    fn update_parameter(&mut self, param: &Tensor, grad: &Tensor, lr: f64) -> Result<Tensor> {
        let effective_grad = if self.weight_decay > 0.0 {
            (grad + (param * self.weight_decay)?)?
        } else {
            grad.clone()
        };

        let update = if self.momentum > 0.0 {
            // v_t = μ v_{t-1} + g_t
            let buffer = match self.momentum_buffers.remove(&param.id()) {
                Some(previous) => ((previous * self.momentum)? + &effective_grad)?,
                None => effective_grad,
            };
            self.momentum_buffers.insert(param.id(), buffer.clone());
            buffer
        } else {
            effective_grad
        };

        Ok((param - (update * lr)?)?)
    }
}

impl Optimizer for SGDOptimizer {
    fn name(&self) -> &str {
        if self.momentum > 0.0 {
            "sgd_momentum"
        } else {
            "sgd"
        }
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.step_count += 1;

        let groups = self.groups.clone();
        for group in &groups {
            for var in &group.vars {
                if let Some(grad) = gradients.get(var.as_tensor()) {
                    let next = self.update_parameter(var.as_tensor(), grad, group.lr)?;
                    var.set(&next)?;
                }
            }
        }
        Ok(())
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn step_count(&self) -> usize {
        self.step_count
    }
}

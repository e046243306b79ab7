//! AdamW optimizer implementation
//!
//! Decoupled weight decay, bias-corrected moment estimates, per-group
//! learning rates.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, TensorId};

use super::{Optimizer, ParamGroup};
use crate::error::Result;

/// AdamW optimizer with decoupled weight decay
pub struct AdamWOptimizer {
    /// Parameter groups
    groups: Vec<ParamGroup>,

    /// Beta1 parameter (momentum)
    beta1: f64,

    /// Beta2 parameter (RMSprop)
    beta2: f64,

    /// Epsilon for numerical stability
    epsilon: f64,

    /// Weight decay coefficient
    weight_decay: f64,

    /// Current step count
    step_count: usize,

    /// First and second moment estimates per variable
    moments: HashMap<TensorId, (Tensor, Tensor)>,
}

impl AdamWOptimizer {
    /// Create a new AdamW optimizer
    pub fn new(
        groups: Vec<ParamGroup>,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
        weight_decay: f64,
    ) -> Self {
        Self {
            groups,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            step_count: 0,
            moments: HashMap::new(),
        }
    }

    /// Compute the new value of one parameter
    fn update_parameter(&mut self, param: &Tensor, grad: &Tensor, lr: f64) -> Result<Tensor> {
        let (momentum, variance) = match self.moments.remove(&param.id()) {
            Some(state) => state,
            None => (param.zeros_like()?, param.zeros_like()?),
        };

        // m_t = β₁ m_{t-1} + (1 - β₁) g_t
        let momentum = ((momentum * self.beta1)? + (grad * (1.0 - self.beta1))?)?;
        // v_t = β₂ v_{t-1} + (1 - β₂) g_t²
        let variance = ((variance * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

        let t = self.step_count as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);

        let corrected_momentum = (&momentum / bias_correction1)?;
        let denominator = ((&variance / bias_correction2)?.sqrt()? + self.epsilon)?;
        let update = corrected_momentum.div(&denominator)?;

        // θ_t = θ_{t-1} (1 - α λ) - α m̂_t / (√v̂_t + ε)
        let decayed = (param * (1.0 - lr * self.weight_decay))?;
        let next = (decayed - (update * lr)?)?;

        self.moments.insert(param.id(), (momentum, variance));
        Ok(next)
    }
}

impl Optimizer for AdamWOptimizer {
    fn name(&self) -> &str {
        "adamw"
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

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{Device, Var};

    #[test]
    fn test_adamw_optimizer_creation() {
        let optimizer = AdamWOptimizer::new(vec![], 0.9, 0.999, 1e-8, 0.01);
        assert_eq!(optimizer.name(), "adamw");
        assert_eq!(optimizer.learning_rate(), 0.0);
        assert_eq!(optimizer.step_count(), 0);
    }

    #[test]
    fn test_adamw_first_step_moves_by_lr() {
        let var = Var::new(&[1f32, -1.0], &Device::Cpu).unwrap();
        let group = ParamGroup::new("all", vec![var.clone()], 0.1, 1.0);
        let mut optimizer = AdamWOptimizer::new(vec![group], 0.9, 0.999, 1e-8, 0.0);

        let loss = (var.as_tensor() * 3.0).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        optimizer.step(&grads).unwrap();

        // The first bias-corrected Adam update has magnitude lr
        let values: Vec<f32> = var.as_tensor().to_vec1().unwrap();
        assert_relative_eq!(values[0], 0.9, epsilon = 1e-5);
        assert_relative_eq!(values[1], -1.1, epsilon = 1e-5);
        assert_eq!(optimizer.step_count(), 1);
    }

    #[test]
    fn test_adamw_skips_vars_without_grad() {
        let used = Var::new(&[1f32], &Device::Cpu).unwrap();
        let unused = Var::new(&[5f32], &Device::Cpu).unwrap();
        let group = ParamGroup::new("all", vec![used.clone(), unused.clone()], 0.1, 1.0);
        let mut optimizer = AdamWOptimizer::new(vec![group], 0.9, 0.999, 1e-8, 0.01);

        let grads = used.as_tensor().sum_all().unwrap().backward().unwrap();
        optimizer.step(&grads).unwrap();

        let unchanged: Vec<f32> = unused.as_tensor().to_vec1().unwrap();
        assert_eq!(unchanged, vec![5.0]);
    }
}

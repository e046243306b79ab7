//! Gradient accumulation across several backward passes
//!
//! The mixup runner back-propagates three losses before a single optimizer
//! step. Instead of relying on gradients silently summing inside parameter
//! buffers, each backward pass produces its own `GradStore` which is merged
//! into a pending store here; [`GradientAccumulator::commit`] then applies
//! one optimizer update from the sum.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use tracing::trace;

use crate::error::{Error, Result};
use crate::training::optimizers::Optimizer;

/// Pending gradients for a fixed set of variables
pub struct GradientAccumulator {
    vars: Vec<Var>,
    pending: Option<GradStore>,
    branches: usize,
}

impl GradientAccumulator {
    /// Track gradients of `vars`
    pub fn new(vars: Vec<Var>) -> Self {
        Self {
            vars,
            pending: None,
            branches: 0,
        }
    }

    /// Drop any pending gradients
    pub fn zero_grad(&mut self) {
        self.pending = None;
        self.branches = 0;
    }

    /// Back-propagate `loss` and add its gradients to the pending sum
    pub fn accumulate(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.accumulate_grads(grads)
    }

    /// Add an already computed gradient store to the pending sum
    pub fn accumulate_grads(&mut self, mut grads: GradStore) -> Result<()> {
        self.branches += 1;
        let Some(pending) = self.pending.as_mut() else {
            self.pending = Some(grads);
            trace!("Started gradient accumulation");
            return Ok(());
        };

        for var in &self.vars {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                let merged = match pending.remove(var.as_tensor()) {
                    Some(previous) => (previous + grad)?,
                    None => grad,
                };
                pending.insert(var.as_tensor(), merged);
            }
        }
        trace!("Accumulated branch {}", self.branches);
        Ok(())
    }

    /// Number of backward passes accumulated since the last reset
    pub fn branches(&self) -> usize {
        self.branches
    }

    /// Pending gradient of `var`
    pub fn grad(&self, var: &Var) -> Option<&Tensor> {
        self.pending.as_ref().and_then(|p| p.get(var.as_tensor()))
    }

    /// Multiply every pending gradient by `factor`
    pub fn scale_pending(&mut self, factor: f64) -> Result<()> {
        if let Some(pending) = self.pending.as_mut() {
            for var in &self.vars {
                if let Some(grad) = pending.remove(var.as_tensor()) {
                    pending.insert(var.as_tensor(), grad.affine(factor, 0.0)?);
                }
            }
        }
        Ok(())
    }

    /// Whether every pending gradient is finite
    pub fn all_finite(&self) -> Result<bool> {
        for var in &self.vars {
            if let Some(grad) = self.grad(var) {
                let total = grad.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()?;
                if !total.is_finite() {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Apply one optimizer step from the pending sum and reset
    pub fn commit(&mut self, optimizer: &mut dyn Optimizer) -> Result<()> {
        let grads = self
            .pending
            .take()
            .ok_or_else(|| Error::training("commit called with no accumulated gradients"))?;
        optimizer.step(&grads)?;
        self.branches = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::optimizers::{ParamGroup, SGDOptimizer};
    use candle_core::Device;

    #[test]
    fn test_gradients_sum_across_branches() {
        let var = Var::new(&[2f32], &Device::Cpu).unwrap();
        let mut accumulator = GradientAccumulator::new(vec![var.clone()]);

        accumulator.accumulate(&(var.as_tensor() * 3.0).unwrap().sum_all().unwrap()).unwrap();
        accumulator.accumulate(&var.as_tensor().sqr().unwrap().sum_all().unwrap()).unwrap();
        assert_eq!(accumulator.branches(), 2);

        let grad: Vec<f32> = accumulator.grad(&var).unwrap().to_vec1().unwrap();
        assert_eq!(grad, vec![7.0]);
    }

    #[test]
    fn test_commit_steps_once_and_resets() {
        let var = Var::new(&[1f32], &Device::Cpu).unwrap();
        let mut optimizer =
            SGDOptimizer::new(vec![ParamGroup::new("all", vec![var.clone()], 0.5, 1.0)], 0.0, 0.0);
        let mut accumulator = GradientAccumulator::new(vec![var.clone()]);

        for _ in 0..3 {
            accumulator.accumulate(&var.as_tensor().sum_all().unwrap()).unwrap();
        }
        accumulator.commit(&mut optimizer).unwrap();

        assert_eq!(optimizer.step_count(), 1);
        let value: Vec<f32> = var.as_tensor().to_vec1().unwrap();
        assert_eq!(value, vec![-0.5]);
        assert_eq!(accumulator.branches(), 0);
        assert!(matches!(accumulator.commit(&mut optimizer), Err(Error::Training(_))));
    }

    #[test]
    fn test_scale_and_finiteness() {
        let var = Var::new(&[1f32], &Device::Cpu).unwrap();
        let mut accumulator = GradientAccumulator::new(vec![var.clone()]);
        accumulator.accumulate(&(var.as_tensor() * 4.0).unwrap().sum_all().unwrap()).unwrap();
        accumulator.scale_pending(0.25).unwrap();
        let grad: Vec<f32> = accumulator.grad(&var).unwrap().to_vec1().unwrap();
        assert_eq!(grad, vec![1.0]);
        assert!(accumulator.all_finite().unwrap());

        accumulator.scale_pending(f64::INFINITY).unwrap();
        assert!(!accumulator.all_finite().unwrap());
    }
}

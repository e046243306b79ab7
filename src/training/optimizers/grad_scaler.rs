//! Dynamic loss scaling for mixed precision training

use candle_core::Tensor;
use tracing::{debug, warn};

use super::Optimizer;
use crate::error::Result;
use crate::training::accumulate::GradientAccumulator;
use crate::training::config::MixedPrecisionConfig;

/// Loss scaler with overflow backoff and periodic growth
#[derive(Debug, Clone)]
pub struct GradScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    growth_tracker: usize,
    found_inf: bool,
    skipped_steps: usize,
}

impl GradScaler {
    /// Create a scaler from the mixed precision settings
    pub fn new(config: &MixedPrecisionConfig) -> Self {
        Self {
            scale: config.init_scale,
            growth_factor: config.growth_factor,
            backoff_factor: config.backoff_factor,
            growth_interval: config.growth_interval,
            growth_tracker: 0,
            found_inf: false,
            skipped_steps: 0,
        }
    }

    /// Current scale
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Optimizer steps skipped because of non-finite gradients
    pub fn skipped_steps(&self) -> usize {
        self.skipped_steps
    }

    /// Multiply a loss by the current scale before back-propagation
    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        Ok(loss.affine(self.scale, 0.0)?)
    }

    /// Unscale pending gradients and step unless any of them overflowed
    ///
    /// Returns whether the optimizer stepped.
    pub fn step(
        &mut self,
        accumulator: &mut GradientAccumulator,
        optimizer: &mut dyn Optimizer,
    ) -> Result<bool> {
        accumulator.scale_pending(1.0 / self.scale)?;
        self.found_inf = !accumulator.all_finite()?;
        if self.found_inf {
            warn!("Non-finite gradients at scale {}, skipping step", self.scale);
            accumulator.zero_grad();
            self.skipped_steps += 1;
            return Ok(false);
        }
        accumulator.commit(optimizer)?;
        Ok(true)
    }

    /// Adjust the scale after a step
    pub fn update(&mut self) {
        if self.found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
            debug!("Loss scale backed off to {}", self.scale);
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
                debug!("Loss scale grown to {}", self.scale);
            }
        }
        self.found_inf = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::optimizers::{ParamGroup, SGDOptimizer};
    use candle_core::{Device, Var};

    fn setup(value: f32) -> (Var, SGDOptimizer, GradientAccumulator) {
        let var = Var::new(&[value], &Device::Cpu).unwrap();
        let optimizer =
            SGDOptimizer::new(vec![ParamGroup::new("all", vec![var.clone()], 1.0, 1.0)], 0.0, 0.0);
        let accumulator = GradientAccumulator::new(vec![var.clone()]);
        (var, optimizer, accumulator)
    }

    #[test]
    fn test_scaled_step_applies_unscaled_gradient() {
        let (var, mut optimizer, mut accumulator) = setup(1.0);
        let mut scaler = GradScaler::new(&MixedPrecisionConfig::default());
        assert_eq!(scaler.scale(), 65536.0);

        let loss = scaler.scale_loss(&var.as_tensor().sum_all().unwrap()).unwrap();
        accumulator.accumulate(&loss).unwrap();
        assert!(scaler.step(&mut accumulator, &mut optimizer).unwrap());
        scaler.update();

        let value: Vec<f32> = var.as_tensor().to_vec1().unwrap();
        assert_eq!(value, vec![0.0]);
        assert_eq!(scaler.scale(), 65536.0);
    }

    #[test]
    fn test_overflow_skips_and_backs_off() {
        let (var, mut optimizer, mut accumulator) = setup(1.0);
        let mut scaler = GradScaler::new(&MixedPrecisionConfig::default());

        let loss = (var.as_tensor() * f64::INFINITY).unwrap().sum_all().unwrap();
        accumulator.accumulate(&loss).unwrap();
        assert!(!scaler.step(&mut accumulator, &mut optimizer).unwrap());
        scaler.update();

        assert_eq!(optimizer.step_count(), 0);
        assert_eq!(scaler.scale(), 32768.0);
        assert_eq!(scaler.skipped_steps(), 1);
    }

    #[test]
    fn test_growth_after_interval() {
        let config = MixedPrecisionConfig {
            growth_interval: 2,
            ..Default::default()
        };
        let mut scaler = GradScaler::new(&config);
        scaler.update();
        assert_eq!(scaler.scale(), 65536.0);
        scaler.update();
        assert_eq!(scaler.scale(), 131072.0);
    }
}

//! Linear learning-rate warmup

use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::training::accumulate::GradientAccumulator;
use crate::training::data::BatchSource;
use crate::training::epoch::StepContext;
use crate::training::loss::{loss_values, weighted_sum_strict};

/// Learning rate of a group at `iteration` of `warmup_iterations`
pub fn warmup_lr(iteration: usize, warmup_iterations: usize, base_lr: f64, lr_scale: f64) -> f64 {
    iteration as f64 / warmup_iterations as f64 * base_lr * lr_scale
}

/// Train until `warmup_iterations` steps have been taken, ramping every
/// group's learning rate linearly up to `base_lr * lr_scale`
///
/// Restarts the loader as often as needed and returns exactly
/// `warmup_iterations`.
#[instrument(skip_all, fields(warmup_iterations = warmup_iterations))]
pub fn run_warmup(
    ctx: &mut StepContext<'_>,
    loader: &mut dyn BatchSource,
    base_lr: f64,
    warmup_iterations: usize,
) -> Result<usize> {
    if warmup_iterations == 0 {
        return Ok(0);
    }
    if loader.num_batches() == 0 {
        return Err(Error::training("warmup needs a non-empty data loader"));
    }

    ctx.model.set_training(true);
    let mut accumulator = GradientAccumulator::new(ctx.optimizer.vars());
    let mut cur_iteration = 0;
    let header = format!("WarmUp with max iteration: {warmup_iterations}");

    loop {
        let mut progress = ctx.logger.log_every(loader.num_batches(), ctx.print_freq, header.clone());
        for batch in loader.epoch() {
            let batch = batch?.to_device(ctx.device)?;

            cur_iteration += 1;
            for group in ctx.optimizer.param_groups_mut() {
                group.lr = warmup_lr(cur_iteration, warmup_iterations, base_lr, group.lr_scale);
            }

            let logits = ctx.model.forward(&batch.images)?;
            let losses = ctx.criterion.get_loss(&logits, &batch.labels)?;
            let total = weighted_sum_strict(&losses, ctx.criterion.weight_dict(), ctx.device)?;

            accumulator.zero_grad();
            accumulator.accumulate(&total)?;
            accumulator.commit(ctx.optimizer)?;

            ctx.record(&loss_values(&losses)?);
            progress.tick(ctx.logger);

            if cur_iteration >= warmup_iterations {
                info!(
                    "WarmUp end with iteration {} and current lr {}",
                    cur_iteration,
                    ctx.optimizer.learning_rate()
                );
                return Ok(cur_iteration);
            }
        }
        ctx.logger.synchronize_between_processes();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_lr_ramp() {
        assert_eq!(warmup_lr(1, 4, 0.1, 1.0), 0.025);
        assert_eq!(warmup_lr(4, 4, 0.1, 0.5), 0.05);
    }
}

//! Shared runner context and the standard single-branch epoch runner

use candle_core::Device;
use tracing::{info, instrument};

use crate::error::Result;
use crate::training::accumulate::GradientAccumulator;
use crate::training::data::BatchSource;
use crate::training::loss::{loss_values, weighted_sum_strict, Criterion};
use crate::training::metrics::{MetricLogger, SmoothedValue};
use crate::training::model::SegmentationModel;
use crate::training::optimizers::{GradScaler, Optimizer};

/// Collaborators every training runner works with
pub struct StepContext<'a> {
    /// Network being trained
    pub model: &'a mut dyn SegmentationModel,
    /// Loss producer and weight table
    pub criterion: &'a dyn Criterion,
    /// Parameter update rule
    pub optimizer: &'a mut dyn Optimizer,
    /// Compute device batches are moved to
    pub device: &'a Device,
    /// Meters for this pass
    pub logger: &'a mut MetricLogger,
    /// Log every this many iterations
    pub print_freq: usize,
}

impl StepContext<'_> {
    /// Record loss values and the first group's learning rate
    ///
    /// The `lr` meter keeps a single value so it always shows the current rate.
    pub(crate) fn record(&mut self, values: &std::collections::BTreeMap<String, f64>) {
        self.logger.update_many(values);
        if self.logger.meter("lr").is_none() {
            self.logger.add_meter("lr", SmoothedValue::new(1));
        }
        let lr = self.optimizer.learning_rate();
        self.logger.update("lr", lr);
    }
}

/// One pass over `loader` with a single forward/backward/step per batch
///
/// Every loss key must be weighted. Stops once `max_iteration` (when
/// positive) is reached and returns the advanced iteration counter.
#[instrument(skip_all, fields(epoch = epoch))]
pub fn train_one_epoch(
    ctx: &mut StepContext<'_>,
    loader: &mut dyn BatchSource,
    epoch: usize,
    cur_iteration: usize,
    max_iteration: usize,
    mut grad_scaler: Option<&mut GradScaler>,
) -> Result<usize> {
    ctx.model.set_training(true);
    let mut accumulator = GradientAccumulator::new(ctx.optimizer.vars());
    let mut cur_iteration = cur_iteration;

    let mut progress = ctx
        .logger
        .log_every(loader.num_batches(), ctx.print_freq, format!("Epoch: [{epoch}]"));

    for batch in loader.epoch() {
        let batch = batch?.to_device(ctx.device)?;

        let logits = ctx.model.forward(&batch.images)?;
        let losses = ctx.criterion.get_loss(&logits, &batch.labels)?;
        let total = weighted_sum_strict(&losses, ctx.criterion.weight_dict(), ctx.device)?;

        accumulator.zero_grad();
        match grad_scaler.as_deref_mut() {
            Some(scaler) => {
                accumulator.accumulate(&scaler.scale_loss(&total)?)?;
                scaler.step(&mut accumulator, ctx.optimizer)?;
                scaler.update();
            }
            None => {
                accumulator.accumulate(&total)?;
                accumulator.commit(ctx.optimizer)?;
            }
        }

        ctx.record(&loss_values(&losses)?);
        progress.tick(ctx.logger);

        cur_iteration += 1;
        if max_iteration > 0 && cur_iteration >= max_iteration {
            break;
        }
    }
    progress.finish();

    ctx.logger.synchronize_between_processes();
    info!("Averaged stats: {}", ctx.logger.summary());
    Ok(cur_iteration)
}

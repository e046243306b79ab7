//! Uncertainty-guided mixup training
//!
//! Every batch runs three branches through the same model: the clean view,
//! the augmented view, and a mix of the two built from where the model is
//! uncertain. Each branch back-propagates its filtered weighted loss into a
//! shared [`GradientAccumulator`], and one optimizer step follows the third.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{IndexOp, Tensor};
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::training::accumulate::GradientAccumulator;
use crate::training::config::MixupConfig;
use crate::training::data::{first_image_plane, Batch, BatchSource};
use crate::training::epoch::StepContext;
use crate::training::loss::{loss_values, weighted_sum_filtered, LossDict};
use crate::training::uncertainty::{
    coverage_ratio, decide_mix, fuse_guidance, mix_inputs, predicted_classes, uncertainty_map,
    GaussianBlur, MixDecision, ZeroForegroundPolicy,
};
use crate::training::visual::{dump_snapshot, VisualSink, VisualSnapshot};

/// Where periodic snapshots go
pub struct VisualTarget<'a> {
    /// Root of the snapshot tree
    pub dir: &'a Path,
    /// Writer for arrays and figures
    pub sink: &'a mut dyn VisualSink,
}

/// Outcome of one mixup iteration
#[derive(Debug, Clone)]
pub struct MixupStepRecord {
    /// `k`, `k_aug` and `k_mix` for every weighted loss key `k`
    pub losses: BTreeMap<String, f64>,
    /// Every loss of the augmented branch
    pub aug_losses: BTreeMap<String, f64>,
    /// How the mixed input was built
    pub decision: MixDecision,
    /// Foreground coverage of the blend mask
    pub coverage: Option<f64>,
}

/// Outcome of one mixup epoch
#[derive(Debug, Clone)]
pub struct MixupEpochOutcome {
    /// Iteration counter after the epoch
    pub iteration: usize,
    /// Augmented-branch losses of the last processed batch
    pub last_aug_losses: Option<BTreeMap<String, f64>>,
}

/// Runs uncertainty-guided mixup iterations
#[derive(Debug, Clone)]
pub struct MixupRunner {
    blur: GaussianBlur,
    coverage_threshold: f64,
    zero_foreground: ZeroForegroundPolicy,
    visual_freq: usize,
}

impl MixupRunner {
    /// Build a runner from the mixup configuration
    pub fn new(config: &MixupConfig) -> Result<Self> {
        if config.visual_freq == 0 {
            return Err(Error::config("visual_freq must be greater than 0"));
        }
        Ok(Self {
            blur: GaussianBlur::new(config.blur_kernel, config.blur_sigma)?,
            coverage_threshold: config.coverage_threshold,
            zero_foreground: config.zero_foreground,
            visual_freq: config.visual_freq,
        })
    }

    /// Three-branch forward/backward on one batch followed by a single
    /// optimizer step
    ///
    /// When `snapshot` is given, first-sample panels of every intermediate
    /// are pushed into it.
    pub fn mixup_step(
        &self,
        ctx: &mut StepContext<'_>,
        accumulator: &mut GradientAccumulator,
        batch: &Batch,
        mut snapshot: Option<&mut VisualSnapshot>,
    ) -> Result<MixupStepRecord> {
        let clean = &batch.images;
        let aug = batch.require_aug()?;
        let labels = &batch.labels;

        if let Some(snapshot) = snapshot.as_deref_mut() {
            snapshot.push("CFAT", &first_image_plane(clean)?);
            snapshot.push("LFAT", &first_image_plane(aug)?);
            snapshot.push("GT", &labels.i(0)?);
        }

        accumulator.zero_grad();

        // Clean branch
        let (clean_logits, clean_losses) = self.branch(ctx, accumulator, clean, labels)?;
        let clean_uncertainty = uncertainty_map(&ctx.model.forward(clean)?)?;
        if let Some(snapshot) = snapshot.as_deref_mut() {
            snapshot.push("CFAT_pred", &predicted_classes(&clean_logits)?.i(0)?);
            snapshot.push("uncertainty_map_CFAT", &clean_uncertainty.i((0, 0))?);
        }

        // Augmented branch
        let (aug_logits, aug_losses) = self.branch(ctx, accumulator, aug, labels)?;
        let aug_uncertainty = uncertainty_map(&ctx.model.forward(aug)?)?;
        if let Some(snapshot) = snapshot.as_deref_mut() {
            snapshot.push("LFAT_pred", &predicted_classes(&aug_logits)?.i(0)?);
            snapshot.push("uncertainty_map_LFAT", &aug_uncertainty.i((0, 0))?);
        }

        let guidance = fuse_guidance(&clean_uncertainty, &aug_uncertainty, &self.blur)?;
        let coverage = coverage_ratio(labels, &guidance)?;
        let decision = decide_mix(coverage, self.coverage_threshold, self.zero_foreground);
        debug!("Mix decision {:?} at coverage {:?}", decision.decision, decision.coverage);

        // Mixed branch
        let mixed = mix_inputs(clean, aug, &guidance, decision.decision)?;
        let (mixed_logits, mixed_losses) = self.branch(ctx, accumulator, &mixed, labels)?;
        if let Some(snapshot) = snapshot.as_deref_mut() {
            snapshot.push("mixed_img", &first_image_plane(&mixed)?);
            snapshot.push("mixed_pred", &predicted_classes(&mixed_logits)?.i(0)?);
            snapshot.push("combined-UG", &guidance.i((0, 0))?);
        }

        accumulator.commit(ctx.optimizer)?;

        Ok(MixupStepRecord {
            losses: self.merge_records(ctx, &clean_losses, &aug_losses, &mixed_losses)?,
            aug_losses: loss_values(&aug_losses)?,
            decision: decision.decision,
            coverage: decision.coverage,
        })
    }

    /// Forward, filtered weighted loss, backward into the accumulator
    fn branch(
        &self,
        ctx: &mut StepContext<'_>,
        accumulator: &mut GradientAccumulator,
        images: &Tensor,
        labels: &Tensor,
    ) -> Result<(Tensor, LossDict)> {
        let logits = ctx.model.forward(images)?;
        let losses = ctx.criterion.get_loss(&logits, labels)?;
        let total = weighted_sum_filtered(&losses, ctx.criterion.weight_dict(), ctx.device)?;
        accumulator.accumulate(&total)?;
        Ok((logits, losses))
    }

    fn merge_records(
        &self,
        ctx: &StepContext<'_>,
        clean: &LossDict,
        aug: &LossDict,
        mixed: &LossDict,
    ) -> Result<BTreeMap<String, f64>> {
        let clean = loss_values(clean)?;
        let aug = loss_values(aug)?;
        let mixed = loss_values(mixed)?;
        let weights = ctx.criterion.weight_dict();

        let mut record = BTreeMap::new();
        for (key, value) in clean.iter().filter(|(key, _)| weights.contains_key(*key)) {
            let aug_value = aug
                .get(key)
                .ok_or_else(|| Error::training(format!("augmented branch has no '{key}' loss")))?;
            let mixed_value = mixed
                .get(key)
                .ok_or_else(|| Error::training(format!("mixed branch has no '{key}' loss")))?;
            record.insert(key.clone(), *value);
            record.insert(format!("{key}_aug"), *aug_value);
            record.insert(format!("{key}_mix"), *mixed_value);
        }
        Ok(record)
    }

    /// One mixup pass over `loader`
    ///
    /// Per batch: step, metric update, budget check, snapshot dump, counter
    /// increment. The budget check precedes the dump, so the batch that hits
    /// the budget is trained on but neither dumped nor counted.
    #[instrument(skip_all, fields(epoch = epoch))]
    pub fn train_one_epoch_mixup(
        &self,
        ctx: &mut StepContext<'_>,
        loader: &mut dyn BatchSource,
        epoch: usize,
        cur_iteration: usize,
        max_iteration: usize,
        mut visual: Option<VisualTarget<'_>>,
    ) -> Result<MixupEpochOutcome> {
        ctx.model.set_training(true);
        let mut accumulator = GradientAccumulator::new(ctx.optimizer.vars());
        let mut cur_iteration = cur_iteration;
        let mut last_aug_losses = None;

        let mut progress = ctx
            .logger
            .log_every(loader.num_batches(), ctx.print_freq, format!("Epoch: [{epoch}]"));

        for batch in loader.epoch() {
            let batch = batch?.to_device(ctx.device)?;

            let due = visual.is_some() && cur_iteration % self.visual_freq == 0;
            let mut snapshot = due.then(VisualSnapshot::default);

            let record = self.mixup_step(ctx, &mut accumulator, &batch, snapshot.as_mut())?;
            ctx.record(&record.losses);
            progress.tick(ctx.logger);
            last_aug_losses = Some(record.aug_losses);

            if max_iteration > 0 && cur_iteration >= max_iteration {
                break;
            }

            if let (Some(target), Some(snapshot)) = (visual.as_mut(), snapshot.as_ref()) {
                dump_snapshot(&mut *target.sink, target.dir, cur_iteration, snapshot)?;
            }
            cur_iteration += 1;
        }
        progress.finish();

        ctx.logger.synchronize_between_processes();
        info!("Averaged stats: {}", ctx.logger.summary());
        Ok(MixupEpochOutcome {
            iteration: cur_iteration,
            last_aug_losses,
        })
    }
}

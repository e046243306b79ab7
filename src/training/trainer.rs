//! Training orchestration for segmentation models
//!
//! [`SegTrainer`] owns the model, criterion, optimizer and loaders, runs the
//! warmup followed by standard or mixup epochs and, on a fixed epoch cadence,
//! scores a validation loader slice by slice and the test set per volume.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use candle_core::Device;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::Result;
use crate::evaluation::{evaluate, prediction_wrapper, EvalReport, PredictionOptions};
use crate::training::config::TrainConfig;
use crate::training::data::BatchSource;
use crate::training::epoch::{train_one_epoch, StepContext};
use crate::training::loss::{Criterion, SegmentationCriterion};
use crate::training::metrics::MetricLogger;
use crate::training::mixup::{MixupRunner, VisualTarget};
use crate::training::model::{ConvSegmenter, SegmentationModel};
use crate::training::optimizers::{create_optimizer, GradScaler, Optimizer};
use crate::training::visual::{NullSink, VisualSink};
use crate::training::warmup::run_warmup;

/// Training events for monitoring
#[derive(Debug, Clone)]
pub enum TrainingEvent {
    WarmupCompleted { iteration: usize },
    EpochStarted { epoch: usize },
    EpochCompleted { epoch: usize, iteration: usize, stats: BTreeMap<String, f64> },
    /// Slice-level foreground Dice per class on the validation loader
    ValidationCompleted { epoch: usize, dice: Vec<f64> },
    EvaluationCompleted { epoch: usize, summary: BTreeMap<String, f64> },
    TrainingCompleted { final_iteration: usize },
}

/// Outcome of [`SegTrainer::train`]
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    /// Iteration counter when training stopped
    pub final_iteration: usize,
    /// Best domain-averaged Dice over all evaluations
    pub best_overall_by_domain: Option<f64>,
    /// Evaluation reports keyed by epoch
    pub reports: Vec<(usize, EvalReport)>,
    /// Slice-level foreground Dice per class keyed by epoch
    pub validation: Vec<(usize, Vec<f64>)>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Segmentation trainer
pub struct SegTrainer {
    config: TrainConfig,
    model: Box<dyn SegmentationModel>,
    criterion: Box<dyn Criterion>,
    optimizer: Box<dyn Optimizer>,
    train_loader: Box<dyn BatchSource>,
    val_loader: Option<Box<dyn BatchSource>>,
    test_loader: Option<Box<dyn BatchSource>>,
    sink: Box<dyn VisualSink>,
    grad_scaler: Option<GradScaler>,
    device: Device,
    event_tx: Option<mpsc::UnboundedSender<TrainingEvent>>,
}

impl SegTrainer {
    /// Create a trainer from explicit collaborators
    pub fn new(
        config: TrainConfig,
        model: Box<dyn SegmentationModel>,
        criterion: Box<dyn Criterion>,
        optimizer: Box<dyn Optimizer>,
        train_loader: Box<dyn BatchSource>,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        let grad_scaler = config
            .mixed_precision
            .enabled
            .then(|| GradScaler::new(&config.mixed_precision));
        if grad_scaler.is_some() && config.mixup.enabled {
            warn!("Loss scaling only applies to the standard runner; mixup epochs run unscaled");
        }

        Ok(Self {
            config,
            model,
            criterion,
            optimizer,
            train_loader,
            val_loader: None,
            test_loader: None,
            sink: Box::new(NullSink),
            grad_scaler,
            device,
            event_tx: None,
        })
    }

    /// Build a [`ConvSegmenter`], its criterion and optimizer from `config`
    pub fn from_config(config: TrainConfig, train_loader: Box<dyn BatchSource>, device: Device) -> Result<Self> {
        let model = ConvSegmenter::new(&config.model, &device)?;
        let groups = model.param_groups(
            config.optimizer.learning_rate,
            config.optimizer.encoder_lr_scale,
            config.optimizer.head_lr_scale,
        )?;
        let optimizer = create_optimizer(&config.optimizer, groups)?;
        let criterion = SegmentationCriterion::new(&config.loss);
        info!(
            "Built {} with {} parameter groups",
            optimizer.name(),
            optimizer.param_groups().len()
        );
        Self::new(config, Box::new(model), Box::new(criterion), optimizer, train_loader, device)
    }

    /// Score `loader` slice by slice every `eval_every` epochs
    pub fn with_val_loader(mut self, loader: Box<dyn BatchSource>) -> Self {
        self.val_loader = Some(loader);
        self
    }

    /// Evaluate on `loader` every `eval_every` epochs
    pub fn with_test_loader(mut self, loader: Box<dyn BatchSource>) -> Self {
        self.test_loader = Some(loader);
        self
    }

    /// Route snapshots and slice images to `sink`
    pub fn with_sink(mut self, sink: Box<dyn VisualSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Set up event monitoring
    pub fn with_event_monitoring(mut self, tx: mpsc::UnboundedSender<TrainingEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// The model being trained
    pub fn model(&self) -> &dyn SegmentationModel {
        self.model.as_ref()
    }

    /// The parameter update rule
    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    /// Run warmup, all epochs and the periodic evaluations
    pub fn train(&mut self) -> Result<TrainingSummary> {
        let started_at = Utc::now();
        let start = Instant::now();
        let schedule = self.config.schedule.clone();
        let mixup = if self.config.mixup.enabled {
            Some(MixupRunner::new(&self.config.mixup)?)
        } else {
            None
        };

        info!("Starting training on {:?}", self.device);
        let mut cur_iteration = 0;
        if schedule.warmup_iterations > 0 {
            let mut logger = MetricLogger::default();
            let mut ctx = StepContext {
                model: self.model.as_mut(),
                criterion: self.criterion.as_ref(),
                optimizer: self.optimizer.as_mut(),
                device: &self.device,
                logger: &mut logger,
                print_freq: schedule.print_freq,
            };
            cur_iteration = run_warmup(
                &mut ctx,
                self.train_loader.as_mut(),
                self.config.optimizer.learning_rate,
                schedule.warmup_iterations,
            )?;
            self.send_event(TrainingEvent::WarmupCompleted { iteration: cur_iteration });
        }

        let mut reports = Vec::new();
        let mut validation = Vec::new();
        let mut best_overall_by_domain: Option<f64> = None;

        for epoch in 0..schedule.epochs {
            self.send_event(TrainingEvent::EpochStarted { epoch });
            let mut logger = MetricLogger::default();
            let mut ctx = StepContext {
                model: self.model.as_mut(),
                criterion: self.criterion.as_ref(),
                optimizer: self.optimizer.as_mut(),
                device: &self.device,
                logger: &mut logger,
                print_freq: schedule.print_freq,
            };

            cur_iteration = match &mixup {
                Some(runner) => {
                    let visual = self.config.output.visual_dir.as_deref().map(|dir| VisualTarget {
                        dir,
                        sink: self.sink.as_mut(),
                    });
                    let outcome = runner.train_one_epoch_mixup(
                        &mut ctx,
                        self.train_loader.as_mut(),
                        epoch,
                        cur_iteration,
                        schedule.max_iteration,
                        visual,
                    )?;
                    if let Some(aug) = &outcome.last_aug_losses {
                        info!("Epoch {} last augmented losses {:?}", epoch, aug);
                    }
                    outcome.iteration
                }
                None => train_one_epoch(
                    &mut ctx,
                    self.train_loader.as_mut(),
                    epoch,
                    cur_iteration,
                    schedule.max_iteration,
                    self.grad_scaler.as_mut(),
                )?,
            };
            self.send_event(TrainingEvent::EpochCompleted {
                epoch,
                iteration: cur_iteration,
                stats: logger.averaged_stats(),
            });

            let budget_hit = schedule.max_iteration > 0 && cur_iteration >= schedule.max_iteration;
            let eval_due = schedule.eval_every > 0 && (epoch + 1) % schedule.eval_every == 0;
            if eval_due || budget_hit {
                if let Some(dice) = self.validate_epoch(epoch)? {
                    validation.push((epoch, dice));
                }
                if let Some(report) = self.evaluate_epoch(epoch)? {
                    best_overall_by_domain = Some(match best_overall_by_domain {
                        Some(best) if best >= report.overall_by_domain => best,
                        _ => report.overall_by_domain,
                    });
                    reports.push((epoch, report));
                }
            }

            if budget_hit {
                info!("Reached max iteration {}", schedule.max_iteration);
                break;
            }
        }

        self.send_event(TrainingEvent::TrainingCompleted {
            final_iteration: cur_iteration,
        });
        let duration = start.elapsed();
        info!("Training finished at iteration {} in {:?}", cur_iteration, duration);

        Ok(TrainingSummary {
            final_iteration: cur_iteration,
            best_overall_by_domain,
            reports,
            validation,
            started_at,
            duration,
        })
    }

    /// Slice-level foreground Dice on the validation loader, if there is one
    pub fn validate_epoch(&mut self, epoch: usize) -> Result<Option<Vec<f64>>> {
        let Some(loader) = self.val_loader.as_mut() else {
            return Ok(None);
        };
        let dice = evaluate(self.model.as_mut(), loader.as_mut(), &self.device)?;
        let labels = self.config.evaluation.label_names.iter().skip(1);
        let per_class = labels
            .zip(&dice)
            .map(|(label, d)| format!("{label}: {d:.4}"))
            .collect::<Vec<_>>()
            .join(", ");
        info!("Epoch {} validation dice [{}]", epoch, per_class);

        self.send_event(TrainingEvent::ValidationCompleted {
            epoch,
            dice: dice.clone(),
        });
        Ok(Some(dice))
    }

    /// Volumetric evaluation on the test loader, if there is one
    pub fn evaluate_epoch(&mut self, epoch: usize) -> Result<Option<EvalReport>> {
        let Some(loader) = self.test_loader.as_mut() else {
            return Ok(None);
        };
        let options = PredictionOptions {
            epoch,
            label_names: self.config.evaluation.label_names.clone(),
            output_dir: self.config.output.output_dir.clone(),
            mode: self.config.evaluation.mode.clone(),
            save_prediction: self.config.evaluation.save_prediction,
        };
        let outcome = prediction_wrapper(
            self.model.as_mut(),
            loader.as_mut(),
            &self.device,
            self.sink.as_mut(),
            &options,
        )?;

        let summary = outcome.report.summary_map();
        self.send_event(TrainingEvent::EvaluationCompleted { epoch, summary });
        Ok(Some(outcome.report))
    }

    fn send_event(&self, event: TrainingEvent) {
        if let Some(tx) = &self.event_tx {
            // Receiver may already be gone
            let _ = tx.send(event);
        }
    }
}

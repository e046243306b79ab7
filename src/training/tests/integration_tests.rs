//! End-to-end tests of evaluation and the trainer

use std::sync::Arc;

use approx::assert_relative_eq;
use candle_core::{DType, Tensor};
use tokio::sync::mpsc;

use super::mock_data::{create_mock_loader, create_mock_volume, create_slice_loader};
use super::test_utils::{create_test_device, tiny_model_config, OracleModel, RecordingSink};
use crate::error::Error;
use crate::evaluation::{evaluate, predict_volumes, prediction_wrapper, PredictionOptions};
use crate::training::config::TrainConfig;
use crate::training::data::{
    Batch, BatchList, DataLoader, DataLoaderConfig, IntensityAugment, SampleDataset, VolumeSliceDataset,
};
use crate::training::trainer::{SegTrainer, TrainingEvent};
use crate::training::visual::FileVisualSink;

fn oracle_batch(labels: Tensor) -> Batch {
    let images = labels.to_dtype(DType::F32).unwrap().unsqueeze(1).unwrap();
    Batch::new(images, labels).unwrap()
}

#[test]
fn test_evaluate_ignores_missing_foreground() {
    let device = create_test_device();
    let with_foreground = oracle_batch(Tensor::new(&[[[1u32, 0], [0, 0]]], &device).unwrap());
    let background_only = oracle_batch(Tensor::zeros((1, 2, 2), DType::U32, &device).unwrap());
    let mut loader = BatchList::new(vec![with_foreground, background_only]);

    let dice = evaluate(&mut OracleModel, &mut loader, &device).unwrap();
    assert_eq!(dice.len(), 1);
    assert_relative_eq!(dice[0], 1.0);
}

#[test]
fn test_evaluate_rejects_empty_loader() {
    let device = create_test_device();
    let mut loader = BatchList::default();
    assert!(matches!(
        evaluate(&mut OracleModel, &mut loader, &device),
        Err(Error::Training(_))
    ));
}

#[test]
fn test_predict_volumes_dumps_every_slice() {
    let device = create_test_device();
    let mut loader = create_slice_loader(vec![create_mock_volume("A_1", 3), create_mock_volume("B_1", 2)]);
    let mut sink = RecordingSink::default();
    let dir = std::path::Path::new("vis_save");

    let volumes = predict_volumes(&mut OracleModel, &mut loader, &device, &mut sink, Some(dir)).unwrap();

    assert_eq!(volumes.len(), 2);
    assert_eq!(volumes[0].0, "A_1");
    assert_eq!(volumes[0].1.pred.dims(), &[3, 4, 4]);
    assert_eq!(volumes[1].1.image.dims(), &[4, 4, 2]);
    assert_eq!(sink.images.len(), 3 * 5);
    assert!(sink.images.contains(&dir.join("img_3_1.png")));
    assert!(sink.images.contains(&dir.join("pred_3_3.png")));
    assert!(sink.images.contains(&dir.join("gt_2_2.png")));
}

#[test]
fn test_predict_volumes_needs_single_slice_batches() {
    let device = create_test_device();
    let dataset = VolumeSliceDataset::new(vec![create_mock_volume("A_1", 2)]);
    let config = DataLoaderConfig {
        batch_size: 2,
        ..DataLoaderConfig::sequential()
    };
    let mut loader = DataLoader::new(Arc::new(dataset), config);
    let mut sink = RecordingSink::default();

    let result = predict_volumes(&mut OracleModel, &mut loader, &device, &mut sink, None);
    assert!(matches!(result, Err(Error::Batch(_))));
}

#[test]
fn test_prediction_wrapper_perfect_segmentation() {
    let device = create_test_device();
    let output = tempfile::tempdir().unwrap();
    let mut loader = create_slice_loader(vec![
        create_mock_volume("A_1", 2),
        create_mock_volume("A_2", 2),
        create_mock_volume("B_1", 2),
    ]);
    let mut sink = FileVisualSink;
    let options = PredictionOptions {
        epoch: 3,
        label_names: vec!["background".to_string(), "foreground".to_string()],
        output_dir: output.path().to_path_buf(),
        mode: "base".to_string(),
        save_prediction: false,
    };

    let outcome = prediction_wrapper(&mut OracleModel, &mut loader, &device, &mut sink, &options).unwrap();

    assert!(outcome.volumes.is_empty());
    assert_eq!(outcome.domain_names, vec!["A", "B"]);
    assert_eq!(outcome.dsc_table.dim(), (3, 2));
    assert_eq!(outcome.report.mode, "base");
    assert_relative_eq!(outcome.report.overall, 1.0);
    assert_relative_eq!(outcome.report.overall_by_domain, 1.0);
    assert_relative_eq!(outcome.report.overall_std, 0.0);
    assert!(output.path().join("vis_save").join("img_2_1.png").exists());
    assert!(output.path().join("vis_save").join("pred_2_2.png").exists());
}

#[test]
fn test_prediction_wrapper_keeps_volumes_on_request() {
    let device = create_test_device();
    let mut loader = create_slice_loader(vec![create_mock_volume("A_1", 2)]);
    let mut sink = RecordingSink::default();
    let options = PredictionOptions {
        epoch: 0,
        label_names: vec!["background".to_string(), "foreground".to_string()],
        output_dir: "unused".into(),
        mode: "target".to_string(),
        save_prediction: true,
    };

    let outcome = prediction_wrapper(&mut OracleModel, &mut loader, &device, &mut sink, &options).unwrap();
    assert_eq!(outcome.volumes.len(), 1);
    assert_eq!(outcome.report.mode, "target");
}

fn trainer_config() -> TrainConfig {
    let mut config = TrainConfig::default();
    config.model = tiny_model_config();
    config.schedule.warmup_iterations = 2;
    config.schedule.epochs = 2;
    config.schedule.print_freq = 1;
    config.data.batch_size = 2;
    config.mixup.blur_kernel = 3;
    config.mixup.blur_sigma = 1.0;
    config
}

fn training_loader() -> DataLoader<SampleDataset> {
    let dataset = SampleDataset::from_volumes(vec![create_mock_volume("A_1", 2), create_mock_volume("B_1", 2)]);
    DataLoader::new(Arc::new(dataset), DataLoaderConfig {
        batch_size: 2,
        shuffle: true,
        drop_last: false,
        seed: 3,
    })
    .with_augment(IntensityAugment::default())
}

#[test]
fn test_trainer_runs_warmup_mixup_and_evaluation() {
    let device = create_test_device();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let test_loader = create_slice_loader(vec![create_mock_volume("A_1", 2), create_mock_volume("B_1", 2)]);

    let mut trainer = SegTrainer::from_config(trainer_config(), Box::new(training_loader()), device)
        .unwrap()
        .with_test_loader(Box::new(test_loader))
        .with_sink(Box::new(RecordingSink::default()))
        .with_event_monitoring(tx);
    let summary = trainer.train().unwrap();

    // 2 warmup steps, then 2 epochs of 2 batches
    assert_eq!(summary.final_iteration, 6);
    assert_eq!(trainer.optimizer().step_count(), 6);
    assert_eq!(summary.reports.len(), 2);
    assert!(summary.best_overall_by_domain.is_some());

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.first(), Some(TrainingEvent::WarmupCompleted { iteration: 2 })));
    assert!(matches!(events.last(), Some(TrainingEvent::TrainingCompleted { final_iteration: 6 })));
    let evaluations = events
        .iter()
        .filter(|e| matches!(e, TrainingEvent::EvaluationCompleted { .. }))
        .count();
    assert_eq!(evaluations, 2);
}

#[test]
fn test_trainer_stops_at_iteration_budget() {
    let mut config = trainer_config();
    config.mixup.enabled = false;
    config.schedule.warmup_iterations = 0;
    config.schedule.epochs = 5;
    config.schedule.max_iteration = 3;

    let mut trainer = SegTrainer::from_config(config, Box::new(training_loader()), create_test_device()).unwrap();
    let summary = trainer.train().unwrap();

    assert_eq!(summary.final_iteration, 3);
    assert_eq!(trainer.optimizer().step_count(), 3);
    assert!(summary.reports.is_empty());
    assert!(summary.best_overall_by_domain.is_none());
}

#[test]
fn test_trainer_scores_validation_slices_on_cadence() {
    let mut config = trainer_config();
    config.mixup.enabled = false;
    config.schedule.warmup_iterations = 0;
    config.schedule.epochs = 4;
    config.schedule.eval_every = 2;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut trainer = SegTrainer::from_config(config, Box::new(training_loader()), create_test_device())
        .unwrap()
        .with_val_loader(Box::new(create_mock_loader(2, false)))
        .with_event_monitoring(tx);
    let summary = trainer.train().unwrap();

    // epochs 1 and 3 close an eval_every window
    let epochs: Vec<usize> = summary.validation.iter().map(|(epoch, _)| *epoch).collect();
    assert_eq!(epochs, vec![1, 3]);
    assert!(summary.reports.is_empty());

    let mut validated = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let TrainingEvent::ValidationCompleted { epoch, dice } = event {
            // one foreground class
            assert_eq!(dice.len(), 1);
            assert!(dice[0].is_nan() || (0.0..=1.0).contains(&dice[0]));
            validated.push(epoch);
        }
    }
    assert_eq!(validated, vec![1, 3]);
}

#[test]
fn test_trainer_without_validation_loader_skips_slice_scoring() {
    let mut config = trainer_config();
    config.mixup.enabled = false;
    config.schedule.warmup_iterations = 0;
    config.schedule.epochs = 1;

    let mut trainer = SegTrainer::from_config(config, Box::new(training_loader()), create_test_device()).unwrap();
    assert!(trainer.validate_epoch(0).unwrap().is_none());
    assert!(trainer.train().unwrap().validation.is_empty());
}

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use ugmix::evaluation::{prediction_wrapper, PredictionOptions};
use ugmix::training::data::{load_npy_volumes, DataLoader, DataLoaderConfig, SampleDataset, VolumeSliceDataset};
use ugmix::training::{ConvSegmenter, FileVisualSink, SegTrainer, TrainConfig, TrainingEvent};

#[derive(Parser)]
#[command(name = "ugmix")]
#[command(about = "Uncertainty-guided mixup training and volumetric Dice evaluation", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a segmentation model
    Train {
        /// Configuration file (JSON or YAML)
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,

        /// Directory of `<id>_image.npy` / `<id>_label.npy` training volumes
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Directory of validation volumes, scored slice by slice
        #[arg(short, long)]
        val_dir: Option<PathBuf>,

        /// Directory of test volumes, evaluated per scan and domain
        #[arg(short, long)]
        test_dir: Option<PathBuf>,

        /// Override the number of epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Override the output directory
        #[arg(short, long, env = "UGMIX_OUTPUT_DIR")]
        output_dir: Option<PathBuf>,
    },

    /// Run the volumetric evaluation with a freshly initialised model
    Evaluate {
        /// Configuration file (JSON or YAML)
        #[arg(short, long, default_value = "config.yaml")]
        config: PathBuf,

        /// Directory of test volumes
        #[arg(short, long)]
        data_dir: PathBuf,
    },

    /// Validate configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Write the default configuration
    InitConfig {
        /// Destination, JSON or YAML by extension
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    match cli.command {
        Commands::Train {
            config,
            data_dir,
            val_dir,
            test_dir,
            epochs,
            output_dir,
        } => {
            let dirs = EvalDirs {
                val: val_dir,
                test: test_dir,
            };
            train(&config, &data_dir, dirs, epochs, output_dir).await?;
        }

        Commands::Evaluate { config, data_dir } => {
            evaluate(&config, &data_dir)?;
        }

        Commands::Config { file } => {
            validate_config(&file)?;
        }

        Commands::InitConfig { output } => {
            TrainConfig::default()
                .to_file(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!("Default configuration written to {}", output.display());
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<TrainConfig> {
    let config = TrainConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration file {}", path.display()))?;
    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

fn slice_loader(dir: &Path) -> Result<DataLoader<VolumeSliceDataset>> {
    let volumes = load_npy_volumes(dir).with_context(|| format!("Failed to load volumes from {}", dir.display()))?;
    Ok(DataLoader::new(
        Arc::new(VolumeSliceDataset::new(volumes)),
        DataLoaderConfig::sequential(),
    ))
}

/// Optional held-out data scored during training
struct EvalDirs {
    val: Option<PathBuf>,
    test: Option<PathBuf>,
}

async fn train(
    config_path: &Path,
    data_dir: &Path,
    eval_dirs: EvalDirs,
    epochs: Option<usize>,
    output_dir: Option<PathBuf>,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(epochs) = epochs {
        config.schedule.epochs = epochs;
    }
    if let Some(output_dir) = output_dir {
        config.output.output_dir = output_dir;
    }
    config.validate().context("Configuration validation failed")?;

    let device = config.runtime.device()?;
    info!("Training on {:?}", device);

    let volumes = load_npy_volumes(data_dir)
        .with_context(|| format!("Failed to load training volumes from {}", data_dir.display()))?;
    info!("Loaded {} training volumes", volumes.len());
    let mut train_loader = DataLoader::new(
        Arc::new(SampleDataset::from_volumes(volumes)),
        config.data.loader_config(config.runtime.seed),
    );
    if config.mixup.enabled {
        train_loader = train_loader.with_augment(config.data.augment.clone());
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let monitor = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                TrainingEvent::EpochCompleted { epoch, iteration, stats } => {
                    info!("Epoch {} done at iteration {}: {:?}", epoch, iteration, stats);
                }
                TrainingEvent::ValidationCompleted { epoch, dice } => {
                    info!("Epoch {} validation dice: {:?}", epoch, dice);
                }
                TrainingEvent::EvaluationCompleted { epoch, summary } => {
                    info!("Epoch {} evaluation: {:?}", epoch, summary);
                }
                other => tracing::debug!("{:?}", other),
            }
        }
    });

    let batch_size = config.data.batch_size;
    let mut trainer = SegTrainer::from_config(config, Box::new(train_loader), device)
        .context("Failed to build trainer")?
        .with_sink(Box::new(FileVisualSink))
        .with_event_monitoring(tx);
    if let Some(val_dir) = &eval_dirs.val {
        let volumes = load_npy_volumes(val_dir)
            .with_context(|| format!("Failed to load validation volumes from {}", val_dir.display()))?;
        let val_config = DataLoaderConfig {
            batch_size,
            ..DataLoaderConfig::sequential()
        };
        trainer = trainer.with_val_loader(Box::new(DataLoader::new(
            Arc::new(SampleDataset::from_volumes(volumes)),
            val_config,
        )));
    }
    if let Some(test_dir) = &eval_dirs.test {
        trainer = trainer.with_test_loader(Box::new(slice_loader(test_dir)?));
    } else {
        warn!("No test directory given; skipping evaluation");
    }

    let summary = trainer.train().context("Training failed")?;
    drop(trainer);
    monitor.await.context("Event monitor panicked")?;

    info!(
        "Finished at iteration {} (best overall by domain: {:?})",
        summary.final_iteration, summary.best_overall_by_domain
    );
    Ok(())
}

fn evaluate(config_path: &Path, data_dir: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let device = config.runtime.device()?;
    let mut model = ConvSegmenter::new(&config.model, &device)?;
    let mut loader = slice_loader(data_dir)?;
    let mut sink = FileVisualSink;

    let options = PredictionOptions {
        epoch: 0,
        label_names: config.evaluation.label_names.clone(),
        output_dir: config.output.output_dir.clone(),
        mode: config.evaluation.mode.clone(),
        save_prediction: false,
    };
    let outcome = prediction_wrapper(&mut model, &mut loader, &device, &mut sink, &options)
        .context("Evaluation failed")?;

    println!("{}", serde_json::to_string_pretty(&outcome.report.summary_map())?);
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());
    let config = load_config(config_path)?;

    info!("Configuration is valid");
    info!("Configuration summary:");
    info!(
        "  - Model: {} -> {} classes, {} hidden channels",
        config.model.in_channels, config.model.num_classes, config.model.hidden_channels
    );
    info!(
        "  - Optimizer: {:?}, lr {}",
        config.optimizer.optimizer_type, config.optimizer.learning_rate
    );
    info!(
        "  - Schedule: {} warmup iterations, {} epochs, max iteration {}",
        config.schedule.warmup_iterations, config.schedule.epochs, config.schedule.max_iteration
    );
    info!(
        "  - Mixup: enabled={}, visual_freq={}",
        config.mixup.enabled, config.mixup.visual_freq
    );
    Ok(())
}

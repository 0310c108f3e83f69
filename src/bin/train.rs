#![recursion_limit = "256"]

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::thread;

use anyhow::{Context, Result};
use burn::backend::{Autodiff, NdArray, Wgpu};
use burn::tensor::backend::AutodiffBackend;
use clap::{Parser, ValueEnum};

use seg_adapt::checkpoint::load_checkpoint_objective_vectors;
use seg_adapt::config::AppConfig;
use seg_adapt::data::create_datasets;
use seg_adapt::logging;
use seg_adapt::model::{AdaptationModel, SegAdaptModel};
use seg_adapt::stage::Stage;
use seg_adapt::training::events::TrainingUpdate;
use seg_adapt::training::{Trainer, TrainingSession};

type GpuBackend = Autodiff<Wgpu<f32, i32>>;
type CpuBackend = Autodiff<NdArray<f32>>;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendKind {
    Wgpu,
    Ndarray,
}

/// Train one stage of segmentation domain adaptation.
#[derive(Parser)]
#[command(name = "train", about = "Train a segmentation domain-adaptation stage")]
struct Cli {
    /// Path to TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Compute backend
    #[arg(long, value_enum, default_value = "wgpu")]
    backend: BackendKind,

    /// Print the default configuration as TOML and exit
    #[arg(long)]
    print_default_config: bool,

    /// Training stage: warm_up, stage1, or anything else for distillation
    #[arg(long)]
    stage: Option<String>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    epochs: Option<usize>,

    /// Nominal iteration count shown in progress lines
    #[arg(long)]
    train_iters: Option<usize>,

    /// Batch size
    #[arg(long)]
    bs: Option<usize>,

    #[arg(long)]
    print_interval: Option<usize>,

    #[arg(long)]
    val_interval: Option<usize>,

    /// Freeze batch-norm running statistics
    #[arg(long)]
    freeze_bn: bool,

    /// Checkpoint directory to resume from
    #[arg(long)]
    resume_path: Option<PathBuf>,

    #[arg(long)]
    src_dataset: Option<String>,

    #[arg(long)]
    tgt_dataset: Option<String>,

    #[arg(long)]
    model_name: Option<String>,

    #[arg(long)]
    n_class: Option<usize>,

    #[arg(long)]
    logdir: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        let t = &mut config.train;
        if let Some(stage) = &self.stage {
            t.stage = Stage::from(stage.as_str());
        }
        if let Some(v) = self.seed {
            t.seed = v;
        }
        if let Some(v) = self.epochs {
            t.epochs = v;
        }
        if let Some(v) = self.train_iters {
            t.train_iters = v;
        }
        if let Some(v) = self.bs {
            t.bs = v;
        }
        if let Some(v) = self.print_interval {
            t.print_interval = v;
        }
        if let Some(v) = self.val_interval {
            t.val_interval = v;
        }
        if self.freeze_bn {
            t.freeze_bn = true;
        }
        if let Some(v) = &self.resume_path {
            t.resume_path = Some(v.clone());
        }
        if let Some(v) = &self.src_dataset {
            t.src_dataset = v.clone();
        }
        if let Some(v) = &self.tgt_dataset {
            t.tgt_dataset = v.clone();
        }
        if let Some(v) = &self.model_name {
            t.model_name = v.clone();
        }
        if let Some(v) = self.n_class {
            t.n_class = v;
        }
        if let Some(v) = &self.logdir {
            t.logdir = v.clone();
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        print!("{}", AppConfig::default_toml());
        return Ok(());
    }

    let mut config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    cli.apply(&mut config);
    let cwd = std::env::current_dir().context("reading working directory")?;
    config.resolve_paths(&cwd);
    config.validate().context("validating configuration")?;

    std::fs::create_dir_all(&config.train.logdir)
        .with_context(|| format!("creating {}", config.train.logdir.display()))?;
    let log_file = logging::init(&config.train.logdir).context("initialising logging")?;
    log::info!("Logging to {}", log_file.display());
    if !cli.config.exists() {
        log::warn!("config file {} not found, using defaults", cli.config.display());
    }

    let snapshot = toml::to_string_pretty(&config).context("serialising configuration")?;
    std::fs::write(config.train.logdir.join("config.toml"), &snapshot)?;
    log::info!("Configuration:\n{snapshot}");

    match cli.backend {
        BackendKind::Wgpu => run::<GpuBackend>(config, Default::default()),
        BackendKind::Ndarray => run::<CpuBackend>(config, Default::default()),
    }
}

fn run<B: AutodiffBackend>(config: AppConfig, device: B::Device) -> Result<()> {
    B::seed(config.train.seed);

    let mut datasets = create_datasets::<B>(&config, &device).context("building datasets")?;
    let mut model = SegAdaptModel::<B>::new(&config, &device);

    if let Some(resume) = &config.train.resume_path {
        if resume.is_dir() {
            model
                .resume(resume)
                .with_context(|| format!("resuming from {}", resume.display()))?;
            // stage1 reads its own prototype file; other stages carry the
            // checkpoint's vectors forward into their records.
            if config.train.stage != Stage::Stage1 {
                if let Some(vectors) = load_checkpoint_objective_vectors(resume)? {
                    model.set_objective_vectors(vectors)?;
                }
            }
        } else {
            log::warn!(
                "resume path {} is not a checkpoint directory, starting from fresh weights",
                resume.display()
            );
        }
    }

    let (tx, rx) = mpsc::channel();
    let history_path = config.train.logdir.join("validation_history.json");
    let observer = thread::spawn(move || record_history(rx, &history_path));

    let trainer = Trainer::new(config.train.clone()).with_updates(tx);
    let mut session = TrainingSession::new();
    let result = trainer.train(&mut model, &mut datasets, &mut session);
    drop(trainer);
    match observer.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("could not write validation history: {e:#}"),
        Err(_) => log::warn!("validation history writer panicked"),
    }
    result.context("training failed")?;

    println!(
        "Training complete. {} iterations, best mean IoU {}",
        session.iter,
        session
            .best_iou
            .map(|v| format!("{v:.4}"))
            .unwrap_or_else(|| "n/a".to_string())
    );
    Ok(())
}

/// Collect validation scores and write them once training finishes.
fn record_history(rx: Receiver<TrainingUpdate>, path: &Path) -> Result<()> {
    let mut history = Vec::new();
    for update in rx {
        match update {
            TrainingUpdate::Validation {
                iter,
                mean_iou,
                best_iou,
            } => history.push(serde_json::json!({
                "iter": iter,
                "mean_iou": mean_iou.is_finite().then_some(mean_iou),
                "best_iou": best_iou,
            })),
            TrainingUpdate::Finished { iter, best_iou } => {
                let summary = serde_json::json!({
                    "iter": iter,
                    "best_iou": best_iou,
                    "validations": history,
                });
                let text = serde_json::to_string_pretty(&summary)?;
                std::fs::write(path, text)
                    .with_context(|| format!("writing {}", path.display()))?;
                break;
            }
            _ => {}
        }
    }
    Ok(())
}

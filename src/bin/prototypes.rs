#![recursion_limit = "256"]

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use burn::backend::{Autodiff, NdArray, Wgpu};
use burn::tensor::backend::AutodiffBackend;
use clap::{Parser, ValueEnum};

use seg_adapt::config::AppConfig;
use seg_adapt::data::{create_datasets, BatchLoader};
use seg_adapt::logging;
use seg_adapt::model::SegAdaptModel;
use seg_adapt::prototypes::prototype_path;
use seg_adapt::stage::Stage;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendKind {
    Wgpu,
    Ndarray,
}

/// Compute per-class feature prototypes from a trained checkpoint.
///
/// The file is written next to the checkpoint, where a `stage1` run with
/// the same `resume_path` looks for it.
#[derive(Parser)]
#[command(name = "prototypes", about = "Compute class prototypes for stage1")]
struct Cli {
    /// Path to TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Checkpoint directory holding the trained SegNet
    #[arg(long)]
    checkpoint: PathBuf,

    #[arg(long, value_enum, default_value = "wgpu")]
    backend: BackendKind,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    let cwd = std::env::current_dir().context("reading working directory")?;
    config.resolve_paths(&cwd);
    let checkpoint = if cli.checkpoint.is_relative() {
        cwd.join(&cli.checkpoint)
    } else {
        cli.checkpoint.clone()
    };
    if !checkpoint.is_dir() {
        bail!("checkpoint directory not found: {}", checkpoint.display());
    }

    // Only the base network is needed.
    config.train.stage = Stage::Stage1;
    config.train.resume_path = Some(checkpoint.clone());
    config.validate().context("validating configuration")?;

    std::fs::create_dir_all(&config.train.logdir)
        .with_context(|| format!("creating {}", config.train.logdir.display()))?;
    logging::init(&config.train.logdir).context("initialising logging")?;
    if !cli.config.exists() {
        log::warn!("config file {} not found, using defaults", cli.config.display());
    }

    match cli.backend {
        BackendKind::Wgpu => run::<Autodiff<Wgpu<f32, i32>>>(&config, &checkpoint, Default::default()),
        BackendKind::Ndarray => run::<Autodiff<NdArray<f32>>>(&config, &checkpoint, Default::default()),
    }
}

fn run<B: AutodiffBackend>(config: &AppConfig, checkpoint: &Path, device: B::Device) -> Result<()> {
    B::seed(config.train.seed);

    let mut datasets = create_datasets::<B>(config, &device).context("building datasets")?;
    let mut model = SegAdaptModel::<B>::new(config, &device);
    model
        .resume(checkpoint)
        .with_context(|| format!("loading {}", checkpoint.display()))?;

    log::info!(
        "Computing prototypes over {} target batches",
        datasets.target_train.num_batches()
    );
    let prototypes = model
        .compute_prototypes(datasets.target_train.as_mut())
        .context("computing prototypes")?;

    let path = prototype_path(
        checkpoint,
        &config.train.tgt_dataset,
        &config.train.model_name,
    );
    prototypes
        .save(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    log::info!("Wrote prototypes to {}", path.display());
    println!("{}", path.display());
    Ok(())
}

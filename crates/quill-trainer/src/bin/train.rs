use std::path::PathBuf;

use clap::Parser;
use quill_trainer::{TrainingConfig, run_training};
use tracing_subscriber::EnvFilter;

/// Train the handwriting encoder on a manifest dataset.
#[derive(Parser, Debug)]
#[command(name = "train", version, about)]
struct Cli {
    /// JSON training config; flags below override its fields.
    #[arg(long, env = "QUILL_TRAIN_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "QUILL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[arg(long, env = "QUILL_CHECKPOINT_DIR")]
    checkpoint_dir: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Print epoch reports as JSON lines on stdout.
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<(TrainingConfig, bool)> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::load(path)?,
            None => TrainingConfig::default(),
        };
        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(dir) = self.checkpoint_dir {
            config.checkpoint_dir = dir;
        }
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(lr) = self.learning_rate {
            config.learning_rate = lr;
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        config.validate()?;
        Ok((config, self.json))
    }
}

fn run() -> anyhow::Result<()> {
    let (config, json) = Cli::parse().into_config()?;
    let reports = run_training(config)?;
    if json {
        for report in &reports {
            println!("{}", serde_json::to_string(report)?);
        }
    }
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("Training failed: {e:#}");
        std::process::exit(1);
    }
}

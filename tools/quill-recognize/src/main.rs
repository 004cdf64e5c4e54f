use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use quill_core::{Recognizer, RecognizerConfig, Vocabulary};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Recognize handwritten text in image files, or in base64 payloads read
/// line by line from stdin. Prints one JSON object per input.
#[derive(Parser, Debug)]
#[command(name = "quill-recognize", version, about)]
struct Cli {
    /// Image files; when empty, payloads are read from stdin.
    images: Vec<PathBuf>,

    #[arg(long, env = "QUILL_CHECKPOINT", default_value = "checkpoints/best_model.safetensors")]
    checkpoint: PathBuf,

    /// JSON recognizer config; `--checkpoint` overrides its checkpoint path.
    #[arg(long, env = "QUILL_CONFIG")]
    config: Option<PathBuf>,

    /// Skip the external refinement step.
    #[arg(long)]
    no_refine: bool,

    /// Print the recognizer status and exit.
    #[arg(long)]
    status: bool,
}

#[derive(Debug, Serialize)]
struct RecognizeOutput {
    input: String,
    text: Option<String>,
    raw: Option<String>,
    refined: bool,
    error: Option<String>,
}

impl RecognizeOutput {
    fn from_result(input: String, result: quill_core::Result<quill_core::Recognition>) -> Self {
        match result {
            Ok(r) => Self {
                input,
                text: Some(r.text),
                raw: Some(r.raw),
                refined: r.refined,
                error: None,
            },
            Err(e) => Self {
                input,
                text: None,
                raw: None,
                refined: false,
                error: Some(e.to_string()),
            },
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<RecognizerConfig> {
    let mut config = match &cli.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => RecognizerConfig::default(),
    };
    config.checkpoint = cli.checkpoint.clone();
    Ok(config)
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let mut recognizer = Recognizer::new(&config, Arc::new(Vocabulary::default()))?;
    if cli.no_refine {
        recognizer = recognizer.without_refiner();
    }

    if cli.status {
        println!("{}", serde_json::to_string(&recognizer.status())?);
        return Ok(());
    }

    if cli.images.is_empty() {
        for (n, line) in io::stdin().lock().lines().enumerate() {
            let line = line?;
            let payload = line.trim();
            if payload.is_empty() {
                continue;
            }
            debug!(line = n + 1, bytes = payload.len(), "payload");
            let output = RecognizeOutput::from_result(
                format!("stdin:{}", n + 1),
                recognizer.recognize_payload(payload),
            );
            println!("{}", serde_json::to_string(&output)?);
        }
    } else {
        for path in &cli.images {
            let result = std::fs::read(path)
                .map_err(|e| quill_core::QuillError::Io {
                    context: "reading image",
                    source: e,
                })
                .and_then(|bytes| recognizer.recognize_bytes(&bytes));
            let output = RecognizeOutput::from_result(path.display().to_string(), result);
            println!("{}", serde_json::to_string(&output)?);
        }
    }

    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("quill-recognize: {e:#}");
        std::process::exit(1);
    }
}

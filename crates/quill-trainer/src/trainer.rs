//! CTC training loop: epochs, validation, best-so-far checkpointing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use candle_core::{DType, Device, ModuleT, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use oorandom::Rand32;
use quill_core::{
    CerAccumulator, CtcLoss, EncoderConfig, GreedyDecoder, Preprocessor, QuillError, SequenceEncoder,
    Vocabulary, checkpoint, ensure_finite,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::data::{Batch, Dataset, Split};

/// Hyperparameters and paths for a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Directory holding `train_manifest.txt`, `val_manifest.txt`, `train/` and `val/`.
    pub data_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub checkpoint_name: String,
    pub batch_size: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Seeds shuffling; `None` keeps manifest order.
    pub seed: Option<u64>,
    pub encoder: EncoderConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            checkpoint_dir: PathBuf::from("checkpoints"),
            checkpoint_name: "best_model.safetensors".to_string(),
            batch_size: 32,
            epochs: 50,
            learning_rate: 1e-3,
            weight_decay: 0.0,
            seed: Some(42),
            encoder: EncoderConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Read a JSON config; missing fields take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading training config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing training config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        if !(self.learning_rate > 0.0) {
            anyhow::bail!("learning_rate must be positive, got {}", self.learning_rate);
        }
        self.encoder.validate()?;
        Ok(())
    }

    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint_dir.join(&self.checkpoint_name)
    }
}

/// Result of one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    pub loss: f32,
    /// Samples left out of the loss because their label could not fit.
    pub excluded: usize,
}

/// Validation pass summary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Evaluation {
    /// Mean batch loss; `None` when no sample's label fits its input length.
    pub loss: Option<f32>,
    pub cer: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: Option<f32>,
    pub val_cer: f64,
    pub excluded_samples: usize,
    pub halted_batches: usize,
    pub checkpoint_saved: bool,
}

/// Per-epoch training totals.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct EpochTotals {
    pub loss: f32,
    pub completed: usize,
    pub excluded: usize,
    pub halted: usize,
}

/// Tracks the lowest validation loss seen so far.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestLoss(f32);

impl Default for BestLoss {
    fn default() -> Self {
        Self(f32::INFINITY)
    }
}

impl BestLoss {
    /// Record `loss`; true only when it is strictly below every earlier value.
    pub fn improves(&mut self, loss: f32) -> bool {
        if loss < self.0 {
            self.0 = loss;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn value(&self) -> f32 {
        self.0
    }
}

pub struct Trainer {
    varmap: VarMap,
    encoder: SequenceEncoder,
    optimizer: AdamW,
    loss: CtcLoss,
    decoder: GreedyDecoder,
    /// Batch-norm running statistics; updated by training-mode forward passes.
    running_stats: Vec<Var>,
    config: TrainingConfig,
    device: Device,
    rng: Option<Rand32>,
    best: BestLoss,
}

impl Trainer {
    /// Fresh encoder with randomly initialized parameters on the CPU.
    pub fn new(config: TrainingConfig, vocab: Arc<Vocabulary>) -> anyhow::Result<Self> {
        config.validate()?;
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = SequenceEncoder::new(&config.encoder, vocab.num_classes(), vb)?;

        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: config.weight_decay,
                ..ParamsAdamW::default()
            },
        )?;

        let running_stats = {
            let vars = varmap
                .data()
                .lock()
                .map_err(|_| anyhow::anyhow!("parameter map lock poisoned"))?;
            vars.iter()
                .filter(|(name, _)| name.ends_with(".running_mean") || name.ends_with(".running_var"))
                .map(|(_, var)| var.clone())
                .collect::<Vec<_>>()
        };

        info!(
            parameters = varmap.all_vars().iter().map(|v| v.elem_count()).sum::<usize>(),
            classes = vocab.num_classes(),
            time_steps = config.encoder.time_steps(),
            "encoder initialized"
        );

        Ok(Self {
            varmap,
            encoder,
            optimizer,
            loss: CtcLoss::new(vocab.blank()),
            decoder: GreedyDecoder::new(vocab),
            running_stats,
            rng: config.seed.map(Rand32::new),
            config,
            device,
            best: BestLoss::default(),
        })
    }

    #[must_use]
    pub fn encoder(&self) -> &SequenceEncoder {
        &self.encoder
    }

    #[must_use]
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    #[must_use]
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[must_use]
    pub fn best_val_loss(&self) -> f32 {
        self.best.value()
    }

    /// One forward/backward/update step in training mode.
    ///
    /// Non-finite encoder output or loss fails with
    /// [`QuillError::NumericInstability`] before the optimizer runs, and the
    /// batch-norm running statistics are rolled back to their values before
    /// the step.
    pub fn train_step(&mut self, batch: &Batch) -> quill_core::Result<StepOutcome> {
        let saved = self
            .running_stats
            .iter()
            .map(|var| var.as_tensor().copy())
            .collect::<candle_core::Result<Vec<_>>>()?;

        let log_probs = self.encoder.forward_t(&batch.images, true)?;
        match self.apply_loss(&log_probs, batch) {
            Err(QuillError::NumericInstability { stage }) => {
                for (var, value) in self.running_stats.iter().zip(&saved) {
                    var.set(value)?;
                }
                Err(QuillError::NumericInstability { stage })
            }
            other => other,
        }
    }

    /// CTC loss and optimizer update for log-probabilities produced in training mode.
    pub(crate) fn apply_loss(&mut self, log_probs: &Tensor, batch: &Batch) -> quill_core::Result<StepOutcome> {
        ensure_finite(log_probs, "encoder output")?;

        let out = self.loss.forward(log_probs, &batch.labels, &batch.input_lengths)?;
        if !out.value.is_finite() {
            return Err(QuillError::NumericInstability { stage: "ctc loss" });
        }
        if out.included() > 0 {
            self.optimizer.backward_step(&out.loss)?;
        }

        Ok(StepOutcome {
            loss: out.value,
            excluded: out.excluded(),
        })
    }

    /// Greedy transcriptions in inference mode.
    pub fn predict(&self, images: &Tensor) -> quill_core::Result<Vec<String>> {
        let log_probs = self.encoder.encode(images)?;
        self.decoder.decode_batch(&log_probs)
    }

    /// Mean batch loss and mean CER over `dataset`, in inference mode.
    ///
    /// Batches with no feasible sample carry no loss; if none has one, the
    /// loss is `None`.
    pub fn evaluate(&self, dataset: &Dataset) -> quill_core::Result<Evaluation> {
        let order = dataset.order(None);
        let mut loss_sum = 0.0f64;
        let mut loss_batches = 0usize;
        let mut cer = CerAccumulator::default();

        for chunk in order.chunks(self.config.batch_size) {
            let batch = dataset.batch(chunk, self.config.encoder.time_steps(), &self.device)?;
            let log_probs = self.encoder.encode(&batch.images)?;

            let out = self.loss.forward(&log_probs, &batch.labels, &batch.input_lengths)?;
            if out.included() > 0 {
                loss_sum += f64::from(out.value);
                loss_batches += 1;
            }

            for (prediction, reference) in self.decoder.decode_batch(&log_probs)?.iter().zip(&batch.texts) {
                cer.add(prediction, reference);
            }
        }

        let loss = (loss_batches > 0).then(|| (loss_sum / loss_batches as f64) as f32);
        Ok(Evaluation {
            loss,
            cer: cer.mean(),
            samples: cer.samples(),
        })
    }

    /// One pass over `dataset` in shuffled order.
    ///
    /// Batches that hit numeric instability are logged and skipped; if every
    /// batch does, the epoch fails.
    fn train_epoch(&mut self, epoch: usize, dataset: &Dataset) -> anyhow::Result<EpochTotals> {
        self.run_epoch(epoch, dataset, Self::train_step)
    }

    pub(crate) fn run_epoch<F>(&mut self, epoch: usize, dataset: &Dataset, mut step: F) -> anyhow::Result<EpochTotals>
    where
        F: FnMut(&mut Self, &Batch) -> quill_core::Result<StepOutcome>,
    {
        let order = dataset.order(self.rng.as_mut());
        let time_steps = self.config.encoder.time_steps();
        let batches = order.chunks(self.config.batch_size).count();

        let mut loss_sum = 0.0f64;
        let mut completed = 0usize;
        let mut excluded = 0usize;
        let mut halted = 0usize;

        for (step_index, chunk) in order.chunks(self.config.batch_size).enumerate() {
            let batch = dataset.batch(chunk, time_steps, &self.device)?;
            match step(self, &batch) {
                Ok(outcome) => {
                    loss_sum += f64::from(outcome.loss);
                    completed += 1;
                    excluded += outcome.excluded;
                    debug!(epoch, step = step_index, batches, loss = outcome.loss, "train step");
                }
                Err(QuillError::NumericInstability { stage }) => {
                    halted += 1;
                    error!(epoch, step = step_index, stage, "numeric instability, batch skipped");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if completed == 0 && halted > 0 {
            anyhow::bail!("every batch of epoch {epoch} hit numeric instability");
        }

        let loss = if completed == 0 {
            0.0
        } else {
            (loss_sum / completed as f64) as f32
        };
        Ok(EpochTotals {
            loss,
            completed,
            excluded,
            halted,
        })
    }

    /// Train for `config.epochs` epochs, validating after each and saving a
    /// checkpoint whenever validation loss reaches a new minimum.
    ///
    /// An epoch whose validation set has no measurable loss leaves the best
    /// value and the checkpoint untouched.
    pub fn fit(&mut self, train: &Dataset, val: &Dataset) -> anyhow::Result<Vec<EpochReport>> {
        if train.is_empty() {
            anyhow::bail!("training set is empty");
        }
        if val.is_empty() {
            anyhow::bail!("validation set is empty");
        }

        let checkpoint_path = self.config.checkpoint_path();
        let mut reports = Vec::with_capacity(self.config.epochs);

        for epoch in 1..=self.config.epochs {
            let totals = self.train_epoch(epoch, train)?;
            let eval = self.evaluate(val)?;

            let checkpoint_saved = match eval.loss {
                Some(loss) => self.best.improves(loss),
                None => {
                    warn!(epoch, "no validation label fits the input length, validation loss unavailable");
                    false
                }
            };
            if checkpoint_saved {
                checkpoint::save(&self.varmap, &checkpoint_path)?;
            }

            let report = EpochReport {
                epoch,
                train_loss: totals.loss,
                val_loss: eval.loss,
                val_cer: eval.cer,
                excluded_samples: totals.excluded,
                halted_batches: totals.halted,
                checkpoint_saved,
            };
            info!(
                epoch,
                epochs = self.config.epochs,
                train_loss = format!("{:.4}", totals.loss),
                val_loss = eval.loss.map_or_else(|| "n/a".to_string(), |l| format!("{l:.4}")),
                val_cer = format!("{:.4}", eval.cer),
                checkpoint_saved,
                "epoch complete"
            );
            if totals.excluded > 0 {
                warn!(epoch, excluded_samples = totals.excluded, "samples excluded from the loss");
            }
            reports.push(report);
        }

        Ok(reports)
    }
}

/// Load both splits from `config.data_dir` and train.
pub fn run_training(config: TrainingConfig) -> anyhow::Result<Vec<EpochReport>> {
    let vocab = Arc::new(Vocabulary::default());
    let preprocessor = Preprocessor::from_config(&config.encoder);

    let train = Dataset::load_split(&config.data_dir, Split::Train, &vocab, &preprocessor)?;
    let val = Dataset::load_split(&config.data_dir, Split::Validation, &vocab, &preprocessor)?;
    info!(train = train.len(), val = val.len(), data_dir = %config.data_dir.display(), "datasets ready");

    let mut trainer = Trainer::new(config, vocab)?;
    let reports = trainer.fit(&train, &val)?;
    info!(best_val_loss = trainer.best_val_loss(), "training finished");
    Ok(reports)
}

//! # Quill Trainer
//!
//! Manifest-driven dataset loading and the CTC training loop for the Quill
//! sequence encoder. Training keeps the checkpoint with the lowest
//! validation loss.

pub mod data;
pub mod trainer;

pub use data::{Batch, Dataset, ManifestEntry, Sample, Split, load_manifest};
pub use trainer::{BestLoss, EpochReport, Evaluation, StepOutcome, Trainer, TrainingConfig, run_training};

//! # Recognizer
//!
//! Inference boundary used by serving collaborators: payload in, text out.
//! Parameters are loaded once and never mutated afterwards, so a single
//! recognizer can serve concurrent requests.

use std::path::PathBuf;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::checkpoint::{self, CheckpointInfo};
use crate::config::EncoderConfig;
use crate::decode::GreedyDecoder;
use crate::error::{QuillError, Result};
use crate::model::SequenceEncoder;
use crate::preprocess::{PreparedImage, Preprocessor};
use crate::refine::{NoopRefiner, Refiner, RefinerConfig, refiner_from_config};
use crate::vocab::Vocabulary;

/// Everything needed to stand up a [`Recognizer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizerConfig {
    #[serde(default)]
    pub encoder: EncoderConfig,
    /// Checkpoint to load; a missing file means random weights.
    pub checkpoint: PathBuf,
    #[serde(default)]
    pub refiner: RefinerConfig,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderConfig::default(),
            checkpoint: PathBuf::from("checkpoints/best_model.safetensors"),
            refiner: RefinerConfig::default(),
        }
    }
}

/// Result of recognizing one image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Recognition {
    /// Final text (refined when refinement succeeded).
    pub text: String,
    /// Greedy decode of the encoder output, before refinement.
    pub raw: String,
    pub refined: bool,
}

/// Serving status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecognizerStatus {
    pub model_loaded: bool,
    pub device: String,
    pub checkpoint: Option<CheckpointInfo>,
    pub parameters: usize,
    pub refiner: &'static str,
}

pub struct Recognizer {
    encoder: SequenceEncoder,
    decoder: GreedyDecoder,
    preprocessor: Preprocessor,
    refiner: Box<dyn Refiner>,
    device: Device,
    checkpoint: Option<CheckpointInfo>,
    parameters: usize,
}

impl Recognizer {
    /// Build the encoder and load the checkpoint if one exists.
    ///
    /// An absent checkpoint is a valid state (random weights, reported in
    /// [`status`](Self::status)); an unreadable one is an error.
    pub fn new(config: &RecognizerConfig, vocab: Arc<Vocabulary>) -> Result<Self> {
        let device = Device::Cpu;
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = SequenceEncoder::new(&config.encoder, vocab.num_classes(), vb)?;

        let checkpoint = checkpoint::load_if_present(&mut varmap, &config.checkpoint)?;
        if checkpoint.is_none() {
            warn!(
                path = %config.checkpoint.display(),
                "model weights not found, predictions will be random"
            );
        }

        let parameters = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        let refiner = refiner_from_config(&config.refiner);
        info!(parameters, refiner = refiner.name(), "recognizer ready");

        Ok(Self {
            encoder,
            decoder: GreedyDecoder::new(vocab),
            preprocessor: Preprocessor::from_config(&config.encoder),
            refiner,
            device,
            checkpoint,
            parameters,
        })
    }

    /// Replace the refinement hook.
    #[must_use]
    pub fn with_refiner(mut self, refiner: Box<dyn Refiner>) -> Self {
        self.refiner = refiner;
        self
    }

    /// Disable refinement.
    #[must_use]
    pub fn without_refiner(self) -> Self {
        self.with_refiner(Box::new(NoopRefiner))
    }

    #[must_use]
    pub fn status(&self) -> RecognizerStatus {
        RecognizerStatus {
            model_loaded: self.checkpoint.is_some(),
            device: format!("{:?}", self.device).to_lowercase(),
            checkpoint: self.checkpoint.clone(),
            parameters: self.parameters,
            refiner: self.refiner.name(),
        }
    }

    #[must_use]
    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    /// Greedy-decode an already prepared image. No refinement.
    pub fn recognize_image(&self, image: &PreparedImage) -> Result<String> {
        let images = image.to_tensor(&self.device)?.unsqueeze(0)?;
        self.recognize_batch(&images)?
            .pop()
            .ok_or_else(|| QuillError::shape("encoder returned an empty batch"))
    }

    /// Greedy-decode a `(B, 1, H, W)` batch.
    pub fn recognize_batch(&self, images: &Tensor) -> Result<Vec<String>> {
        let log_probs = self.encoder.encode(images)?;
        self.decoder.decode_batch(&log_probs)
    }

    /// Decode image bytes, recognize, then refine.
    pub fn recognize_bytes(&self, bytes: &[u8]) -> Result<Recognition> {
        let prepared = self.preprocessor.prepare_bytes(bytes)?;
        let raw = self.recognize_image(&prepared)?;
        Ok(self.finish(raw, bytes))
    }

    /// Same as [`recognize_bytes`](Self::recognize_bytes) for a base64 or data-URL payload.
    pub fn recognize_payload(&self, payload: &str) -> Result<Recognition> {
        let (prepared, bytes) = self.preprocessor.prepare_payload(payload)?;
        let raw = self.recognize_image(&prepared)?;
        Ok(self.finish(raw, &bytes))
    }

    fn finish(&self, raw: String, image: &[u8]) -> Recognition {
        let text = self.refiner.refine(&raw, image);
        Recognition {
            refined: text != raw,
            text,
            raw,
        }
    }
}

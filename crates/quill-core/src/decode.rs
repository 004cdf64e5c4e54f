//! # Greedy CTC Decoding
//!
//! Best-path decoding: argmax per timestep, then collapse repeats and drop
//! blanks. Samples in a batch are decoded independently.

use std::sync::Arc;

use candle_core::{D, Tensor};

use crate::error::{QuillError, Result};
use crate::model::ensure_finite;
use crate::vocab::Vocabulary;

/// Greedy (best-path) CTC decoder.
#[derive(Debug, Clone)]
pub struct GreedyDecoder {
    vocab: Arc<Vocabulary>,
}

impl GreedyDecoder {
    #[must_use]
    pub fn new(vocab: Arc<Vocabulary>) -> Self {
        Self { vocab }
    }

    /// Collapse a raw per-timestep index path into text.
    ///
    /// An index is emitted when it is not the blank and differs from the
    /// previous raw index, so a blank between two equal indices keeps both.
    /// Indices with no character are skipped.
    #[must_use]
    pub fn collapse(&self, path: &[usize]) -> String {
        let blank = self.vocab.blank();
        let mut text = String::new();
        let mut prev = None;
        for &idx in path {
            if idx != blank && prev != Some(idx) {
                if let Some(c) = self.vocab.char_for(idx) {
                    text.push(c);
                }
            }
            prev = Some(idx);
        }
        text
    }

    /// Decode one `T x C` sequence of scores.
    pub fn decode_sequence(&self, scores: &[Vec<f32>]) -> Result<String> {
        let mut path = Vec::with_capacity(scores.len());
        for row in scores {
            if row.iter().any(|v| !v.is_finite()) {
                return Err(QuillError::NumericInstability {
                    stage: "decoder input",
                });
            }
            let best = row
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.total_cmp(b))
                .map(|(i, _)| i)
                .ok_or_else(|| QuillError::shape("timestep with no class scores"))?;
            path.push(best);
        }
        Ok(self.collapse(&path))
    }

    /// Decode a `(B, T, C)` batch of log-probabilities into one string per sample.
    pub fn decode_batch(&self, log_probs: &Tensor) -> Result<Vec<String>> {
        let (_, _, classes) = log_probs.dims3()?;
        if classes != self.vocab.num_classes() {
            return Err(QuillError::shape(format!(
                "{classes} classes in scores but vocabulary has {}",
                self.vocab.num_classes()
            )));
        }
        ensure_finite(log_probs, "decoder input")?;

        let paths = log_probs.argmax(D::Minus1)?.to_vec2::<u32>()?;
        Ok(paths
            .iter()
            .map(|path| {
                let path: Vec<usize> = path.iter().map(|&i| i as usize).collect();
                self.collapse(&path)
            })
            .collect())
    }
}

//! Character error rate.

use crate::error::{QuillError, Result};

/// Character-level Levenshtein distance.
#[must_use]
pub fn edit_distance(prediction: &str, reference: &str) -> usize {
    strsim::levenshtein(prediction, reference)
}

/// Edit distance normalized by reference length; 0 for an empty reference.
#[must_use]
pub fn cer(prediction: &str, reference: &str) -> f64 {
    let len = reference.chars().count();
    if len == 0 {
        return 0.0;
    }
    edit_distance(prediction, reference) as f64 / len as f64
}

/// Mean per-sample CER over paired predictions and references.
///
/// Both slices must have the same length.
pub fn mean_cer<P, R>(predictions: &[P], references: &[R]) -> Result<f64>
where
    P: AsRef<str>,
    R: AsRef<str>,
{
    if predictions.len() != references.len() {
        return Err(QuillError::shape(format!(
            "{} predictions for {} references",
            predictions.len(),
            references.len()
        )));
    }
    let mut acc = CerAccumulator::default();
    for (p, r) in predictions.iter().zip(references) {
        acc.add(p.as_ref(), r.as_ref());
    }
    Ok(acc.mean())
}

/// Running mean of per-sample CER across batches.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CerAccumulator {
    total: f64,
    samples: usize,
}

impl CerAccumulator {
    pub fn add(&mut self, prediction: &str, reference: &str) {
        self.total += cer(prediction, reference);
        self.samples += 1;
    }

    #[must_use]
    pub fn samples(&self) -> usize {
        self.samples
    }

    /// 0 when nothing has been added.
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total / self.samples as f64
        }
    }
}

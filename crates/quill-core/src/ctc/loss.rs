use candle_core::Tensor;
use tracing::warn;

use crate::ctc::aligner::{CtcAligner, SampleAlignment};
use crate::error::{QuillError, Result};
use crate::vocab::Label;

/// Batch CTC loss with a differentiable scalar.
///
/// Samples whose label cannot fit in their input length are excluded from
/// both the sum and the count, so they contribute neither loss nor gradient
/// and do not dilute the average of the remaining samples.
#[derive(Debug, Clone, Copy)]
pub struct CtcLoss {
    aligner: CtcAligner,
}

/// Output of [`CtcLoss::forward`].
pub struct CtcBatchLoss {
    /// Scalar tensor: mean NLL over feasible samples, with the exact CTC
    /// gradient w.r.t. the log-probabilities.
    pub loss: Tensor,
    /// Same value as `loss`, read back to the host.
    pub value: f32,
    /// Per-sample NLL; `None` for excluded samples.
    pub per_sample: Vec<Option<f64>>,
}

impl CtcBatchLoss {
    #[must_use]
    pub fn excluded(&self) -> usize {
        self.per_sample.iter().filter(|s| s.is_none()).count()
    }

    #[must_use]
    pub fn included(&self) -> usize {
        self.per_sample.len() - self.excluded()
    }
}

impl CtcLoss {
    #[must_use]
    pub fn new(blank: usize) -> Self {
        Self {
            aligner: CtcAligner::new(blank),
        }
    }

    /// `log_probs` is `(B, T, C)`; `labels` and `input_lengths` have one entry per sample.
    pub fn forward(
        &self,
        log_probs: &Tensor,
        labels: &[Label],
        input_lengths: &[usize],
    ) -> Result<CtcBatchLoss> {
        let (batch, steps, classes) = log_probs.dims3()?;
        if labels.len() != batch || input_lengths.len() != batch {
            return Err(QuillError::shape(format!(
                "batch of {batch} sequences but {} labels and {} input lengths",
                labels.len(),
                input_lengths.len()
            )));
        }

        let host = log_probs.to_vec3::<f32>()?;

        // Constant weights whose product with the log-probs yields the CTC gradient.
        let mut weights = vec![0.0f32; batch * steps * classes];
        let mut per_sample = Vec::with_capacity(batch);
        let mut nll_sum = 0.0f64;
        let mut weighted_sum = 0.0f64;

        for (b, ((rows, label), &input_length)) in
            host.iter().zip(labels).zip(input_lengths).enumerate()
        {
            match self.aligner.align(rows, input_length, label.as_slice())? {
                SampleAlignment::Feasible(alignment) => {
                    nll_sum += alignment.nll();
                    let offset = b * steps * classes;
                    for (i, &occ) in alignment.occupancy_table().iter().enumerate() {
                        weights[offset + i] = occ as f32;
                        weighted_sum += occ * f64::from(rows[i / classes][i % classes]);
                    }
                    per_sample.push(Some(alignment.nll()));
                }
                SampleAlignment::Infeasible {
                    required,
                    available,
                } => {
                    warn!(sample = b, required, available, "label does not fit input length, excluded from loss");
                    per_sample.push(None);
                }
            }
        }

        let included = per_sample.iter().filter(|s| s.is_some()).count();
        let weights = Tensor::from_vec(weights, (batch, steps, classes), log_probs.device())?;
        let weighted = log_probs.mul(&weights)?.sum_all()?;

        let (loss, value) = if included == 0 {
            // Keeps the graph connected with an all-zero gradient.
            (weighted.affine(0.0, 0.0)?, 0.0)
        } else {
            let n = included as f64;
            let mean_nll = nll_sum / n;
            // -weighted / n carries the gradient; the shift restores the true value.
            let loss = weighted.affine(-1.0 / n, mean_nll + weighted_sum / n)?;
            (loss, mean_nll as f32)
        };

        if !value.is_finite() {
            return Err(QuillError::NumericInstability { stage: "ctc loss" });
        }

        Ok(CtcBatchLoss {
            loss,
            value,
            per_sample,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{D, Device, Var};

    fn labels(raw: &[&[usize]]) -> Vec<Label> {
        raw.iter().map(|l| Label::new(l.to_vec()).unwrap()).collect()
    }

    fn logits(batch: usize, steps: usize, classes: usize) -> Var {
        let data: Vec<f32> = (0..batch * steps * classes)
            .map(|i| ((i * 37 % 11) as f32 - 5.0) * 0.3)
            .collect();
        let t = Tensor::from_vec(data, (batch, steps, classes), &Device::Cpu).unwrap();
        Var::from_tensor(&t).unwrap()
    }

    #[test]
    fn loss_is_finite_and_non_negative() {
        let var = logits(3, 8, 5);
        let lp = candle_nn::ops::log_softmax(var.as_tensor(), D::Minus1).unwrap();
        let out = CtcLoss::new(0)
            .forward(&lp, &labels(&[&[1, 2], &[3, 3, 4], &[4]]), &[8, 8, 8])
            .unwrap();

        assert!(out.value.is_finite());
        assert!(out.value >= 0.0);
        assert_eq!(out.excluded(), 0);
        let scalar = out.loss.to_scalar::<f32>().unwrap();
        assert!((scalar - out.value).abs() < 1e-3 * out.value.max(1.0));
    }

    #[test]
    fn gradient_is_softmax_minus_occupancy() {
        let var = logits(1, 4, 3);
        let lp = candle_nn::ops::log_softmax(var.as_tensor(), D::Minus1).unwrap();
        let out = CtcLoss::new(0).forward(&lp, &labels(&[&[1, 2]]), &[4]).unwrap();

        let grads = out.loss.backward().unwrap();
        let grad = grads.get(var.as_tensor()).unwrap().to_vec3::<f32>().unwrap();
        // softmax and occupancy both sum to one per step, so the gradient sums to zero.
        for row in &grad[0] {
            let total: f32 = row.iter().sum();
            assert!(total.abs() < 1e-5);
        }
        assert!(grad[0].iter().flatten().any(|g| g.abs() > 1e-4));
    }

    #[test]
    fn infeasible_samples_are_excluded_from_the_mean() {
        let var = logits(2, 3, 4);
        let lp = candle_nn::ops::log_softmax(var.as_tensor(), D::Minus1).unwrap();
        let loss = CtcLoss::new(0);

        // Second label needs 5 steps but only 3 exist.
        let mixed = loss
            .forward(&lp, &labels(&[&[1, 2], &[3, 3, 3]]), &[3, 3])
            .unwrap();
        assert_eq!(mixed.excluded(), 1);
        assert_eq!(mixed.included(), 1);

        let first = lp.narrow(0, 0, 1).unwrap();
        let alone = loss.forward(&first, &labels(&[&[1, 2]]), &[3]).unwrap();
        assert!((mixed.value - alone.value).abs() < 1e-5);
    }

    #[test]
    fn all_infeasible_batch_is_zero_with_zero_gradient() {
        let var = logits(1, 2, 3);
        let lp = candle_nn::ops::log_softmax(var.as_tensor(), D::Minus1).unwrap();
        let out = CtcLoss::new(0).forward(&lp, &labels(&[&[1, 1, 2]]), &[2]).unwrap();

        assert_eq!(out.value, 0.0);
        assert_eq!(out.excluded(), 1);
        let grads = out.loss.backward().unwrap();
        let grad = grads.get(var.as_tensor()).unwrap().to_vec3::<f32>().unwrap();
        assert!(grad.iter().flatten().flatten().all(|g| *g == 0.0));
    }

    #[test]
    fn mismatched_lengths_are_shape_errors() {
        let var = logits(2, 4, 3);
        let lp = candle_nn::ops::log_softmax(var.as_tensor(), D::Minus1).unwrap();
        let loss = CtcLoss::new(0);

        assert!(matches!(
            loss.forward(&lp, &labels(&[&[1]]), &[4, 4]),
            Err(QuillError::Shape { .. })
        ));
        assert!(matches!(
            loss.forward(&lp, &labels(&[&[1], &[2]]), &[4, 9]),
            Err(QuillError::Shape { .. })
        ));
    }
}

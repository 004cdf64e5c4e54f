//! Forward-backward over the blank-augmented label lattice.
//!
//! The lattice for label `l` of length `L` has `S = 2L + 1` states
//! `[blank, l1, blank, l2, ..., lL, blank]`. Both passes are stored as dense
//! `T x S` tables in log space.

use crate::error::{QuillError, Result};

/// `log(exp(a) + exp(b) + ...)`, returning `-inf` when every term is `-inf`.
fn log_sum_exp(terms: &[f64]) -> f64 {
    let max = terms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + terms.iter().map(|x| (x - max).exp()).sum::<f64>().ln()
}

/// Result of aligning one sample against its label.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleAlignment {
    Feasible(Alignment),
    /// The label needs more timesteps than the input provides.
    Infeasible { required: usize, available: usize },
}

/// Log-likelihood of a label and the per-(timestep, class) posterior
/// occupancy, which is the negative gradient of the loss w.r.t. the inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Alignment {
    log_likelihood: f64,
    occupancy: Vec<f64>,
    classes: usize,
}

impl Alignment {
    #[must_use]
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// Negative log-likelihood (the per-sample CTC loss).
    #[must_use]
    pub fn nll(&self) -> f64 {
        -self.log_likelihood
    }

    /// Posterior mass of class `k` at timestep `t`; `None` outside the table.
    #[must_use]
    pub fn occupancy(&self, t: usize, k: usize) -> Option<f64> {
        if k >= self.classes {
            return None;
        }
        self.occupancy.get(t * self.classes + k).copied()
    }

    /// Row-major `T x C` occupancy table (rows past the input length are zero).
    #[must_use]
    pub fn occupancy_table(&self) -> &[f64] {
        &self.occupancy
    }
}

/// Dense `steps x states` table.
struct Table {
    cells: Vec<f64>,
    states: usize,
}

impl Table {
    fn new(steps: usize, states: usize) -> Self {
        Self {
            cells: vec![f64::NEG_INFINITY; steps * states],
            states,
        }
    }

    #[inline]
    fn get(&self, t: usize, s: usize) -> f64 {
        self.cells[t * self.states + s]
    }

    #[inline]
    fn set(&mut self, t: usize, s: usize, v: f64) {
        self.cells[t * self.states + s] = v;
    }
}

/// CTC lattice computations for a single sample.
#[derive(Debug, Clone, Copy)]
pub struct CtcAligner {
    blank: usize,
}

impl CtcAligner {
    #[must_use]
    pub fn new(blank: usize) -> Self {
        Self { blank }
    }

    #[must_use]
    pub fn blank(&self) -> usize {
        self.blank
    }

    /// Fewest timesteps that can emit `label`: one per symbol plus one
    /// separating blank per adjacent repeat.
    #[must_use]
    pub fn min_input_length(label: &[usize]) -> usize {
        let repeats = label.windows(2).filter(|w| w[0] == w[1]).count();
        label.len() + repeats
    }

    fn augment(&self, label: &[usize]) -> Vec<usize> {
        let mut states = Vec::with_capacity(2 * label.len() + 1);
        states.push(self.blank);
        for &c in label {
            states.push(c);
            states.push(self.blank);
        }
        states
    }

    /// Align `label` against the first `input_length` rows of `log_probs`
    /// (`T x C` log-probabilities).
    pub fn align(
        &self,
        log_probs: &[Vec<f32>],
        input_length: usize,
        label: &[usize],
    ) -> Result<SampleAlignment> {
        let steps = log_probs.len();
        let classes = log_probs.first().map_or(0, Vec::len);

        if input_length > steps {
            return Err(QuillError::shape(format!(
                "input length {input_length} exceeds {steps} available timesteps"
            )));
        }
        if log_probs.iter().any(|row| row.len() != classes) {
            return Err(QuillError::shape("ragged log-probability rows"));
        }
        if self.blank >= classes {
            return Err(QuillError::shape(format!(
                "blank index {} out of range for {classes} classes",
                self.blank
            )));
        }
        if let Some(&bad) = label.iter().find(|&&c| c >= classes || c == self.blank) {
            return Err(QuillError::shape(format!(
                "label index {bad} is the blank or out of range for {classes} classes"
            )));
        }
        if log_probs[..input_length]
            .iter()
            .flatten()
            .any(|v| !v.is_finite())
        {
            return Err(QuillError::NumericInstability {
                stage: "ctc input",
            });
        }

        let required = Self::min_input_length(label);
        if input_length < required || input_length == 0 {
            return Ok(SampleAlignment::Infeasible {
                required: required.max(1),
                available: input_length,
            });
        }

        let ext = self.augment(label);
        let s_len = ext.len();
        let t_len = input_length;
        let emit = |t: usize, s: usize| f64::from(log_probs[t][ext[s]]);
        // Skipping a blank is only allowed between distinct symbols.
        let can_skip = |s: usize| s >= 2 && ext[s] != self.blank && ext[s] != ext[s - 2];

        let mut alpha = Table::new(t_len, s_len);
        alpha.set(0, 0, emit(0, 0));
        if s_len > 1 {
            alpha.set(0, 1, emit(0, 1));
        }
        for t in 1..t_len {
            for s in 0..s_len {
                let mut terms = [f64::NEG_INFINITY; 3];
                terms[0] = alpha.get(t - 1, s);
                if s >= 1 {
                    terms[1] = alpha.get(t - 1, s - 1);
                }
                if can_skip(s) {
                    terms[2] = alpha.get(t - 1, s - 2);
                }
                alpha.set(t, s, log_sum_exp(&terms) + emit(t, s));
            }
        }

        // beta(t, s): log-probability of finishing the label from state s at t,
        // excluding the emission at t itself.
        let mut beta = Table::new(t_len, s_len);
        beta.set(t_len - 1, s_len - 1, 0.0);
        if s_len > 1 {
            beta.set(t_len - 1, s_len - 2, 0.0);
        }
        for t in (0..t_len - 1).rev() {
            for s in 0..s_len {
                let mut terms = [f64::NEG_INFINITY; 3];
                terms[0] = beta.get(t + 1, s) + emit(t + 1, s);
                if s + 1 < s_len {
                    terms[1] = beta.get(t + 1, s + 1) + emit(t + 1, s + 1);
                }
                if s + 2 < s_len && can_skip(s + 2) {
                    terms[2] = beta.get(t + 1, s + 2) + emit(t + 1, s + 2);
                }
                beta.set(t, s, log_sum_exp(&terms));
            }
        }

        let last = t_len - 1;
        let log_likelihood = if s_len > 1 {
            log_sum_exp(&[alpha.get(last, s_len - 1), alpha.get(last, s_len - 2)])
        } else {
            alpha.get(last, 0)
        };
        if !log_likelihood.is_finite() {
            return Err(QuillError::NumericInstability {
                stage: "ctc lattice",
            });
        }

        let mut occupancy = vec![0.0f64; steps * classes];
        for t in 0..t_len {
            for s in 0..s_len {
                let gamma = alpha.get(t, s) + beta.get(t, s) - log_likelihood;
                if gamma > f64::NEG_INFINITY {
                    occupancy[t * classes + ext[s]] += gamma.exp();
                }
            }
        }

        Ok(SampleAlignment::Feasible(Alignment {
            log_likelihood,
            occupancy,
            classes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(steps: usize, classes: usize) -> Vec<Vec<f32>> {
        vec![vec![-(classes as f32).ln(); classes]; steps]
    }

    fn feasible(a: SampleAlignment) -> Alignment {
        match a {
            SampleAlignment::Feasible(a) => a,
            other => panic!("expected a feasible alignment, got {other:?}"),
        }
    }

    #[test]
    fn min_input_length_counts_repeats() {
        assert_eq!(CtcAligner::min_input_length(&[]), 0);
        assert_eq!(CtcAligner::min_input_length(&[1, 2, 3]), 3);
        assert_eq!(CtcAligner::min_input_length(&[1, 1, 2, 2, 2]), 8);
    }

    #[test]
    fn single_step_single_label() {
        let lp = vec![vec![0.4f32.ln(), 0.6f32.ln()]];
        let a = feasible(CtcAligner::new(0).align(&lp, 1, &[1]).unwrap());
        assert!((a.nll() + 0.6f64.ln()).abs() < 1e-6);
        assert!((a.occupancy(0, 1).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn sums_all_collapsing_paths() {
        // "a" over two uniform steps: paths aa, a-, -a each with p = 1/4.
        let a = feasible(CtcAligner::new(0).align(&uniform(2, 2), 2, &[1]).unwrap());
        assert!((a.log_likelihood() - 0.75f64.ln()).abs() < 1e-6);

        // "aa" over three steps has exactly one path: a - a.
        let a = feasible(CtcAligner::new(0).align(&uniform(3, 2), 3, &[1, 1]).unwrap());
        assert!((a.log_likelihood() - (1.0f64 / 8.0).ln()).abs() < 1e-6);
    }

    #[test]
    fn too_short_input_is_infeasible() {
        let result = CtcAligner::new(0).align(&uniform(2, 3), 2, &[1, 1]).unwrap();
        assert_eq!(
            result,
            SampleAlignment::Infeasible {
                required: 3,
                available: 2
            }
        );
    }

    #[test]
    fn occupancy_is_a_distribution_per_step() {
        let lp: Vec<Vec<f32>> = (0..6)
            .map(|t| {
                let raw = [0.2 + t as f32 * 0.1, 1.0, 0.3, 0.7];
                let z: f32 = raw.iter().map(|x| x.exp()).sum::<f32>().ln();
                raw.iter().map(|x| x - z).collect()
            })
            .collect();
        let a = feasible(CtcAligner::new(0).align(&lp, 5, &[2, 3, 2]).unwrap());
        for t in 0..5 {
            let total: f64 = (0..4).map(|k| a.occupancy(t, k).unwrap()).sum();
            assert!((total - 1.0).abs() < 1e-6, "step {t} sums to {total}");
        }
        // Past the input length nothing is occupied.
        assert!((0..4).all(|k| a.occupancy(5, k).unwrap() == 0.0));
    }

    #[test]
    fn occupancy_outside_the_table_is_none() {
        let a = feasible(CtcAligner::new(0).align(&uniform(3, 4), 3, &[1]).unwrap());
        assert!(a.occupancy(2, 3).is_some());
        assert_eq!(a.occupancy(3, 0), None);
        assert_eq!(a.occupancy(0, 4), None);
    }

    #[test]
    fn occupancy_matches_finite_differences() {
        let lp: Vec<Vec<f32>> = vec![
            vec![-0.9, -1.2, -1.4],
            vec![-1.5, -0.6, -1.3],
            vec![-1.1, -1.0, -1.2],
            vec![-0.7, -1.6, -1.1],
        ];
        let label = [1, 2];
        let aligner = CtcAligner::new(0);
        let base = feasible(aligner.align(&lp, 4, &label).unwrap());

        let eps = 1e-3f32;
        for t in 0..4 {
            for k in 0..3 {
                let mut plus = lp.clone();
                plus[t][k] += eps;
                let mut minus = lp.clone();
                minus[t][k] -= eps;
                let up = feasible(aligner.align(&plus, 4, &label).unwrap()).nll();
                let down = feasible(aligner.align(&minus, 4, &label).unwrap()).nll();
                let numeric = (up - down) / (2.0 * f64::from(eps));
                assert!(
                    (numeric + base.occupancy(t, k).unwrap()).abs() < 1e-3,
                    "t={t} k={k}: numeric {numeric} vs occupancy {}",
                    base.occupancy(t, k).unwrap()
                );
            }
        }
    }

    #[test]
    fn shape_violations_fail_fast() {
        let aligner = CtcAligner::new(0);
        let lp = uniform(4, 3);
        assert!(matches!(aligner.align(&lp, 5, &[1]), Err(QuillError::Shape { .. })));
        assert!(matches!(aligner.align(&lp, 4, &[3]), Err(QuillError::Shape { .. })));
        assert!(matches!(aligner.align(&lp, 4, &[0]), Err(QuillError::Shape { .. })));
    }

    #[test]
    fn non_finite_input_is_reported() {
        let mut lp = uniform(3, 3);
        lp[1][2] = f32::NAN;
        assert!(matches!(
            CtcAligner::new(0).align(&lp, 3, &[1]),
            Err(QuillError::NumericInstability { .. })
        ));
    }
}

//! # Connectionist Temporal Classification
//!
//! [`CtcAligner`] runs the forward-backward dynamic program for one sample on
//! the host; [`CtcLoss`] batches it and exposes the result as a candle scalar
//! whose gradient is the exact CTC gradient.

mod aligner;
mod loss;

pub use aligner::{Alignment, CtcAligner, SampleAlignment};
pub use loss::{CtcBatchLoss, CtcLoss};

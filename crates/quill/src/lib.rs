//! # Quill
//!
//! Handwritten text recognition: a CRNN sequence encoder trained with CTC
//! and decoded greedily. This crate re-exports the inference API from
//! [`quill_core`] and the training loop from [`quill_trainer`].

pub use quill_core::*;

pub mod train {
    pub use quill_trainer::*;
}

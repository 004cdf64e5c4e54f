//! # Quill Core
//!
//! Handwritten text recognition from fixed-size grayscale images. A CRNN
//! encoder maps each image to per-timestep class log-probabilities; CTC
//! trains it without character segmentation and greedy best-path decoding
//! turns its output into text.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use quill_core::{GreedyDecoder, Vocabulary};
//!
//! let vocab = Arc::new(Vocabulary::new("ab").unwrap());
//! let decoder = GreedyDecoder::new(vocab);
//!
//! // blank = 0, 'a' = 1, 'b' = 2
//! assert_eq!(decoder.collapse(&[1, 1, 2, 0, 2]), "aba");
//! ```
pub mod checkpoint;
pub mod config;
pub mod ctc;
pub mod decode;
pub mod error;
pub mod metrics;
pub mod model;
pub mod preprocess;
pub mod recognizer;
pub mod refine;
pub mod vocab;

// Re-export primary API
pub use checkpoint::CheckpointInfo;
pub use config::{EncoderConfig, IMAGE_HEIGHT, IMAGE_WIDTH};
pub use ctc::{Alignment, CtcAligner, CtcBatchLoss, CtcLoss, SampleAlignment};
pub use decode::GreedyDecoder;
pub use error::{QuillError, Result};
pub use metrics::{CerAccumulator, cer, edit_distance, mean_cer};
pub use model::{SequenceEncoder, ensure_finite};
pub use preprocess::{PreparedImage, Preprocessor};
pub use recognizer::{Recognition, Recognizer, RecognizerConfig, RecognizerStatus};
pub use refine::{HttpRefiner, NoopRefiner, Refiner, RefinerConfig, refiner_from_config};
pub use vocab::{BLANK, DEFAULT_ALPHABET, Label, Vocabulary};

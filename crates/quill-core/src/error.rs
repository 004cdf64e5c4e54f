use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during Quill core operations.
#[derive(Debug, Error)]
pub enum QuillError {
    /// The source image (or its transport encoding) could not be decoded.
    #[error("failed to decode image: {message}")]
    Decode {
        /// What went wrong while decoding.
        message: String,
    },

    /// Declared sequence or label lengths disagree with the actual tensors.
    ///
    /// This is a contract violation between caller and core, not a
    /// recoverable runtime condition.
    #[error("shape contract violated: {message}")]
    Shape {
        /// Description of the mismatch.
        message: String,
    },

    /// NaN or infinity detected in a tensor that must be finite.
    #[error("numeric instability detected in {stage}")]
    NumericInstability {
        /// Pipeline stage that produced the non-finite values.
        stage: &'static str,
    },

    /// A checkpoint exists but could not be read or applied.
    #[error("checkpoint {path:?} is unusable: {message}")]
    Checkpoint {
        /// Location of the offending checkpoint.
        path: PathBuf,
        /// Reason it was rejected.
        message: String,
    },

    /// The vocabulary or encoder configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Filesystem failure.
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Candle tensor runtime error.
    #[error("tensor runtime error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl QuillError {
    pub(crate) fn decode(message: impl std::fmt::Display) -> Self {
        Self::Decode {
            message: message.to_string(),
        }
    }

    pub(crate) fn shape(message: impl Into<String>) -> Self {
        Self::Shape {
            message: message.into(),
        }
    }

    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    pub(crate) fn checkpoint(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        Self::Checkpoint {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// Result type alias for Quill operations.
pub type Result<T> = std::result::Result<T, QuillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = QuillError::NumericInstability {
            stage: "encoder output",
        };
        assert_eq!(err.to_string(), "numeric instability detected in encoder output");

        let err = QuillError::shape("input length 40 exceeds 32 timesteps");
        assert!(err.to_string().contains("input length 40"));

        let err = QuillError::decode("bad png header");
        assert!(err.to_string().starts_with("failed to decode image"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<QuillError>();
    }
}

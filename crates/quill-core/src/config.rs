use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{QuillError, Result};

/// Fixed input height expected by the encoder.
pub const IMAGE_HEIGHT: usize = 32;
/// Fixed input width expected by the encoder.
pub const IMAGE_WIDTH: usize = 128;
/// Number of convolutional stages in the feature extractor.
pub const CONV_STAGES: usize = 5;
/// Width reduction applied by the convolutional stack.
pub const WIDTH_REDUCTION: usize = 4;
/// Height reduction applied by the convolutional stack.
pub const HEIGHT_REDUCTION: usize = 16;

/// Architecture of the [`SequenceEncoder`](crate::model::SequenceEncoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    #[serde(default = "default_height")]
    pub image_height: usize,
    #[serde(default = "default_width")]
    pub image_width: usize,
    /// Output channels of the five conv stages.
    #[serde(default = "default_conv_channels")]
    pub conv_channels: Vec<usize>,
    /// Hidden width per direction of each recurrent layer.
    #[serde(default = "default_lstm_hidden")]
    pub lstm_hidden: usize,
    #[serde(default = "default_lstm_layers")]
    pub lstm_layers: usize,
    /// Dropout between stacked recurrent layers (training only).
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

fn default_height() -> usize {
    IMAGE_HEIGHT
}
fn default_width() -> usize {
    IMAGE_WIDTH
}
fn default_conv_channels() -> Vec<usize> {
    vec![32, 64, 128, 256, 512]
}
fn default_lstm_hidden() -> usize {
    256
}
fn default_lstm_layers() -> usize {
    2
}
fn default_dropout() -> f32 {
    0.2
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            image_height: default_height(),
            image_width: default_width(),
            conv_channels: default_conv_channels(),
            lstm_hidden: default_lstm_hidden(),
            lstm_layers: default_lstm_layers(),
            dropout: default_dropout(),
        }
    }
}

impl EncoderConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| QuillError::io("reading encoder config", e))?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| QuillError::InvalidConfig(format!("encoder config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the pooling schedule can produce the fixed time axis.
    pub fn validate(&self) -> Result<()> {
        if self.conv_channels.len() != CONV_STAGES {
            return Err(QuillError::InvalidConfig(format!(
                "expected {CONV_STAGES} conv stages, got {}",
                self.conv_channels.len()
            )));
        }
        if self.conv_channels.contains(&0) || self.lstm_hidden == 0 || self.lstm_layers == 0 {
            return Err(QuillError::InvalidConfig(
                "channel, hidden and layer counts must be non-zero".into(),
            ));
        }
        if self.image_height == 0 || self.image_height % HEIGHT_REDUCTION != 0 {
            return Err(QuillError::InvalidConfig(format!(
                "image height {} is not a positive multiple of {HEIGHT_REDUCTION}",
                self.image_height
            )));
        }
        if self.image_width == 0 || self.image_width % WIDTH_REDUCTION != 0 {
            return Err(QuillError::InvalidConfig(format!(
                "image width {} is not a positive multiple of {WIDTH_REDUCTION}",
                self.image_width
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(QuillError::InvalidConfig(format!(
                "dropout {} outside [0, 1)",
                self.dropout
            )));
        }
        Ok(())
    }

    /// Length of the encoder's time axis (T).
    #[must_use]
    pub fn time_steps(&self) -> usize {
        self.image_width / WIDTH_REDUCTION
    }

    /// Height left after the pooling stages.
    #[must_use]
    pub fn final_height(&self) -> usize {
        self.image_height / HEIGHT_REDUCTION
    }

    /// Per-timestep feature width fed to the recurrent stack.
    #[must_use]
    pub fn feature_dim(&self) -> usize {
        self.conv_channels[CONV_STAGES - 1] * self.final_height()
    }
}

//! # Sequence Encoder
//!
//! CRNN: a five-stage convolutional feature extractor whose final width
//! axis becomes the time axis, a stacked bidirectional LSTM, and a linear
//! projection to per-class log-probabilities.

mod conv;
mod recurrent;

use candle_core::{D, Module, ModuleT, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::config::EncoderConfig;
use crate::error::{QuillError, Result};

use conv::FeatureExtractor;
use recurrent::BiLstm;

/// Image-to-sequence encoder. Owns all of its parameters.
pub struct SequenceEncoder {
    features: FeatureExtractor,
    rnn: BiLstm,
    classifier: Linear,
    config: EncoderConfig,
    num_classes: usize,
}

impl SequenceEncoder {
    /// Build the encoder, creating or fetching parameters through `vb`.
    pub fn new(config: &EncoderConfig, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        if num_classes < 2 {
            return Err(QuillError::InvalidConfig(format!(
                "need at least one character class besides blank, got {num_classes} classes"
            )));
        }

        let features = FeatureExtractor::load(config, vb.clone())?;
        let rnn = BiLstm::load(
            config.feature_dim(),
            config.lstm_hidden,
            config.lstm_layers,
            config.dropout,
            vb.pp("rnn"),
        )?;
        let classifier = candle_nn::linear(config.lstm_hidden * 2, num_classes, vb.pp("classifier"))?;

        Ok(Self {
            features,
            rnn,
            classifier,
            config: config.clone(),
            num_classes,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Inference forward pass with a finiteness check on the output.
    ///
    /// `images` is `(B, 1, H, W)`; the result is `(B, T, C)` log-probabilities.
    pub fn encode(&self, images: &Tensor) -> Result<Tensor> {
        self.check_input(images)?;
        let log_probs = self.forward_t(images, false)?;
        ensure_finite(&log_probs, "encoder output")?;
        Ok(log_probs)
    }

    fn check_input(&self, images: &Tensor) -> Result<()> {
        let (_, c, h, w) = images.dims4()?;
        if (c, h, w) != (1, self.config.image_height, self.config.image_width) {
            return Err(QuillError::shape(format!(
                "expected images of shape (B, 1, {}, {}), got {:?}",
                self.config.image_height,
                self.config.image_width,
                images.dims()
            )));
        }
        Ok(())
    }
}

impl ModuleT for SequenceEncoder {
    fn forward_t(&self, images: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.features.forward_t(images, train)?;

        // (B, C, H', W') -> (B, W', C * H'): width is time, channel x height is the feature.
        let (b, c, h, w) = xs.dims4()?;
        let xs = xs.permute((0, 3, 1, 2))?.contiguous()?.reshape((b, w, c * h))?;

        let xs = self.rnn.forward_t(&xs, train)?;
        let logits = self.classifier.forward(&xs)?;
        candle_nn::ops::log_softmax(&logits, D::Minus1)
    }
}

/// Fail with [`QuillError::NumericInstability`] if any value is NaN or infinite.
pub fn ensure_finite(tensor: &Tensor, stage: &'static str) -> Result<()> {
    let values = tensor.flatten_all()?.to_vec1::<f32>()?;
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(QuillError::NumericInstability { stage })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    /// Small architecture with the same geometry, for fast tests.
    pub(crate) fn tiny_config() -> EncoderConfig {
        EncoderConfig {
            conv_channels: vec![4, 8, 8, 16, 16],
            lstm_hidden: 8,
            lstm_layers: 2,
            dropout: 0.0,
            ..EncoderConfig::default()
        }
    }

    #[test]
    fn output_shape_is_time_by_classes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = SequenceEncoder::new(&tiny_config(), 11, vb).unwrap();

        let images = Tensor::rand(0f32, 1., (2, 1, 32, 128), &Device::Cpu).unwrap();
        let out = encoder.encode(&images).unwrap();
        assert_eq!(out.dims(), &[2, 32, 11]);

        // Each timestep is a log distribution.
        let probs = out.exp().unwrap().sum(D::Minus1).unwrap().to_vec2::<f32>().unwrap();
        for row in probs {
            for p in row {
                assert!((p - 1.0).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn default_architecture_builds() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = SequenceEncoder::new(&EncoderConfig::default(), 96, vb).unwrap();
        assert_eq!(encoder.num_classes(), 96);
        assert!(varmap.all_vars().len() > 20);
    }

    #[test]
    fn rejects_wrong_image_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = SequenceEncoder::new(&tiny_config(), 5, vb).unwrap();

        let images = Tensor::zeros((1, 1, 32, 100), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(encoder.encode(&images), Err(QuillError::Shape { .. })));
    }

    #[test]
    fn non_finite_values_are_reported() {
        let t = Tensor::new(&[0.0f32, f32::NAN], &Device::Cpu).unwrap();
        assert!(matches!(
            ensure_finite(&t, "test"),
            Err(QuillError::NumericInstability { stage: "test" })
        ));
        let t = Tensor::new(&[0.0f32, -3.5], &Device::Cpu).unwrap();
        assert!(ensure_finite(&t, "test").is_ok());
    }
}

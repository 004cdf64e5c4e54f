//! # Image Preprocessing
//!
//! Turns arbitrary grayscale (or color) images into the fixed `(1, H, W)`
//! tensor the encoder expects: resized without preserving aspect ratio,
//! scaled to `[0, 1]`, ink high and paper low.

use std::path::Path;

use base64::Engine;
use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use tracing::warn;

use crate::config::{EncoderConfig, IMAGE_HEIGHT, IMAGE_WIDTH};
use crate::error::{QuillError, Result};

/// A normalized single-channel image, row-major, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedImage {
    data: Vec<f32>,
    height: usize,
    width: usize,
}

impl PreparedImage {
    /// An all-paper image.
    #[must_use]
    pub fn blank(height: usize, width: usize) -> Self {
        Self {
            data: vec![0.0; height * width],
            height,
            width,
        }
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub fn pixels(&self) -> &[f32] {
        &self.data
    }

    #[must_use]
    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }

    /// Tensor of shape `(1, H, W)`.
    pub fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::from_slice(&self.data, (1, self.height, self.width), device)
    }
}

/// Resizes and normalizes images to a fixed geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preprocessor {
    height: usize,
    width: usize,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self {
            height: IMAGE_HEIGHT,
            width: IMAGE_WIDTH,
        }
    }
}

impl Preprocessor {
    #[must_use]
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    #[must_use]
    pub fn from_config(config: &EncoderConfig) -> Self {
        Self::new(config.image_height, config.image_width)
    }

    /// Prepare a decoded image of any size or color type.
    #[must_use]
    pub fn prepare(&self, image: &DynamicImage) -> PreparedImage {
        self.prepare_gray(&image.to_luma8())
    }

    /// Prepare a grayscale image.
    #[must_use]
    pub fn prepare_gray(&self, image: &GrayImage) -> PreparedImage {
        let resized = image::imageops::resize(
            image,
            self.width as u32,
            self.height as u32,
            FilterType::Triangle,
        );

        let mut data: Vec<f32> = resized
            .into_raw()
            .into_iter()
            .map(|p| f32::from(p) / 255.0)
            .collect();

        // Dark ink on light paper gets flipped so ink is the high value.
        let mean = data.iter().sum::<f32>() / data.len().max(1) as f32;
        if mean > 0.5 {
            for v in &mut data {
                *v = 1.0 - *v;
            }
        }

        PreparedImage {
            data,
            height: self.height,
            width: self.width,
        }
    }

    /// Decode encoded image bytes (PNG, JPEG) and prepare them.
    ///
    /// Undecodable input is a [`QuillError::Decode`], never a blank image.
    pub fn prepare_bytes(&self, bytes: &[u8]) -> Result<PreparedImage> {
        let image = image::load_from_memory(bytes).map_err(QuillError::decode)?;
        Ok(self.prepare(&image))
    }

    /// Decode a base64 payload, with or without a `data:` URL prefix.
    ///
    /// Returns the prepared image along with the raw image bytes.
    pub fn prepare_payload(&self, payload: &str) -> Result<(PreparedImage, Vec<u8>)> {
        let bytes = decode_payload(payload)?;
        let prepared = self.prepare_bytes(&bytes)?;
        Ok((prepared, bytes))
    }

    /// Permissive loader for training data: unreadable files become blank
    /// images instead of failing the whole dataset.
    #[must_use]
    pub fn load_or_blank(&self, path: &Path) -> PreparedImage {
        match image::open(path) {
            Ok(image) => self.prepare(&image),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable training image, using blank");
                PreparedImage::blank(self.height, self.width)
            }
        }
    }
}

/// Strip an optional `data:<mime>;base64,` prefix and decode the rest.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>> {
    let encoded = match payload.split_once(',') {
        Some((header, body)) if header.starts_with("data:") => body,
        Some(_) => return Err(QuillError::decode("payload has a comma but no data: header")),
        None => payload,
    };

    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| QuillError::decode(format!("invalid base64 payload: {e}")))
}

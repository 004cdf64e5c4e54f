#![allow(dead_code)]

use image::{GrayImage, Luma};
use quill_core::{EncoderConfig, Preprocessor, Vocabulary};
use quill_trainer::{Dataset, Sample, TrainingConfig};

const GLYPH_SCALE: u32 = 3;

fn glyph(c: char) -> [&'static str; 7] {
    match c {
        'A' => [".###.", "#...#", "#...#", "#####", "#...#", "#...#", "#...#"],
        'B' => ["####.", "#...#", "#...#", "####.", "#...#", "#...#", "####."],
        '1' => ["..#..", ".##..", "..#..", "..#..", "..#..", "..#..", ".###."],
        '2' => [".###.", "#...#", "....#", "...#.", "..#..", ".#...", "#####"],
        _ => panic!("no glyph for {c:?}"),
    }
}

/// White-on-black 128x32 rendering of `text` in a 5x7 bitmap font.
pub fn render(text: &str) -> GrayImage {
    let mut img = GrayImage::new(128, 32);
    let mut x0 = 8;
    for c in text.chars() {
        for (row, line) in glyph(c).iter().enumerate() {
            for (col, cell) in line.chars().enumerate() {
                if cell != '#' {
                    continue;
                }
                for dy in 0..GLYPH_SCALE {
                    for dx in 0..GLYPH_SCALE {
                        let x = x0 + col as u32 * GLYPH_SCALE + dx;
                        let y = 5 + row as u32 * GLYPH_SCALE + dy;
                        img.put_pixel(x, y, Luma([255]));
                    }
                }
            }
        }
        x0 += 5 * GLYPH_SCALE + 4;
    }
    img
}

pub fn dataset(texts: &[&str], vocab: &Vocabulary) -> Dataset {
    let preprocessor = Preprocessor::default();
    Dataset::from_samples(
        texts
            .iter()
            .map(|t| Sample {
                image: preprocessor.prepare_gray(&render(t)),
                label: vocab.encode(t),
                text: t.to_string(),
            })
            .collect(),
    )
}

pub fn small_encoder() -> EncoderConfig {
    EncoderConfig {
        conv_channels: vec![16, 32, 48, 64, 64],
        lstm_hidden: 32,
        lstm_layers: 2,
        dropout: 0.0,
        ..EncoderConfig::default()
    }
}

pub fn training_config(batch_size: usize, learning_rate: f64) -> TrainingConfig {
    TrainingConfig {
        batch_size,
        learning_rate,
        seed: None,
        encoder: small_encoder(),
        ..TrainingConfig::default()
    }
}

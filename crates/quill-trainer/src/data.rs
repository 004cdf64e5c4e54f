//! Dataset manifests, sample loading and batching.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{Device, Tensor};
use oorandom::Rand32;
use quill_core::{Label, PreparedImage, Preprocessor, Vocabulary};
use tracing::{info, warn};

/// Dataset split; selects `<name>_manifest.txt` and the `<name>/` image directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Validation,
}

impl Split {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "val",
        }
    }

    #[must_use]
    pub fn manifest_path(self, data_dir: &Path) -> PathBuf {
        data_dir.join(format!("{}_manifest.txt", self.name()))
    }

    #[must_use]
    pub fn image_dir(self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.name())
    }
}

/// One `(image, text)` line of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub image: PathBuf,
    pub text: String,
}

/// Load a tab-separated manifest: `relative_image_path<TAB>label` per line.
///
/// Surrounding whitespace is stripped from each line, so a label keeps only
/// its interior spaces. Image paths resolve against `image_root`. Malformed
/// lines are skipped.
pub fn load_manifest(manifest: &Path, image_root: &Path) -> anyhow::Result<Vec<ManifestEntry>> {
    let file = File::open(manifest)
        .with_context(|| format!("opening manifest {}", manifest.display()))?;
    let reader = BufReader::new(file);

    let mut entries = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", manifest.display()))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() != 2 {
            warn!(manifest = %manifest.display(), line = lineno + 1, "malformed manifest line skipped");
            continue;
        }

        entries.push(ManifestEntry {
            image: image_root.join(parts[0].trim()),
            text: parts[1].to_string(),
        });
    }

    Ok(entries)
}

/// A preprocessed training example.
#[derive(Debug, Clone)]
pub struct Sample {
    pub image: PreparedImage,
    pub label: Label,
    pub text: String,
}

/// Mini-batch ready for the encoder.
pub struct Batch {
    /// `(B, 1, H, W)`
    pub images: Tensor,
    pub labels: Vec<Label>,
    /// Encoder timesteps available to each sample (always `T`).
    pub input_lengths: Vec<usize>,
    pub texts: Vec<String>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// In-memory collection of preprocessed samples.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    samples: Vec<Sample>,
}

impl Dataset {
    #[must_use]
    pub fn from_samples(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Preprocess every entry. Unreadable images become blank; entries whose
    /// text has no in-vocabulary characters are dropped.
    #[must_use]
    pub fn load(entries: &[ManifestEntry], vocab: &Vocabulary, preprocessor: &Preprocessor) -> Self {
        let mut samples = Vec::with_capacity(entries.len());
        for entry in entries {
            let label = vocab.encode(&entry.text);
            if label.is_empty() {
                warn!(image = %entry.image.display(), text = %entry.text, "label has no known characters, skipped");
                continue;
            }
            samples.push(Sample {
                image: preprocessor.load_or_blank(&entry.image),
                label,
                text: entry.text.clone(),
            });
        }
        info!(samples = samples.len(), skipped = entries.len() - samples.len(), "dataset loaded");
        Self { samples }
    }

    /// Load one split from `data_dir`.
    pub fn load_split(
        data_dir: &Path,
        split: Split,
        vocab: &Vocabulary,
        preprocessor: &Preprocessor,
    ) -> anyhow::Result<Self> {
        let entries = load_manifest(&split.manifest_path(data_dir), &split.image_dir(data_dir))?;
        Ok(Self::load(&entries, vocab, preprocessor))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Sample order for one epoch; shuffled when an rng is given.
    #[must_use]
    pub fn order(&self, rng: Option<&mut Rand32>) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.samples.len()).collect();
        if let Some(rng) = rng {
            for i in (1..indices.len()).rev() {
                let j = rng.rand_range(0..(i as u32 + 1)) as usize;
                indices.swap(i, j);
            }
        }
        indices
    }

    /// Collate the given samples into a batch.
    pub fn batch(&self, indices: &[usize], time_steps: usize, device: &Device) -> candle_core::Result<Batch> {
        let mut images = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        let mut texts = Vec::with_capacity(indices.len());
        for &i in indices {
            let sample = &self.samples[i];
            images.push(sample.image.to_tensor(device)?);
            labels.push(sample.label.clone());
            texts.push(sample.text.clone());
        }

        Ok(Batch {
            images: Tensor::stack(&images, 0)?,
            labels,
            input_lengths: vec![time_steps; indices.len()],
            texts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("train_manifest.txt");
        std::fs::write(&manifest, "0.png\tHello\nbroken line\n\n1.png\ta b\textra\n2.png\tW0rld").unwrap();

        let entries = load_manifest(&manifest, &dir.path().join("train")).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].image, dir.path().join("train").join("0.png"));
        assert_eq!(entries[1].text, "W0rld");
    }

    #[test]
    fn manifest_lines_are_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("val_manifest.txt");
        std::fs::write(&manifest, "  0.png\thello world \r\n1.png\tok\t\n").unwrap();

        let entries = load_manifest(&manifest, dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].image, dir.path().join("0.png"));
        assert_eq!(entries[0].text, "hello world");
        assert_eq!(entries[1].text, "ok");
    }

    #[test]
    fn missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_manifest(&dir.path().join("nope.txt"), dir.path()).is_err());
    }

    #[test]
    fn dataset_zero_fills_and_drops_empty_labels() {
        let vocab = Vocabulary::default();
        let entries = vec![
            ManifestEntry {
                image: PathBuf::from("/nonexistent/a.png"),
                text: "ok".into(),
            },
            ManifestEntry {
                image: PathBuf::from("/nonexistent/b.png"),
                text: "\u{e9}\u{e8}".into(),
            },
        ];
        let dataset = Dataset::load(&entries, &vocab, &Preprocessor::default());
        assert_eq!(dataset.len(), 1);
        assert_eq!(dataset.samples()[0].image, PreparedImage::blank(32, 128));
    }

    #[test]
    fn batches_have_fixed_input_lengths() {
        let vocab = Vocabulary::default();
        let samples = ["ab", "cde", "f"]
            .iter()
            .map(|t| Sample {
                image: PreparedImage::blank(32, 128),
                label: vocab.encode(t),
                text: t.to_string(),
            })
            .collect();
        let dataset = Dataset::from_samples(samples);

        let batch = dataset.batch(&[2, 0], 32, &Device::Cpu).unwrap();
        assert_eq!(batch.images.dims(), &[2, 1, 32, 128]);
        assert_eq!(batch.input_lengths, vec![32, 32]);
        assert_eq!(batch.texts, vec!["f", "ab"]);
    }

    #[test]
    fn shuffled_order_is_a_permutation() {
        let dataset = Dataset::from_samples(
            (0..10)
                .map(|i| Sample {
                    image: PreparedImage::blank(32, 128),
                    label: Label::new(vec![i + 1]).unwrap(),
                    text: i.to_string(),
                })
                .collect(),
        );
        let mut rng = Rand32::new(7);
        let mut order = dataset.order(Some(&mut rng));
        order.sort_unstable();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
        assert_eq!(dataset.order(None), (0..10).collect::<Vec<_>>());
    }
}

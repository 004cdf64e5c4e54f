//! Character vocabulary and CTC label encoding.
//!
//! Index 0 is reserved for the CTC blank; characters occupy `1..=len`.

use std::collections::HashMap;

use crate::error::{QuillError, Result};

/// Digits, lower and upper case letters, ASCII punctuation and space.
pub const DEFAULT_ALPHABET: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~ ";

/// Class index of the CTC blank token.
pub const BLANK: usize = 0;

/// Immutable character <-> class-index mapping.
///
/// Built once at startup and handed to every component that needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    chars: Vec<char>,
    char_to_idx: HashMap<char, usize>,
}

impl Vocabulary {
    /// Build a vocabulary from an ordered alphabet.
    pub fn new(alphabet: &str) -> Result<Self> {
        let chars: Vec<char> = alphabet.chars().collect();
        if chars.is_empty() {
            return Err(QuillError::InvalidConfig("alphabet is empty".into()));
        }

        let mut char_to_idx = HashMap::with_capacity(chars.len());
        for (i, &c) in chars.iter().enumerate() {
            if char_to_idx.insert(c, i + 1).is_some() {
                return Err(QuillError::InvalidConfig(format!(
                    "duplicate character {c:?} in alphabet"
                )));
            }
        }

        Ok(Self { chars, char_to_idx })
    }

    /// Number of output classes including the blank.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.chars.len() + 1
    }

    #[must_use]
    pub fn blank(&self) -> usize {
        BLANK
    }

    #[must_use]
    pub fn index_of(&self, c: char) -> Option<usize> {
        self.char_to_idx.get(&c).copied()
    }

    /// Character for a class index; `None` for the blank or out-of-range indices.
    #[must_use]
    pub fn char_for(&self, index: usize) -> Option<char> {
        if index == BLANK {
            return None;
        }
        self.chars.get(index - 1).copied()
    }

    /// Encode text as a label, dropping characters outside the alphabet.
    #[must_use]
    pub fn encode(&self, text: &str) -> Label {
        Label(text.chars().filter_map(|c| self.index_of(c)).collect())
    }

    pub fn alphabet(&self) -> impl Iterator<Item = char> + '_ {
        self.chars.iter().copied()
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        let chars: Vec<char> = DEFAULT_ALPHABET.chars().collect();
        let char_to_idx = chars.iter().enumerate().map(|(i, &c)| (c, i + 1)).collect();
        Self { chars, char_to_idx }
    }
}

/// Ground-truth sequence of class indices. Never contains [`BLANK`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Label(Vec<usize>);

impl Label {
    /// Wrap raw indices, rejecting the blank.
    pub fn new(indices: Vec<usize>) -> Result<Self> {
        if let Some(pos) = indices.iter().position(|&i| i == BLANK) {
            return Err(QuillError::shape(format!(
                "label contains the blank index at position {pos}"
            )));
        }
        Ok(Self(indices))
    }

    #[must_use]
    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

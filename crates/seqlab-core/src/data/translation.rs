//! Data loading for parallel (source, target) corpora.
//!
//! Accepts either a JSON array of `{"source": ..., "target": ...}` objects or
//! one such object per line. Sentences are whitespace-tokenized.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::data::Split;
use crate::error::{Result, SeqlabError};
use crate::vocab::{BOS, EOS, PAD, UNK, Vocabulary};

#[derive(Debug, Deserialize)]
struct RawPair {
    source: String,
    #[serde(default)]
    target: Option<String>,
}

/// A tokenized sentence pair. `target` is empty for unlabeled test data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentencePair {
    pub source: Vec<String>,
    pub target: Vec<String>,
}

/// A parallel corpus for one split.
#[derive(Debug, Clone)]
pub struct ParallelData {
    split: Split,
    pairs: Vec<SentencePair>,
}

impl ParallelData {
    pub fn new(split: Split) -> Self {
        Self {
            split,
            pairs: Vec::new(),
        }
    }

    pub fn from_pairs(split: Split, pairs: Vec<SentencePair>) -> Self {
        Self { split, pairs }
    }

    /// Load pairs from `path`, truncating each side to `max_length` tokens.
    ///
    /// Returns source and target vocabularies, both starting with `[PAD]`,
    /// `[UNK]`, `[BOS]` and `[EOS]`.
    pub fn load<P: AsRef<Path>>(
        &mut self,
        path: P,
        max_length: usize,
    ) -> Result<(Vocabulary, Vocabulary)> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let raw = parse_pairs(&content, &path.display().to_string())?;

        let mut pairs = Vec::with_capacity(raw.len());
        for (i, pair) in raw.into_iter().enumerate() {
            let target = match pair.target {
                Some(t) => tokenize(&t, max_length),
                None if self.split.requires_gold() => {
                    return Err(SeqlabError::MalformedData {
                        path: path.display().to_string(),
                        line: i + 1,
                        reason: "missing target".into(),
                    });
                }
                None => Vec::new(),
            };
            pairs.push(SentencePair {
                source: tokenize(&pair.source, max_length),
                target,
            });
        }
        self.pairs = pairs;

        let mut source_vocab = Vocabulary::with_specials(&[PAD, UNK, BOS, EOS]);
        let mut target_vocab = Vocabulary::with_specials(&[PAD, UNK, BOS, EOS]);
        for pair in &self.pairs {
            source_vocab.append(&pair.source);
            target_vocab.append(&pair.target);
        }

        info!(
            split = %self.split,
            pairs = self.pairs.len(),
            source_vocab = source_vocab.len(),
            target_vocab = target_vocab.len(),
            "loaded parallel data from {}",
            path.display()
        );

        Ok((source_vocab, target_vocab))
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn pairs(&self) -> &[SentencePair] {
        &self.pairs
    }

    pub fn sources(&self) -> Vec<Vec<String>> {
        self.pairs.iter().map(|p| p.source.clone()).collect()
    }

    pub fn targets(&self) -> Vec<Vec<String>> {
        self.pairs.iter().map(|p| p.target.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Encode every pair as `(source indices, target indices)` without
    /// `[BOS]`/`[EOS]` markers.
    pub fn encode(
        &self,
        source_vocab: &Vocabulary,
        target_vocab: &Vocabulary,
    ) -> Result<Vec<(Vec<u32>, Vec<u32>)>> {
        self.pairs
            .iter()
            .map(|p| Ok((source_vocab.encode(&p.source)?, target_vocab.encode(&p.target)?)))
            .collect()
    }
}

fn parse_pairs(content: &str, source: &str) -> Result<Vec<RawPair>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }

    // JSON lines
    let mut pairs = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let pair = serde_json::from_str(line).map_err(|e| SeqlabError::MalformedData {
            path: source.to_string(),
            line: line_no + 1,
            reason: e.to_string(),
        })?;
        pairs.push(pair);
    }
    Ok(pairs)
}

fn tokenize(sentence: &str, max_length: usize) -> Vec<String> {
    sentence
        .split_whitespace()
        .take(max_length)
        .map(str::to_string)
        .collect()
}

//! # Vocabulary
//!
//! Dense index assignment for words and labels. Indices are handed out in
//! insertion order, so special tokens added first get the low indices.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SeqlabError};

/// Padding token, always index 0 in word vocabularies.
pub const PAD: &str = "[PAD]";
/// Out-of-vocabulary token.
pub const UNK: &str = "[UNK]";
/// Begin-of-sentence token for source/target sequences.
pub const BOS: &str = "[BOS]";
/// End-of-sentence token for source/target sequences.
pub const EOS: &str = "[EOS]";
/// Begin-of-label pseudo tag used by the CRF start transitions.
pub const BOL: &str = "[BOL]";
/// End-of-label pseudo tag used by the CRF end transitions.
pub const EOL: &str = "[EOL]";

/// Token <-> index mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct Vocabulary {
    tokens: Vec<String>,
    index: HashMap<String, u32>,
}

impl Vocabulary {
    /// Create an empty vocabulary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a vocabulary pre-seeded with `specials`, in order.
    pub fn with_specials(specials: &[&str]) -> Self {
        let mut vocab = Self::new();
        vocab.append(specials);
        vocab
    }

    /// Add a single token, returning its index.
    pub fn add(&mut self, token: &str) -> u32 {
        if let Some(&idx) = self.index.get(token) {
            return idx;
        }
        let idx = self.tokens.len() as u32;
        self.tokens.push(token.to_string());
        self.index.insert(token.to_string(), idx);
        idx
    }

    /// Add every token not already present.
    pub fn append<S: AsRef<str>>(&mut self, tokens: &[S]) {
        for token in tokens {
            self.add(token.as_ref());
        }
    }

    pub fn get(&self, token: &str) -> Option<u32> {
        self.index.get(token).copied()
    }

    /// Index of `token`, or of `[UNK]` when absent.
    pub fn index_or_unk(&self, token: &str) -> Result<u32> {
        match self.get(token) {
            Some(idx) => Ok(idx),
            None => self.get(UNK).ok_or(SeqlabError::MissingSpecial(UNK)),
        }
    }

    /// Index of a special token that must exist.
    pub fn special(&self, token: &'static str) -> Result<u32> {
        self.get(token).ok_or(SeqlabError::MissingSpecial(token))
    }

    pub fn token(&self, idx: u32) -> Option<&str> {
        self.tokens.get(idx as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Map a token sequence to indices, falling back to `[UNK]`.
    pub fn encode<S: AsRef<str>>(&self, tokens: &[S]) -> Result<Vec<u32>> {
        tokens
            .iter()
            .map(|t| self.index_or_unk(t.as_ref()))
            .collect()
    }

    /// Map indices back to tokens. Unknown indices render as `[UNK]`.
    pub fn decode(&self, indices: &[u32]) -> Vec<String> {
        indices
            .iter()
            .map(|&i| self.token(i).unwrap_or(UNK).to_string())
            .collect()
    }
}

impl From<Vec<String>> for Vocabulary {
    fn from(tokens: Vec<String>) -> Self {
        let mut vocab = Self::new();
        vocab.append(&tokens);
        vocab
    }
}

impl From<Vocabulary> for Vec<String> {
    fn from(vocab: Vocabulary) -> Self {
        vocab.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specials_take_low_indices() {
        let vocab = Vocabulary::with_specials(&[PAD, UNK]);
        assert_eq!(vocab.get(PAD), Some(0));
        assert_eq!(vocab.get(UNK), Some(1));
        assert_eq!(vocab.len(), 2);
    }

    #[test]
    fn append_is_idempotent() {
        let mut vocab = Vocabulary::with_specials(&[PAD, UNK]);
        vocab.append(&["cat", "dog", "cat"]);
        vocab.append(&[BOS, EOS]);
        vocab.append(&[BOS, EOS]);
        assert_eq!(vocab.len(), 6);
        assert_eq!(vocab.get("dog"), Some(3));
        assert_eq!(vocab.get(EOS), Some(5));
    }

    #[test]
    fn unknown_tokens_fall_back_to_unk() {
        let mut vocab = Vocabulary::with_specials(&[PAD, UNK]);
        vocab.add("cat");
        assert_eq!(vocab.encode(&["cat", "zebra"]).unwrap(), vec![2, 1]);
        assert_eq!(vocab.decode(&[2, 99]), vec!["cat", UNK]);
    }

    #[test]
    fn missing_unk_is_an_error() {
        let vocab = Vocabulary::from(vec!["O".to_string(), "B-PER".to_string()]);
        assert!(matches!(
            vocab.index_or_unk("I-PER"),
            Err(SeqlabError::MissingSpecial(UNK))
        ));
    }

    #[test]
    fn serializes_as_token_list() {
        let mut vocab = Vocabulary::with_specials(&[PAD, UNK]);
        vocab.add("hello");
        let json = serde_json::to_string(&vocab).unwrap();
        assert_eq!(json, r#"["[PAD]","[UNK]","hello"]"#);
        let back: Vocabulary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vocab);
    }
}

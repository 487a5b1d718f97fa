//! # Evaluation Metrics
//!
//! Token accuracy, chunk-level F1 for taggers and corpus BLEU for
//! translation output.

pub mod bleu;
pub mod chunk;

pub use bleu::corpus_bleu;
pub use chunk::{Chunk, ChunkScores, extract_chunks};

/// Running count of correct tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenAccuracy {
    pub correct: usize,
    pub total: usize,
}

impl TokenAccuracy {
    /// Compare two aligned sequences; extra elements on either side count as wrong.
    pub fn update<T: PartialEq>(&mut self, predicted: &[T], gold: &[T]) {
        self.correct += predicted.iter().zip(gold).filter(|(p, g)| p == g).count();
        self.total += predicted.len().max(gold.len());
    }

    pub fn add(&mut self, correct: usize, total: usize) {
        self.correct += correct;
        self.total += total;
    }

    pub fn value(&self) -> f32 {
        if self.total > 0 {
            self.correct as f32 / self.total as f32
        } else {
            0.0
        }
    }
}

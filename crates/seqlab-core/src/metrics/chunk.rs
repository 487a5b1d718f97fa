//! Chunk extraction and span-level precision / recall / F1.
//!
//! Follows the lenient CoNLL convention: an `I-X` that does not continue an
//! `X` chunk opens a new one.

use std::collections::HashSet;

use crate::tags::{ChunkTag, TagPrefix};

/// A labeled span `[start, end)` over token positions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub kind: String,
    pub start: usize,
    pub end: usize,
}

impl Chunk {
    fn new(kind: &str, start: usize, end: usize) -> Self {
        Self {
            kind: kind.to_string(),
            start,
            end,
        }
    }
}

/// Extract chunks from a label sequence.
///
/// Plain labels without a chunk prefix become single-token chunks, so for
/// tag sets like part-of-speech the scores reduce to token accuracy.
pub fn extract_chunks<S: AsRef<str>>(labels: &[S]) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut open: Option<(&str, usize)> = None;

    for (i, label) in labels.iter().enumerate() {
        let tag = ChunkTag::parse(label.as_ref());

        match tag.prefix {
            TagPrefix::Inside | TagPrefix::End if open.is_some_and(|(kind, _)| kind == tag.kind) => {
                if tag.prefix == TagPrefix::End {
                    if let Some((kind, start)) = open.take() {
                        chunks.push(Chunk::new(kind, start, i + 1));
                    }
                }
            }
            TagPrefix::Begin | TagPrefix::Inside => {
                if let Some((kind, start)) = open.take() {
                    chunks.push(Chunk::new(kind, start, i));
                }
                open = Some((tag.kind, i));
            }
            TagPrefix::Single | TagPrefix::End | TagPrefix::Plain => {
                if let Some((kind, start)) = open.take() {
                    chunks.push(Chunk::new(kind, start, i));
                }
                chunks.push(Chunk::new(tag.kind, i, i + 1));
            }
            TagPrefix::Outside => {
                if let Some((kind, start)) = open.take() {
                    chunks.push(Chunk::new(kind, start, i));
                }
            }
        }
    }

    if let Some((kind, start)) = open {
        chunks.push(Chunk::new(kind, start, labels.len()));
    }

    chunks
}

/// Accumulated chunk counts over a corpus.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChunkScores {
    pub predicted: usize,
    pub gold: usize,
    pub correct: usize,
}

impl ChunkScores {
    /// Add one sentence's predicted and gold label sequences.
    pub fn update<S: AsRef<str>>(&mut self, predicted: &[S], gold: &[S]) {
        let predicted: HashSet<Chunk> = extract_chunks(predicted).into_iter().collect();
        let gold: HashSet<Chunk> = extract_chunks(gold).into_iter().collect();

        self.predicted += predicted.len();
        self.gold += gold.len();
        self.correct += predicted.intersection(&gold).count();
    }

    pub fn precision(&self) -> f32 {
        ratio(self.correct, self.predicted)
    }

    pub fn recall(&self) -> f32 {
        ratio(self.correct, self.gold)
    }

    pub fn f1(&self) -> f32 {
        let (p, r) = (self.precision(), self.recall());
        if p + r > 0.0 { 2.0 * p * r / (p + r) } else { 0.0 }
    }
}

fn ratio(num: usize, den: usize) -> f32 {
    if den > 0 { num as f32 / den as f32 } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_bio_chunks() {
        let chunks = extract_chunks(&["B-PER", "I-PER", "O", "B-LOC", "B-LOC", "I-LOC"]);
        assert_eq!(
            chunks,
            vec![
                Chunk::new("PER", 0, 2),
                Chunk::new("LOC", 3, 4),
                Chunk::new("LOC", 4, 6),
            ]
        );
    }

    #[test]
    fn orphan_inside_opens_a_chunk() {
        let chunks = extract_chunks(&["O", "I-ORG", "I-ORG", "I-PER"]);
        assert_eq!(chunks, vec![Chunk::new("ORG", 1, 3), Chunk::new("PER", 3, 4)]);
    }

    #[test]
    fn extracts_bioes_chunks() {
        let chunks = extract_chunks(&["S-PER", "B-LOC", "I-LOC", "E-LOC", "O", "E-ORG"]);
        assert_eq!(
            chunks,
            vec![
                Chunk::new("PER", 0, 1),
                Chunk::new("LOC", 1, 4),
                Chunk::new("ORG", 5, 6),
            ]
        );
    }

    #[test]
    fn plain_labels_are_single_token_chunks() {
        let chunks = extract_chunks(&["DET", "NOUN"]);
        assert_eq!(chunks, vec![Chunk::new("DET", 0, 1), Chunk::new("NOUN", 1, 2)]);
    }

    #[test]
    fn scores() {
        let mut scores = ChunkScores::default();
        scores.update(&["B-PER", "I-PER", "O", "B-LOC"], &["B-PER", "I-PER", "O", "O"]);
        scores.update(&["O", "O"], &["B-ORG", "O"]);

        assert_eq!(scores.predicted, 2);
        assert_eq!(scores.gold, 2);
        assert_eq!(scores.correct, 1);
        assert!((scores.precision() - 0.5).abs() < 1e-6);
        assert!((scores.recall() - 0.5).abs() < 1e-6);
        assert!((scores.f1() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn empty_scores_are_zero() {
        let scores = ChunkScores::default();
        assert_eq!(scores.f1(), 0.0);
    }
}

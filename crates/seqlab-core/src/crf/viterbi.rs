//! # Viterbi Decoding for CRF
//!
//! Implements the Viterbi algorithm for finding the most likely tag sequence
//! given emission scores, transition scores and hard transition constraints.

use crate::error::{Result, SeqlabError};

/// Viterbi decoder for CRF tag sequences.
///
/// `allowed[i][j]` says whether tag `i` may be followed by tag `j`. When
/// begin/end pseudo tags are configured, the first position is scored with
/// `transitions[begin][*]` and the last with `transitions[*][end]`, and the
/// pseudo tags themselves are never emitted.
#[derive(Debug, Clone)]
pub struct ViterbiDecoder {
    num_tags: usize,
    allowed: Vec<Vec<bool>>,
    allowed_start: Vec<bool>,
    allowed_end: Vec<bool>,
    begin: Option<usize>,
    end: Option<usize>,
}

impl ViterbiDecoder {
    /// Create an unconstrained decoder.
    ///
    /// # Arguments
    /// * `num_tags` - Number of distinct tags
    pub fn new(num_tags: usize) -> Self {
        Self {
            num_tags,
            allowed: vec![vec![true; num_tags]; num_tags],
            allowed_start: vec![true; num_tags],
            allowed_end: vec![true; num_tags],
            begin: None,
            end: None,
        }
    }

    /// Score sequence boundaries through the `begin` and `end` pseudo tags.
    pub fn with_boundaries(mut self, begin: usize, end: usize) -> Self {
        self.begin = Some(begin);
        self.end = Some(end);
        for tag in [begin, end] {
            if tag < self.num_tags {
                self.allowed_start[tag] = false;
                self.allowed_end[tag] = false;
                for row in self.allowed.iter_mut() {
                    row[tag] = false;
                }
                self.allowed[tag].fill(false);
            }
        }
        self
    }

    /// Additionally forbid every transition for which `valid(from, to)` is false.
    pub fn with_constraints<F>(mut self, valid: F) -> Self
    where
        F: Fn(usize, usize) -> bool,
    {
        for from in 0..self.num_tags {
            for to in 0..self.num_tags {
                if !valid(from, to) {
                    self.allowed[from][to] = false;
                }
            }
        }
        self
    }

    /// Forbid tags that may not open or close a sequence.
    pub fn with_boundary_constraints<S, E>(mut self, can_start: S, can_end: E) -> Self
    where
        S: Fn(usize) -> bool,
        E: Fn(usize) -> bool,
    {
        for tag in 0..self.num_tags {
            if !can_start(tag) {
                self.allowed_start[tag] = false;
            }
            if !can_end(tag) {
                self.allowed_end[tag] = false;
            }
        }
        self
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    /// Decode the optimal tag sequence.
    ///
    /// # Arguments
    /// * `emission_scores` - Matrix of shape [seq_len, num_tags] with emission scores
    /// * `transition_matrix` - Matrix of shape [num_tags, num_tags] with transition scores
    ///
    /// # Returns
    /// The optimal tag sequence as indices.
    pub fn decode(
        &self,
        emission_scores: &[Vec<f32>],
        transition_matrix: &[Vec<f32>],
    ) -> Result<Vec<usize>> {
        self.decode_with_score(emission_scores, transition_matrix)
            .map(|(path, _)| path)
    }

    /// Decode and also return the score of the best path.
    pub fn decode_with_score(
        &self,
        emission_scores: &[Vec<f32>],
        transition_matrix: &[Vec<f32>],
    ) -> Result<(Vec<usize>, f32)> {
        let seq_len = emission_scores.len();
        if seq_len == 0 {
            return Ok((Vec::new(), 0.0));
        }

        // Validate dimensions
        if let Some(row) = emission_scores.iter().find(|r| r.len() != self.num_tags) {
            return Err(SeqlabError::Decode(format!(
                "emission score dimension mismatch: expected {}, got {}",
                self.num_tags,
                row.len()
            )));
        }
        if transition_matrix.len() != self.num_tags
            || transition_matrix.iter().any(|r| r.len() != self.num_tags)
        {
            return Err(SeqlabError::Decode(format!(
                "transition matrix must be {0}x{0}",
                self.num_tags
            )));
        }

        // DP table
        let mut dp: Vec<Vec<f32>> = vec![vec![f32::NEG_INFINITY; self.num_tags]; seq_len];
        let mut backptr: Vec<Vec<usize>> = vec![vec![0; self.num_tags]; seq_len];

        // Initialize
        for tag in 0..self.num_tags {
            if !self.allowed_start[tag] {
                continue;
            }
            let start = self.begin.map_or(0.0, |b| transition_matrix[b][tag]);
            dp[0][tag] = start + emission_scores[0][tag];
        }

        // Forward pass with constraints
        for pos in 1..seq_len {
            for curr_tag in 0..self.num_tags {
                let mut best_score = f32::NEG_INFINITY;
                let mut best_prev = 0;

                for prev_tag in 0..self.num_tags {
                    if !self.allowed[prev_tag][curr_tag] {
                        continue;
                    }

                    let score = dp[pos - 1][prev_tag] + transition_matrix[prev_tag][curr_tag];
                    if score > best_score {
                        best_score = score;
                        best_prev = prev_tag;
                    }
                }

                dp[pos][curr_tag] = best_score + emission_scores[pos][curr_tag];
                backptr[pos][curr_tag] = best_prev;
            }
        }

        // Best final tag
        let mut best_final_tag = None;
        let mut best_final_score = f32::NEG_INFINITY;
        for tag in 0..self.num_tags {
            if !self.allowed_end[tag] {
                continue;
            }
            let end = self.end.map_or(0.0, |e| transition_matrix[tag][e]);
            let score = dp[seq_len - 1][tag] + end;
            if best_final_tag.is_none() || score > best_final_score {
                best_final_score = score;
                best_final_tag = Some(tag);
            }
        }
        let best_final_tag = best_final_tag.ok_or_else(|| {
            SeqlabError::Decode("no tag is allowed to end a sequence".into())
        })?;

        // Backtrack
        let mut path = vec![best_final_tag];
        let mut curr_tag = best_final_tag;

        for pos in (1..seq_len).rev() {
            curr_tag = backptr[pos][curr_tag];
            path.push(curr_tag);
        }

        path.reverse();
        Ok((path, best_final_score))
    }
}

//! # Conditional Random Field
//!
//! Linear-chain CRF on top of per-token emission scores: the forward
//! algorithm for training and Viterbi decoding for prediction.

pub mod layer;
pub mod viterbi;

pub use layer::{Crf, FORBIDDEN, log_sum_exp};
pub use viterbi::ViterbiDecoder;

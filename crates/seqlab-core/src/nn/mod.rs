//! # Building Blocks
//!
//! Trainable layers composed from primitive candle tensor ops so that every
//! piece has autograd support.

pub mod attention;
pub mod embedding;
pub mod layer_norm;
pub mod lstm;
pub mod transformer;

pub use attention::{MultiHeadAttention, causal_mask, padding_mask};
pub use embedding::PaddedEmbedding;
pub use layer_norm::{LayerNorm, layer_norm};
pub use lstm::{BiLstm, LstmCell};
pub use transformer::{DecoderLayer, EncoderLayer, FeedForward, PositionalEncoding};

use candle_core::{Result, Tensor};

/// Additive score for masked attention positions.
pub const MASKED: f32 = -1e9;

/// Logistic sigmoid as `0.5 * (tanh(x / 2) + 1)`, which stays finite under
/// backprop for large-magnitude inputs.
pub fn sigmoid(xs: &Tensor) -> Result<Tensor> {
    (xs * 0.5)?.tanh()?.affine(0.5, 0.5)
}

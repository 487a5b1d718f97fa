//! # Models
//!
//! The two trainable pipelines: a BiLSTM-CRF tagger and a Transformer
//! encoder-decoder.

pub mod bilstm_crf;
pub mod transformer;

pub use bilstm_crf::{BiLstmCrf, BiLstmCrfConfig};
pub use transformer::{Seq2SeqTransformer, TransformerConfig, correct_tokens, masked_cross_entropy};

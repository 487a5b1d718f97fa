//! # Seqlab Core
//!
//! Neural sequence models on candle: a BiLSTM-CRF tagger for token
//! classification and an encoder-decoder Transformer for sequence-to-sequence
//! translation, plus the vocabularies, datasets and metrics around them.
//!
//! ## Quick Start
//!
//! ```rust
//! use seqlab_core::crf::ViterbiDecoder;
//!
//! let decoder = ViterbiDecoder::new(2);
//! let emissions = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
//! let transitions = vec![vec![0.0, 0.0], vec![0.0, 0.0]];
//!
//! assert_eq!(decoder.decode(&emissions, &transitions).unwrap(), vec![0, 1]);
//! ```
pub mod crf;
pub mod data;
pub mod error;
pub mod metrics;
pub mod model;
pub mod nn;
pub mod tags;
pub mod vocab;

// Re-export primary API
pub use crf::{Crf, ViterbiDecoder};
pub use data::{Batch, Batcher, ParallelData, SentencePair, Sentence, Split, TaggingData};
pub use error::{Result, SeqlabError};
pub use metrics::{ChunkScores, TokenAccuracy, corpus_bleu};
pub use model::{BiLstmCrf, BiLstmCrfConfig, Seq2SeqTransformer, TransformerConfig};
pub use vocab::Vocabulary;

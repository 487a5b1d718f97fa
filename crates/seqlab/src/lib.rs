//! # Seqlab
//!
//! Sequence labeling and sequence-to-sequence models with their training
//! pipelines. Re-exports [`seqlab_core`] (models, data, metrics) and
//! [`seqlab_trainer`] (processors, checkpoints, configuration).

pub use seqlab_core;
pub use seqlab_trainer;

pub use seqlab_core::{
    BiLstmCrf, BiLstmCrfConfig, ParallelData, Result, Seq2SeqTransformer, SeqlabError, Split, TaggingData,
    TransformerConfig, Vocabulary,
};
pub use seqlab_trainer::{
    Checkpoint, TaggerMetrics, TaggerModel, TaggerProcessor, TranslatorMetrics, TranslatorModel,
    TranslatorProcessor,
};

//! # Datasets
//!
//! Loading of CoNLL-style tagging corpora and JSON parallel corpora, plus
//! padded mini-batch construction shared by both pipelines.

pub mod batch;
pub mod tagging;
pub mod translation;

pub use batch::{Batch, Batcher};
pub use tagging::{Sentence, TaggingData};
pub use translation::{ParallelData, SentencePair};

use std::fmt;

/// Which part of a corpus a dataset holds.
///
/// Only `Test` data may come without gold annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    /// Whether gold labels / targets are mandatory for this split.
    pub fn requires_gold(&self) -> bool {
        !matches!(self, Split::Test)
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Valid => write!(f, "valid"),
            Split::Test => write!(f, "test"),
        }
    }
}

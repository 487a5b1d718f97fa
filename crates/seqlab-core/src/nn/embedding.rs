//! Token embedding whose padding row always reads as zeros.

use candle_core::{D, DType, Result, Tensor};
use candle_nn::{Embedding, Module, VarBuilder, embedding};

/// Lookup table where `padding_idx` maps to the zero vector and receives no
/// gradient.
pub struct PaddedEmbedding {
    table: Embedding,
    padding_idx: u32,
}

impl PaddedEmbedding {
    pub fn new(vocab_size: usize, dim: usize, padding_idx: u32, vb: VarBuilder) -> Result<Self> {
        if padding_idx as usize >= vocab_size {
            candle_core::bail!("padding index {padding_idx} out of range for {vocab_size} tokens");
        }
        Ok(Self {
            table: embedding(vocab_size, dim, vb)?,
            padding_idx,
        })
    }

    pub fn padding_idx(&self) -> u32 {
        self.padding_idx
    }

    pub fn embeddings(&self) -> &Tensor {
        self.table.embeddings()
    }
}

impl Module for PaddedEmbedding {
    fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let keep = ids
            .ne(self.padding_idx)?
            .to_dtype(DType::F32)?
            .unsqueeze(D::Minus1)?;
        self.table.forward(ids)?.broadcast_mul(&keep)
    }
}

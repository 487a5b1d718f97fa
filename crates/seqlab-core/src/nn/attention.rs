//! Multi-head scaled dot-product attention with additive masks.

use candle_core::{D, Device, Result, Tensor};
use candle_nn::{Dropout, Linear, Module, ModuleT, VarBuilder, linear, ops::softmax};

use crate::nn::MASKED;

#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    num_heads: usize,
    head_dim: usize,
    dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new(model_dim: usize, num_heads: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || model_dim % num_heads != 0 {
            candle_core::bail!("model dim {model_dim} is not divisible by {num_heads} heads");
        }
        Ok(Self {
            query: linear(model_dim, model_dim, vb.pp("query"))?,
            key: linear(model_dim, model_dim, vb.pp("key"))?,
            value: linear(model_dim, model_dim, vb.pp("value"))?,
            output: linear(model_dim, model_dim, vb.pp("output"))?,
            num_heads,
            head_dim: model_dim / num_heads,
            dropout: Dropout::new(dropout),
        })
    }

    /// `[batch, len, model_dim]` -> `[batch, heads, len, head_dim]`
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, len, _) = xs.dims3()?;
        xs.reshape((batch, len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Attend from `query` (`[batch, q_len, dim]`) over `memory` (`[batch, k_len, dim]`).
    ///
    /// `mask` is added to the `[batch, heads, q_len, k_len]` scores and must
    /// broadcast to that shape; use [`padding_mask`] and [`causal_mask`].
    pub fn forward(
        &self,
        query: &Tensor,
        memory: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, q_len, model_dim) = query.dims3()?;

        let q = self.split_heads(&self.query.forward(query)?)?;
        let k = self.split_heads(&self.key.forward(memory)?)?;
        let v = self.split_heads(&self.value.forward(memory)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut scores = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        if let Some(mask) = mask {
            scores = scores.broadcast_add(mask)?;
        }

        let weights = softmax(&scores, D::Minus1)?;
        let weights = self.dropout.forward_t(&weights, train)?;

        let context = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, q_len, model_dim))?;
        self.output.forward(&context)
    }
}

/// Key padding mask: `[batch, seq_len]` f32 (1.0 = real) -> `[batch, 1, 1, seq_len]`
/// additive mask with [`MASKED`] on padding.
pub fn padding_mask(mask: &Tensor) -> Result<Tensor> {
    let (batch, seq_len) = mask.dims2()?;
    mask.affine(-f64::from(MASKED), f64::from(MASKED))?
        .reshape((batch, 1, 1, seq_len))
}

/// `[1, 1, len, len]` additive mask hiding future positions.
pub fn causal_mask(len: usize, device: &Device) -> Result<Tensor> {
    let values: Vec<f32> = (0..len)
        .flat_map(|i| (0..len).map(move |j| if j > i { MASKED } else { 0.0 }))
        .collect();
    Tensor::from_vec(values, (1, 1, len, len), device)
}

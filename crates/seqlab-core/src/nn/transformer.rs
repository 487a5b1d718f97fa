//! Encoder / decoder layers and positional encoding.
//!
//! Post-norm residual blocks: `norm(x + dropout(sublayer(x)))`.

use candle_core::{Device, Result, Tensor};
use candle_nn::{Dropout, Linear, Module, ModuleT, VarBuilder, linear};

use crate::nn::attention::MultiHeadAttention;
use crate::nn::layer_norm::{LayerNorm, layer_norm};

const NORM_EPS: f64 = 1e-5;

/// Fixed sinusoidal position table.
#[derive(Debug, Clone)]
pub struct PositionalEncoding {
    table: Tensor,
    max_len: usize,
}

impl PositionalEncoding {
    pub fn new(max_len: usize, dim: usize, device: &Device) -> Result<Self> {
        let mut values = vec![0f32; max_len * dim];
        for pos in 0..max_len {
            for i in (0..dim).step_by(2) {
                let angle = pos as f64 / 10000f64.powf(i as f64 / dim as f64);
                values[pos * dim + i] = angle.sin() as f32;
                if i + 1 < dim {
                    values[pos * dim + i + 1] = angle.cos() as f32;
                }
            }
        }
        Ok(Self {
            table: Tensor::from_vec(values, (max_len, dim), device)?,
            max_len,
        })
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Add positions to `[batch, len, dim]`.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let len = xs.dim(1)?;
        if len > self.max_len {
            candle_core::bail!("sequence length {len} exceeds positional table size {}", self.max_len);
        }
        xs.broadcast_add(&self.table.narrow(0, 0, len)?.unsqueeze(0)?)
    }
}

/// Position-wise feed-forward network.
#[derive(Debug, Clone)]
pub struct FeedForward {
    expand: Linear,
    project: Linear,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(dim: usize, hidden_dim: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            expand: linear(dim, hidden_dim, vb.pp("expand"))?,
            project: linear(hidden_dim, dim, vb.pp("project"))?,
            dropout: Dropout::new(dropout),
        })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.expand.forward(xs)?.relu()?;
        let hidden = self.dropout.forward_t(&hidden, train)?;
        self.project.forward(&hidden)
    }
}

#[derive(Debug, Clone)]
pub struct EncoderLayer {
    attention: MultiHeadAttention,
    feed_forward: FeedForward,
    attention_norm: LayerNorm,
    feed_forward_norm: LayerNorm,
    dropout: Dropout,
}

impl EncoderLayer {
    pub fn new(
        dim: usize,
        heads: usize,
        feed_forward_dim: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            attention: MultiHeadAttention::new(dim, heads, dropout, vb.pp("attention"))?,
            feed_forward: FeedForward::new(dim, feed_forward_dim, dropout, vb.pp("feed_forward"))?,
            attention_norm: layer_norm(dim, NORM_EPS, vb.pp("attention_norm"))?,
            feed_forward_norm: layer_norm(dim, NORM_EPS, vb.pp("feed_forward_norm"))?,
            dropout: Dropout::new(dropout),
        })
    }

    /// `src_mask` is an additive key mask from [`padding_mask`](crate::nn::padding_mask).
    pub fn forward(&self, xs: &Tensor, src_mask: &Tensor, train: bool) -> Result<Tensor> {
        let attended = self.attention.forward(xs, xs, Some(src_mask), train)?;
        let xs = self
            .attention_norm
            .forward(&(xs + self.dropout.forward_t(&attended, train)?)?)?;

        let fed = self.feed_forward.forward(&xs, train)?;
        self.feed_forward_norm
            .forward(&(&xs + self.dropout.forward_t(&fed, train)?)?)
    }
}

#[derive(Debug, Clone)]
pub struct DecoderLayer {
    self_attention: MultiHeadAttention,
    cross_attention: MultiHeadAttention,
    feed_forward: FeedForward,
    self_attention_norm: LayerNorm,
    cross_attention_norm: LayerNorm,
    feed_forward_norm: LayerNorm,
    dropout: Dropout,
}

impl DecoderLayer {
    pub fn new(
        dim: usize,
        heads: usize,
        feed_forward_dim: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            self_attention: MultiHeadAttention::new(dim, heads, dropout, vb.pp("self_attention"))?,
            cross_attention: MultiHeadAttention::new(dim, heads, dropout, vb.pp("cross_attention"))?,
            feed_forward: FeedForward::new(dim, feed_forward_dim, dropout, vb.pp("feed_forward"))?,
            self_attention_norm: layer_norm(dim, NORM_EPS, vb.pp("self_attention_norm"))?,
            cross_attention_norm: layer_norm(dim, NORM_EPS, vb.pp("cross_attention_norm"))?,
            feed_forward_norm: layer_norm(dim, NORM_EPS, vb.pp("feed_forward_norm"))?,
            dropout: Dropout::new(dropout),
        })
    }

    /// * `tgt_mask` - causal + target padding additive mask
    /// * `src_mask` - source padding additive mask
    pub fn forward(
        &self,
        xs: &Tensor,
        memory: &Tensor,
        tgt_mask: &Tensor,
        src_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let attended = self.self_attention.forward(xs, xs, Some(tgt_mask), train)?;
        let xs = self
            .self_attention_norm
            .forward(&(xs + self.dropout.forward_t(&attended, train)?)?)?;

        let crossed = self.cross_attention.forward(&xs, memory, Some(src_mask), train)?;
        let xs = self
            .cross_attention_norm
            .forward(&(&xs + self.dropout.forward_t(&crossed, train)?)?)?;

        let fed = self.feed_forward.forward(&xs, train)?;
        self.feed_forward_norm
            .forward(&(&xs + self.dropout.forward_t(&fed, train)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{causal_mask, padding_mask};
    use candle_core::DType;
    use candle_nn::VarMap;

    #[test]
    fn positional_table_values() {
        let pe = PositionalEncoding::new(4, 6, &Device::Cpu).unwrap();
        let zeros = Tensor::zeros((1, 3, 6), DType::F32, &Device::Cpu).unwrap();
        let out: Vec<Vec<f32>> = pe.forward(&zeros).unwrap().squeeze(0).unwrap().to_vec2().unwrap();

        // position 0: sin(0) = 0, cos(0) = 1
        assert_eq!(out[0], vec![0.0, 1.0, 0.0, 1.0, 0.0, 1.0]);
        assert!((out[1][0] - 1f32.sin()).abs() < 1e-6);
        assert!((out[1][1] - 1f32.cos()).abs() < 1e-6);
    }

    #[test]
    fn positional_table_rejects_long_inputs() {
        let pe = PositionalEncoding::new(2, 4, &Device::Cpu).unwrap();
        let xs = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(pe.forward(&xs).is_err());
    }

    #[test]
    fn encoder_decoder_shapes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = EncoderLayer::new(8, 2, 16, 0.1, vb.pp("enc")).unwrap();
        let decoder = DecoderLayer::new(8, 2, 16, 0.1, vb.pp("dec")).unwrap();

        let src = Tensor::randn(0f32, 1.0, (2, 5, 8), &Device::Cpu).unwrap();
        let tgt = Tensor::randn(0f32, 1.0, (2, 3, 8), &Device::Cpu).unwrap();
        let src_mask = padding_mask(&Tensor::ones((2, 5), DType::F32, &Device::Cpu).unwrap()).unwrap();
        let tgt_mask = causal_mask(3, &Device::Cpu).unwrap();

        let memory = encoder.forward(&src, &src_mask, true).unwrap();
        assert_eq!(memory.dims(), &[2, 5, 8]);
        let out = decoder.forward(&tgt, &memory, &tgt_mask, &src_mask, false).unwrap();
        assert_eq!(out.dims(), &[2, 3, 8]);
    }
}

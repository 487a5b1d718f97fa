//! Transformer encoder-decoder for sequence-to-sequence generation.

use candle_core::{D, DType, IndexOp, Result, Tensor};
use candle_nn::{Dropout, Linear, Module, ModuleT, VarBuilder, linear, ops::log_softmax};
use serde::{Deserialize, Serialize};

use crate::nn::{DecoderLayer, EncoderLayer, PaddedEmbedding, PositionalEncoding, causal_mask, padding_mask};

/// Hyperparameters of a [`Seq2SeqTransformer`], persisted alongside its weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    pub source_vocab_size: usize,
    pub target_vocab_size: usize,
    pub embedding_dim: usize,
    pub head_num: usize,
    pub layer_num: usize,
    pub feed_forward_dim: usize,
    pub dropout: f32,
    /// Longest sequence (including `[BOS]`/`[EOS]`) the positional table covers.
    pub max_length: usize,
    /// Shared `[PAD]` index; its embedding rows stay zero.
    pub padding_idx: u32,
}

impl TransformerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: String| Err(crate::SeqlabError::InvalidConfig(msg));
        if self.source_vocab_size == 0 || self.target_vocab_size == 0 {
            return invalid("vocabulary sizes must be non-zero".into());
        }
        if self.head_num == 0 || self.embedding_dim == 0 || self.embedding_dim % self.head_num != 0 {
            return invalid(format!(
                "embedding_dim {} must be a non-zero multiple of head_num {}",
                self.embedding_dim, self.head_num
            ));
        }
        if self.layer_num == 0 || self.feed_forward_dim == 0 || self.max_length == 0 {
            return invalid("layer_num, feed_forward_dim and max_length must be non-zero".into());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return invalid(format!("dropout must be in [0, 1), got {}", self.dropout));
        }
        Ok(())
    }
}

pub struct Seq2SeqTransformer {
    source_embedding: PaddedEmbedding,
    target_embedding: PaddedEmbedding,
    positions: PositionalEncoding,
    encoder: Vec<EncoderLayer>,
    decoder: Vec<DecoderLayer>,
    output: Linear,
    dropout: Dropout,
    scale: f64,
    config: TransformerConfig,
}

impl Seq2SeqTransformer {
    pub fn new(config: TransformerConfig, vb: VarBuilder) -> crate::Result<Self> {
        config.validate()?;
        let dim = config.embedding_dim;

        let encoder = (0..config.layer_num)
            .map(|i| {
                EncoderLayer::new(dim, config.head_num, config.feed_forward_dim, config.dropout, vb.pp(format!("encoder.{i}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let decoder = (0..config.layer_num)
            .map(|i| {
                DecoderLayer::new(dim, config.head_num, config.feed_forward_dim, config.dropout, vb.pp(format!("decoder.{i}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            source_embedding: PaddedEmbedding::new(
                config.source_vocab_size,
                dim,
                config.padding_idx,
                vb.pp("source_embedding"),
            )?,
            target_embedding: PaddedEmbedding::new(
                config.target_vocab_size,
                dim,
                config.padding_idx,
                vb.pp("target_embedding"),
            )?,
            positions: PositionalEncoding::new(config.max_length, dim, vb.device())?,
            encoder,
            decoder,
            output: linear(dim, config.target_vocab_size, vb.pp("output"))?,
            dropout: Dropout::new(config.dropout),
            scale: (dim as f64).sqrt(),
            config,
        })
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    fn embed(&self, table: &PaddedEmbedding, ids: &Tensor, train: bool) -> Result<Tensor> {
        let xs = (table.forward(ids)? * self.scale)?;
        let xs = self.positions.forward(&xs)?;
        self.dropout.forward_t(&xs, train)
    }

    /// Encode `src` (`[batch, src_len]` u32) into memory `[batch, src_len, dim]`.
    pub fn encode(&self, src: &Tensor, src_mask: &Tensor, train: bool) -> Result<Tensor> {
        let key_mask = padding_mask(src_mask)?;
        let mut xs = self.embed(&self.source_embedding, src, train)?;
        for layer in &self.encoder {
            xs = layer.forward(&xs, &key_mask, train)?;
        }
        Ok(xs)
    }

    /// Decoder logits `[batch, tgt_len, target_vocab_size]` for decoder input `tgt`.
    pub fn decode(
        &self,
        tgt: &Tensor,
        tgt_mask: &Tensor,
        memory: &Tensor,
        src_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let tgt_len = tgt.dim(1)?;
        let self_mask = causal_mask(tgt_len, tgt.device())?.broadcast_add(&padding_mask(tgt_mask)?)?;
        let cross_mask = padding_mask(src_mask)?;

        let mut xs = self.embed(&self.target_embedding, tgt, train)?;
        for layer in &self.decoder {
            xs = layer.forward(&xs, memory, &self_mask, &cross_mask, train)?;
        }
        self.output.forward(&xs)
    }

    pub fn forward(
        &self,
        src: &Tensor,
        src_mask: &Tensor,
        tgt: &Tensor,
        tgt_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let memory = self.encode(src, src_mask, train)?;
        self.decode(tgt, tgt_mask, &memory, src_mask, train)
    }

    /// Greedy autoregressive decoding.
    ///
    /// Every output starts after `bos` and stops before `eos` or after
    /// `max_len` tokens.
    pub fn greedy_decode(
        &self,
        src: &Tensor,
        src_mask: &Tensor,
        bos: u32,
        eos: u32,
        max_len: usize,
    ) -> Result<Vec<Vec<u32>>> {
        let batch = src.dim(0)?;
        let device = src.device();
        let memory = self.encode(src, src_mask, false)?;
        let max_len = max_len.min(self.positions.max_len().saturating_sub(1));

        let mut outputs: Vec<Vec<u32>> = vec![Vec::new(); batch];
        let mut finished = vec![false; batch];
        let mut prefix: Vec<Vec<u32>> = vec![vec![bos]; batch];

        for _ in 0..max_len {
            let len = prefix[0].len();
            let ids = Tensor::from_vec(prefix.concat(), (batch, len), device)?;
            let ones = Tensor::ones((batch, len), DType::F32, device)?;

            let logits = self.decode(&ids, &ones, &memory, src_mask, false)?;
            let next: Vec<u32> = logits.i((.., len - 1, ..))?.argmax(D::Minus1)?.to_vec1()?;

            for (b, &token) in next.iter().enumerate() {
                if !finished[b] {
                    if token == eos {
                        finished[b] = true;
                    } else {
                        outputs[b].push(token);
                    }
                }
                prefix[b].push(token);
            }

            if finished.iter().all(|&f| f) {
                break;
            }
        }

        Ok(outputs)
    }
}

/// Token-level cross entropy over positions where `mask` is 1.
///
/// * `logits` - `[batch, len, vocab]`
/// * `targets` - `[batch, len]` u32
/// * `mask` - `[batch, len]` f32
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let log_probs = log_softmax(logits, D::Minus1)?;
    let picked = log_probs
        .gather(&targets.unsqueeze(2)?.contiguous()?, 2)?
        .squeeze(2)?;
    let total = mask.sum_all()?.clamp(1f32, f32::MAX)?;
    (picked * mask)?.sum_all()?.neg()?.div(&total)
}

/// Number of masked positions where `argmax(logits) == targets`.
pub fn correct_tokens(logits: &Tensor, targets: &Tensor, mask: &Tensor) -> Result<f32> {
    let predicted = logits.argmax(D::Minus1)?;
    let hits = predicted.eq(targets)?.to_dtype(DType::F32)?;
    (hits * mask)?.sum_all()?.to_scalar::<f32>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Batch;
    use candle_core::Device;
    use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};

    fn config() -> TransformerConfig {
        TransformerConfig {
            source_vocab_size: 8,
            target_vocab_size: 8,
            embedding_dim: 16,
            head_num: 2,
            layer_num: 1,
            feed_forward_dim: 32,
            dropout: 0.0,
            max_length: 12,
            padding_idx: 0,
        }
    }

    #[test]
    fn rejects_indivisible_heads() {
        let mut c = config();
        c.head_num = 3;
        assert!(c.validate().is_err());
    }

    #[test]
    fn forward_shapes() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Seq2SeqTransformer::new(config(), vb).unwrap();

        let src = Batch::from_sequences(&[vec![4, 5, 3], vec![6, 3]], 0, &Device::Cpu).unwrap();
        let tgt = Batch::from_sequences(&[vec![2, 4], vec![2, 5]], 0, &Device::Cpu).unwrap();
        let logits = model.forward(&src.ids, &src.mask, &tgt.ids, &tgt.mask, false).unwrap();
        assert_eq!(logits.dims(), &[2, 2, 8]);
    }

    #[test]
    fn cross_entropy_ignores_padding() {
        let logits = Tensor::new(&[[[2f32, 0.0], [0.0, 2.0]]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0u32, 0]], &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1f32, 0.0]], &Device::Cpu).unwrap();

        let loss: f32 = masked_cross_entropy(&logits, &targets, &mask).unwrap().to_scalar().unwrap();
        let expected = -(2f32.exp() / (2f32.exp() + 1.0)).ln();
        assert!((loss - expected).abs() < 1e-5);

        let correct = correct_tokens(&logits, &targets, &mask).unwrap();
        assert_eq!(correct, 1.0);
    }

    #[test]
    fn learns_to_copy() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Seq2SeqTransformer::new(config(), vb).unwrap();
        let (bos, eos) = (2u32, 3u32);

        let sources = vec![vec![4, 5, eos], vec![6, 7, eos], vec![5, 4, eos]];
        let decoder_in = vec![vec![bos, 4, 5], vec![bos, 6, 7], vec![bos, 5, 4]];
        let decoder_out = vec![vec![4, 5, eos], vec![6, 7, eos], vec![5, 4, eos]];

        let src = Batch::from_sequences(&sources, 0, &Device::Cpu).unwrap();
        let tgt_in = Batch::from_sequences(&decoder_in, 0, &Device::Cpu).unwrap();
        let tgt_out = Batch::from_sequences(&decoder_out, 0, &Device::Cpu).unwrap();

        let mut opt = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: 0.01,
                weight_decay: 0.0,
                ..Default::default()
            },
        )
        .unwrap();

        for _ in 0..150 {
            let logits = model.forward(&src.ids, &src.mask, &tgt_in.ids, &tgt_in.mask, true).unwrap();
            let loss = masked_cross_entropy(&logits, &tgt_out.ids, &tgt_out.mask).unwrap();
            opt.backward_step(&loss).unwrap();
        }

        let decoded = model.greedy_decode(&src.ids, &src.mask, bos, eos, 5).unwrap();
        assert_eq!(decoded, vec![vec![4, 5], vec![6, 7], vec![5, 4]]);
    }

    #[test]
    fn greedy_decode_respects_max_len() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Seq2SeqTransformer::new(config(), vb).unwrap();

        let src = Batch::from_sequences(&[vec![4, 3]], 0, &Device::Cpu).unwrap();
        // eos outside the vocabulary can never be produced
        let decoded = model.greedy_decode(&src.ids, &src.mask, 2, 99, 4).unwrap();
        assert_eq!(decoded[0].len(), 4);
    }
}

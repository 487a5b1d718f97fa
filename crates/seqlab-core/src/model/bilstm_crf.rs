//! BiLSTM-CRF sequence labeler.
//!
//! embedding -> dropout -> bidirectional LSTM -> dropout -> linear emissions -> CRF

use candle_core::{Result, Tensor};
use candle_nn::{Dropout, Linear, Module, ModuleT, VarBuilder, linear};
use serde::{Deserialize, Serialize};

use crate::crf::Crf;
use crate::nn::{BiLstm, PaddedEmbedding};
use crate::tags::{ChunkTag, detect_scheme, is_valid_end, is_valid_start, is_valid_transition};
use crate::vocab::Vocabulary;

/// Hyperparameters of a [`BiLstmCrf`], persisted alongside its weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiLstmCrfConfig {
    pub vocabulary_size: usize,
    pub embedding_dim: usize,
    /// Concatenated size of both LSTM directions.
    pub hidden_dim: usize,
    pub label_dim: usize,
    pub dropout: f32,
    /// `[PAD]` word index; its embedding row stays zero.
    pub padding_idx: u32,
    pub begin_idx: usize,
    pub end_idx: usize,
}

impl BiLstmCrfConfig {
    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |msg: String| Err(crate::SeqlabError::InvalidConfig(msg));
        if self.vocabulary_size == 0 || self.embedding_dim == 0 {
            return invalid("vocabulary and embedding sizes must be non-zero".into());
        }
        if self.hidden_dim == 0 || self.hidden_dim % 2 != 0 {
            return invalid(format!("hidden_dim must be even and non-zero, got {}", self.hidden_dim));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return invalid(format!("dropout must be in [0, 1), got {}", self.dropout));
        }
        if self.padding_idx as usize >= self.vocabulary_size {
            return invalid(format!("padding index {} out of range", self.padding_idx));
        }
        if self.begin_idx >= self.label_dim || self.end_idx >= self.label_dim || self.begin_idx == self.end_idx {
            return invalid(format!(
                "begin/end labels {}/{} invalid for {} labels",
                self.begin_idx, self.end_idx, self.label_dim
            ));
        }
        Ok(())
    }
}

pub struct BiLstmCrf {
    embedding: PaddedEmbedding,
    lstm: BiLstm,
    dropout: Dropout,
    hidden2label: Linear,
    crf: Crf,
    config: BiLstmCrfConfig,
}

impl BiLstmCrf {
    pub fn new(config: BiLstmCrfConfig, vb: VarBuilder) -> crate::Result<Self> {
        config.validate()?;

        let embedding = PaddedEmbedding::new(
            config.vocabulary_size,
            config.embedding_dim,
            config.padding_idx,
            vb.pp("embedding"),
        )?;
        let lstm = BiLstm::new(config.embedding_dim, config.hidden_dim, vb.pp("lstm"))?;
        let hidden2label = linear(config.hidden_dim, config.label_dim, vb.pp("hidden2label"))?;
        let crf = Crf::new(config.label_dim, config.begin_idx, config.end_idx, vb.pp("crf"))?;

        Ok(Self {
            embedding,
            lstm,
            dropout: Dropout::new(config.dropout),
            hidden2label,
            crf,
            config,
        })
    }

    /// Restrict decoding to label sequences that are well-formed under the
    /// chunking scheme (BIO or BIOES) of `labels`.
    pub fn constrain_to_scheme(mut self, labels: &Vocabulary) -> Self {
        let tags: Vec<ChunkTag<'_>> = labels.tokens().iter().map(|l| ChunkTag::parse(l)).collect();
        let scheme = detect_scheme(labels.tokens());
        let lookup = |idx: usize| tags.get(idx).copied();

        self.crf = self.crf.with_decode_constraints(
            |from, to| match (lookup(from), lookup(to)) {
                (Some(f), Some(t)) => is_valid_transition(f, t, scheme),
                _ => true,
            },
            |tag| lookup(tag).is_none_or(is_valid_start),
            |tag| lookup(tag).is_none_or(|t| is_valid_end(t, scheme)),
        );
        self
    }

    pub fn without_decode_constraints(mut self) -> Self {
        self.crf = self.crf.without_decode_constraints();
        self
    }

    pub fn config(&self) -> &BiLstmCrfConfig {
        &self.config
    }

    pub fn crf(&self) -> &Crf {
        &self.crf
    }

    /// Per-token label scores `[batch, seq_len, label_dim]`.
    pub fn emissions(&self, words: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let embedded = self.embedding.forward(words)?;
        let embedded = self.dropout.forward_t(&embedded, train)?;
        let hidden = self.lstm.forward(&embedded, mask)?;
        let hidden = self.dropout.forward_t(&hidden, train)?;
        self.hidden2label.forward(&hidden)
    }

    /// CRF negative log-likelihood of the gold `labels`, averaged over the batch.
    pub fn loss(&self, words: &Tensor, labels: &[Vec<u32>], mask: &Tensor) -> Result<Tensor> {
        let emissions = self.emissions(words, mask, true)?;
        self.crf.neg_log_likelihood(&emissions, labels, mask)
    }

    /// Same as [`loss`](Self::loss) but without dropout.
    pub fn eval_loss(&self, words: &Tensor, labels: &[Vec<u32>], mask: &Tensor) -> Result<Tensor> {
        let emissions = self.emissions(words, mask, false)?;
        self.crf.neg_log_likelihood(&emissions, labels, mask)
    }

    /// Best label index sequence for every sentence, `lengths[i]` long.
    pub fn predict(&self, words: &Tensor, mask: &Tensor, lengths: &[usize]) -> crate::Result<Vec<Vec<u32>>> {
        let emissions = self.emissions(words, mask, false)?;
        self.crf.decode(&emissions, lengths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Batch;
    use crate::vocab::{BOL, EOL};
    use candle_core::{DType, Device};
    use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};

    fn config() -> BiLstmCrfConfig {
        BiLstmCrfConfig {
            vocabulary_size: 6,
            embedding_dim: 8,
            hidden_dim: 8,
            label_dim: 4,
            dropout: 0.0,
            padding_idx: 0,
            begin_idx: 2,
            end_idx: 3,
        }
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let mut c = config();
        c.hidden_dim = 7;
        assert!(c.validate().is_err());

        let mut c = config();
        c.begin_idx = 9;
        assert!(c.validate().is_err());

        let mut c = config();
        c.dropout = 1.0;
        assert!(c.validate().is_err());

        assert!(config().validate().is_ok());
    }

    #[test]
    fn predicts_one_label_per_token() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = BiLstmCrf::new(config(), vb).unwrap();

        let batch = Batch::from_sequences(&[vec![2, 3, 4], vec![5]], 0, &Device::Cpu).unwrap();
        let paths = model.predict(&batch.ids, &batch.mask, &batch.lengths).unwrap();
        assert_eq!(paths[0].len(), 3);
        assert_eq!(paths[1].len(), 1);
        assert!(paths.iter().flatten().all(|&l| l < 2));
    }

    #[test]
    fn learns_a_trivial_mapping() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = BiLstmCrf::new(config(), vb).unwrap();

        // word 2 -> label 0, word 3 -> label 1
        let words = vec![vec![2, 3, 2], vec![3, 3], vec![2]];
        let labels = vec![vec![0, 1, 0], vec![1, 1], vec![0]];
        let batch = Batch::from_sequences(&words, 0, &Device::Cpu).unwrap();

        let mut opt = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: 0.05,
                weight_decay: 0.0,
                ..Default::default()
            },
        )
        .unwrap();

        let first: f32 = model.loss(&batch.ids, &labels, &batch.mask).unwrap().to_scalar().unwrap();
        for _ in 0..60 {
            let loss = model.loss(&batch.ids, &labels, &batch.mask).unwrap();
            opt.backward_step(&loss).unwrap();
        }
        let last: f32 = model.eval_loss(&batch.ids, &labels, &batch.mask).unwrap().to_scalar().unwrap();
        assert!(last < first);

        let paths = model.predict(&batch.ids, &batch.mask, &batch.lengths).unwrap();
        assert_eq!(paths, labels);
    }

    #[test]
    fn scheme_constraints_forbid_orphan_inside_tags() {
        let mut labels = Vocabulary::new();
        labels.append(&["O", "I-PER", BOL, EOL]);
        let config = BiLstmCrfConfig {
            begin_idx: 2,
            end_idx: 3,
            ..config()
        };

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = BiLstmCrf::new(config, vb).unwrap().constrain_to_scheme(&labels);

        // I-PER can never start a sentence and never follow O, so only O remains
        let batch = Batch::from_sequences(&[vec![1, 2, 3, 4]], 0, &Device::Cpu).unwrap();
        let paths = model.predict(&batch.ids, &batch.mask, &batch.lengths).unwrap();
        assert_eq!(paths[0], vec![0, 0, 0, 0]);
    }
}

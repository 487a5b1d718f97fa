//! # Command-Line Configuration
//!
//! Clap definitions for the `bilstm-crf` and `transformer` binaries. Every
//! flag has a `--kebab-case` name, an underscore alias and a short visible
//! alias (`--bs`, `--lr`, ...).

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, ValueEnum};
use seqlab_core::SeqlabError;

/// What a binary run does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Train (or resume training) and keep the best checkpoint.
    Train,
    /// Load a checkpoint and write predictions.
    Predict,
}

/// Flags shared by both pipelines.
#[derive(Debug, Clone, Args)]
pub struct CommonArgs {
    /// Random seed
    #[arg(long = "random-seed", visible_alias = "rs", alias = "random_seed", default_value_t = 0)]
    pub random_seed: u64,

    /// Train a model or predict with a saved one
    #[arg(short, long, value_enum, default_value_t = Mode::Train)]
    pub mode: Mode,

    /// Sentences are truncated to this many tokens
    #[arg(long = "max-length", visible_alias = "ml", alias = "max_length", default_value_t = 512)]
    pub max_length: usize,

    /// Batch size
    #[arg(long = "batch-size", visible_alias = "bs", alias = "batch_size", default_value_t = 16)]
    pub batch_size: usize,

    /// Learning rate
    #[arg(long = "learning-rate", visible_alias = "lr", alias = "learning_rate", default_value_t = 1e-2)]
    pub learning_rate: f64,

    /// Dropout rate
    #[arg(long = "dropout-rate", visible_alias = "dr", alias = "dropout_rate", default_value_t = 0.3)]
    pub dropout_rate: f32,

    /// Log the global gradient norm of every training step
    #[arg(long = "log-gradients", alias = "log_gradients")]
    pub log_gradients: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl CommonArgs {
    pub fn validate(&self) -> seqlab_core::Result<()> {
        if self.batch_size == 0 {
            return invalid("batch_size must be positive".into());
        }
        if self.max_length == 0 {
            return invalid("max_length must be positive".into());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return invalid(format!("dropout_rate must be in [0, 1), got {}", self.dropout_rate));
        }
        Ok(())
    }
}

/// BiLSTM-CRF sequence labeling.
#[derive(Debug, Clone, Parser)]
#[command(name = "bilstm-crf")]
#[command(about = "Train a BiLSTM-CRF sequence labeler or tag sentences with it")]
#[command(version)]
pub struct TaggerArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Checkpoint path, without extension
    #[arg(long = "model-path", visible_alias = "mp", alias = "model_path", default_value = "bilstm_crf/model/bilstm_crf")]
    pub model_path: PathBuf,

    /// Word embedding dimension
    #[arg(long = "embedding-dim", visible_alias = "ed", alias = "embedding_dim", default_value_t = 128)]
    pub embedding_dim: usize,

    /// Concatenated hidden size of both LSTM directions
    #[arg(long = "hidden-dim", visible_alias = "hd", alias = "hidden_dim", default_value_t = 256)]
    pub hidden_dim: usize,

    /// Number of training epochs
    #[arg(short, long, default_value_t = 50)]
    pub epoch: usize,

    /// Decode only well-formed BIO/BIOES sequences (leave off for IOB1 data)
    #[arg(long = "scheme-constraints", alias = "scheme_constraints")]
    pub scheme_constraints: bool,

    /// Training corpus (`word label` per line)
    #[arg(long = "train-data-path", visible_alias = "tdp", alias = "train_data_path", default_value = "data/ner/train.txt")]
    pub train_data_path: PathBuf,

    /// Validation corpus
    #[arg(long = "valid-data-path", visible_alias = "vdp", alias = "valid_data_path", default_value = "data/ner/valid.txt")]
    pub valid_data_path: PathBuf,

    /// Sentences to tag in predict mode
    #[arg(long = "predict-data-path", visible_alias = "pdp", alias = "predict_data_path", default_value = "data/ner/test.txt")]
    pub predict_data_path: PathBuf,

    /// Where predictions are written
    #[arg(long = "save-path", visible_alias = "sp", alias = "save_path", default_value = "data/ner/result_bilstm_crf.txt")]
    pub save_path: PathBuf,
}

impl TaggerArgs {
    pub fn validate(&self) -> seqlab_core::Result<()> {
        self.common.validate()?;
        if self.embedding_dim == 0 {
            return invalid("embedding_dim must be positive".into());
        }
        if self.hidden_dim == 0 || self.hidden_dim % 2 != 0 {
            return invalid(format!("hidden_dim must be even and positive, got {}", self.hidden_dim));
        }
        Ok(())
    }
}

/// Transformer sequence-to-sequence translation.
#[derive(Debug, Clone, Parser)]
#[command(name = "transformer")]
#[command(about = "Train a Transformer translation model or translate with it")]
#[command(version)]
pub struct TransformerArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Checkpoint path, without extension
    #[arg(long = "model-path", visible_alias = "mp", alias = "model_path", default_value = "transformer/model/transformer")]
    pub model_path: PathBuf,

    /// Model dimension
    #[arg(long = "embedding-dim", visible_alias = "ed", alias = "embedding_dim", default_value_t = 16)]
    pub embedding_dim: usize,

    /// Attention heads per layer
    #[arg(long = "head-num", visible_alias = "hn", alias = "head_num", default_value_t = 2)]
    pub head_num: usize,

    /// Encoder and decoder layers
    #[arg(long = "layer-num", visible_alias = "ln", alias = "layer_num", default_value_t = 2)]
    pub layer_num: usize,

    /// Number of training epochs
    #[arg(short, long, default_value_t = 200)]
    pub epoch: usize,

    /// Probability that a batch is decoded from the gold target prefix
    #[arg(long = "teacher-forcing-ratio", visible_alias = "tfr", alias = "teacher_forcing_ratio", default_value_t = 0.2)]
    pub teacher_forcing_ratio: f64,

    /// Training pairs (JSON array or JSON lines of `{source, target}`)
    #[arg(long = "train-data-path", visible_alias = "tdp", alias = "train_data_path", default_value = "data/translation/train.json")]
    pub train_data_path: PathBuf,

    /// Validation pairs
    #[arg(long = "valid-data-path", visible_alias = "vdp", alias = "valid_data_path", default_value = "data/translation/valid.json")]
    pub valid_data_path: PathBuf,

    /// Sources to translate in predict mode
    #[arg(long = "predict-data-path", visible_alias = "pdp", alias = "predict_data_path", default_value = "data/translation/test.json")]
    pub predict_data_path: PathBuf,

    /// Where translations are written
    #[arg(long = "save-path", visible_alias = "sp", alias = "save_path", default_value = "data/translation/result_transformer.json")]
    pub save_path: PathBuf,
}

impl TransformerArgs {
    pub fn validate(&self) -> seqlab_core::Result<()> {
        self.common.validate()?;
        if self.head_num == 0 || self.embedding_dim == 0 || self.embedding_dim % self.head_num != 0 {
            return invalid(format!(
                "embedding_dim {} must be a positive multiple of head_num {}",
                self.embedding_dim, self.head_num
            ));
        }
        if self.layer_num == 0 {
            return invalid("layer_num must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.teacher_forcing_ratio) {
            return invalid(format!(
                "teacher_forcing_ratio must be in [0, 1], got {}",
                self.teacher_forcing_ratio
            ));
        }
        Ok(())
    }
}

fn invalid(msg: String) -> seqlab_core::Result<()> {
    Err(SeqlabError::InvalidConfig(msg))
}

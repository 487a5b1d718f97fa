//! Training, evaluation and prediction for the BiLSTM-CRF tagger.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, bail};
use candle_core::{DType, Device};
use candle_nn::{Optimizer, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use seqlab_core::data::{Batch, Batcher, TaggingData};
use seqlab_core::metrics::{ChunkScores, TokenAccuracy};
use seqlab_core::model::{BiLstmCrf, BiLstmCrfConfig};
use seqlab_core::vocab::{BOL, EOL, PAD, Vocabulary};

use crate::checkpoint::Checkpoint;
use crate::optim::gradient_norm;

/// Everything a tagging checkpoint stores besides the weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaggerMetadata {
    model: BiLstmCrfConfig,
    words: Vocabulary,
    labels: Vocabulary,
    #[serde(default)]
    scheme_constraints: bool,
}

/// A BiLSTM-CRF together with its variables and vocabularies.
pub struct TaggerModel {
    varmap: VarMap,
    model: BiLstmCrf,
    words: Vocabulary,
    labels: Vocabulary,
    scheme_constraints: bool,
}

impl TaggerModel {
    /// Initialize a fresh model sized for `words` and `labels`.
    ///
    /// `labels` must contain the `[BOL]`/`[EOL]` pseudo labels and `words`
    /// the `[PAD]` token.
    pub fn build(
        words: Vocabulary,
        labels: Vocabulary,
        embedding_dim: usize,
        hidden_dim: usize,
        dropout: f32,
        device: &Device,
    ) -> Result<Self> {
        let config = BiLstmCrfConfig {
            vocabulary_size: words.len(),
            embedding_dim,
            hidden_dim,
            label_dim: labels.len(),
            dropout,
            padding_idx: words.special(PAD)?,
            begin_idx: labels.special(BOL)? as usize,
            end_idx: labels.special(EOL)? as usize,
        };
        Self::from_config(config, words, labels, false, device)
    }

    fn from_config(
        config: BiLstmCrfConfig,
        words: Vocabulary,
        labels: Vocabulary,
        scheme_constraints: bool,
        device: &Device,
    ) -> Result<Self> {
        if config.vocabulary_size != words.len() || config.label_dim != labels.len() {
            bail!(
                "model sizes {}/{} do not match vocabularies {}/{}",
                config.vocabulary_size,
                config.label_dim,
                words.len(),
                labels.len()
            );
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let mut model = BiLstmCrf::new(config, vb)?;
        if scheme_constraints {
            model = model.constrain_to_scheme(&labels);
        }

        Ok(Self {
            varmap,
            model,
            words,
            labels,
            scheme_constraints,
        })
    }

    /// Only decode label sequences that are well-formed BIO/BIOES.
    ///
    /// Off by default: IOB1 corpora start chunks with `I-X`, which these
    /// constraints forbid. The setting is stored in the checkpoint.
    pub fn with_scheme_constraints(mut self, enabled: bool) -> Self {
        if enabled && !self.scheme_constraints {
            self.model = self.model.constrain_to_scheme(&self.labels);
        } else if !enabled && self.scheme_constraints {
            self.model = self.model.without_decode_constraints();
        }
        self.scheme_constraints = enabled;
        self
    }

    pub fn scheme_constraints(&self) -> bool {
        self.scheme_constraints
    }

    /// Rebuild a model from a checkpoint written by [`save`](Self::save).
    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let checkpoint = Checkpoint::new(path);
        let meta: TaggerMetadata = checkpoint.load_metadata()?;
        let mut tagger = Self::from_config(meta.model, meta.words, meta.labels, meta.scheme_constraints, device)?;
        checkpoint.load_weights(&mut tagger.varmap)?;

        info!(
            words = tagger.words.len(),
            labels = tagger.labels.len(),
            "Loaded tagger from {}",
            checkpoint.weights_path().display()
        );
        Ok(tagger)
    }

    /// Resume from the checkpoint at `path` when there is one, otherwise
    /// initialize through `build`.
    pub fn load_or_build<P, F>(path: P, device: &Device, build: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: FnOnce() -> Result<Self>,
    {
        let path = path.as_ref();
        if Checkpoint::new(path).exists() {
            info!("Resuming from {}", path.display());
            Self::load(path, device)
        } else {
            build()
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let meta = TaggerMetadata {
            model: self.model.config().clone(),
            words: self.words.clone(),
            labels: self.labels.clone(),
            scheme_constraints: self.scheme_constraints,
        };
        Checkpoint::new(path).save(&self.varmap, &meta)
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn model(&self) -> &BiLstmCrf {
        &self.model
    }

    pub fn words(&self) -> &Vocabulary {
        &self.words
    }

    pub fn labels(&self) -> &Vocabulary {
        &self.labels
    }

    /// Label strings for already tokenized sentences.
    pub fn tag<S: AsRef<str>>(&self, sentences: &[Vec<S>], device: &Device) -> Result<Vec<Vec<String>>> {
        let encoded = sentences
            .iter()
            .map(|words| self.words.encode(words))
            .collect::<seqlab_core::Result<Vec<_>>>()?;
        let batch = Batch::from_sequences(&encoded, self.model.config().padding_idx, device)?;
        let paths = self.model.predict(&batch.ids, &batch.mask, &batch.lengths)?;
        Ok(paths.iter().map(|path| self.labels.decode(path)).collect())
    }
}

/// Validation scores of a tagger.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TaggerMetrics {
    /// Mean per-sentence CRF negative log-likelihood.
    pub loss: f32,
    pub accuracy: f32,
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
}

impl TaggerMetrics {
    /// Higher chunk F1 wins; token accuracy breaks ties.
    pub fn improves_on(&self, best: Option<&TaggerMetrics>) -> bool {
        match best {
            None => true,
            Some(best) => self.f1 > best.f1 || (self.f1 == best.f1 && self.accuracy > best.accuracy),
        }
    }
}

/// Drives a [`TaggerModel`] over datasets.
pub struct TaggerProcessor {
    batch_size: usize,
    device: Device,
    seed: u64,
    log_gradients: bool,
    tagger: Option<TaggerModel>,
}

impl TaggerProcessor {
    pub fn new(batch_size: usize, tagger: TaggerModel, device: Device) -> Self {
        Self {
            batch_size,
            device,
            seed: 0,
            log_gradients: false,
            tagger: Some(tagger),
        }
    }

    /// A processor without a model; call [`load`](Self::load) before predicting.
    pub fn for_prediction(batch_size: usize, device: Device) -> Self {
        Self {
            batch_size,
            device,
            seed: 0,
            log_gradients: false,
            tagger: None,
        }
    }

    /// Seed for the per-epoch shuffling.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_gradient_logging(mut self, enabled: bool) -> Self {
        self.log_gradients = enabled;
        self
    }

    pub fn tagger(&self) -> Result<&TaggerModel> {
        self.tagger.as_ref().context("no tagger loaded")
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.tagger = Some(TaggerModel::load(path, &self.device)?);
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.tagger()?.save(path)
    }

    /// Train for `epochs` epochs, saving to `path` whenever validation improves.
    ///
    /// Returns the best validation metrics seen.
    pub fn fit<O: Optimizer, P: AsRef<Path>>(
        &self,
        optimizer: &mut O,
        epochs: usize,
        path: P,
        train_data: &TaggingData,
        valid_data: &TaggingData,
    ) -> Result<Option<TaggerMetrics>> {
        let tagger = self.tagger()?;
        let encoded = train_data.encode(&tagger.words, &tagger.labels)?;
        let batcher = Batcher::new(self.batch_size).shuffled(self.seed);
        let vars = tagger.varmap.all_vars();
        let pad = tagger.model.config().padding_idx;

        info!(
            sentences = encoded.len(),
            parameters = vars.iter().map(|v| v.elem_count()).sum::<usize>(),
            "Starting tagger training"
        );

        let mut best: Option<TaggerMetrics> = None;
        for epoch in 0..epochs {
            let batches = batcher.batches(encoded.len(), epoch);
            let mut epoch_loss = 0f32;

            for (step, positions) in batches.iter().enumerate() {
                let (words, labels): (Vec<Vec<u32>>, Vec<Vec<u32>>) =
                    positions.iter().map(|&i| encoded[i].clone()).unzip();
                let batch = Batch::from_sequences(&words, pad, &self.device)?;

                let loss = tagger.model.loss(&batch.ids, &labels, &batch.mask)?;
                let grads = loss.backward()?;
                if self.log_gradients {
                    info!(epoch = epoch + 1, step = step + 1, norm = gradient_norm(&grads, &vars)?, "gradient");
                }
                optimizer.step(&grads)?;

                let value = loss.to_scalar::<f32>()?;
                epoch_loss += value;
                debug!(epoch = epoch + 1, step = step + 1, loss = value, "train step");
            }

            let metrics = self.evaluate(valid_data)?;
            info!(
                "Epoch {}/{} - train loss: {:.4}, valid loss: {:.4}, accuracy: {:.2}%, F1: {:.2}%",
                epoch + 1,
                epochs,
                epoch_loss / batches.len().max(1) as f32,
                metrics.loss,
                metrics.accuracy * 100.0,
                metrics.f1 * 100.0
            );

            if metrics.improves_on(best.as_ref()) {
                tagger.save(&path)?;
                best = Some(metrics);
            }
        }

        Ok(best)
    }

    /// Loss, token accuracy and chunk scores on labeled data.
    pub fn evaluate(&self, data: &TaggingData) -> Result<TaggerMetrics> {
        let tagger = self.tagger()?;
        if let Some(pos) = data.sentences().iter().position(|s| !s.is_labeled()) {
            bail!("sentence {} of the {} data has no labels", pos + 1, data.split());
        }

        let encoded = data.encode(&tagger.words, &tagger.labels)?;
        let pad = tagger.model.config().padding_idx;

        let mut loss_sum = 0f32;
        let mut accuracy = TokenAccuracy::default();
        let mut chunks = ChunkScores::default();

        for positions in Batcher::new(self.batch_size).batches(encoded.len(), 0) {
            let (words, labels): (Vec<Vec<u32>>, Vec<Vec<u32>>) =
                positions.iter().map(|&i| encoded[i].clone()).unzip();
            let batch = Batch::from_sequences(&words, pad, &self.device)?;

            let loss = tagger.model.eval_loss(&batch.ids, &labels, &batch.mask)?;
            loss_sum += loss.to_scalar::<f32>()? * positions.len() as f32;

            let paths = tagger.model.predict(&batch.ids, &batch.mask, &batch.lengths)?;
            for (path, gold) in paths.iter().zip(&labels) {
                accuracy.update(path, gold);
                chunks.update(&tagger.labels.decode(path), &tagger.labels.decode(gold));
            }
        }

        Ok(TaggerMetrics {
            loss: loss_sum / encoded.len().max(1) as f32,
            accuracy: accuracy.value(),
            precision: chunks.precision(),
            recall: chunks.recall(),
            f1: chunks.f1(),
        })
    }

    /// Predicted label strings for every sentence, in order.
    pub fn predict(&self, data: &TaggingData) -> Result<Vec<Vec<String>>> {
        let tagger = self.tagger()?;
        let words = data.words();

        let mut predictions = Vec::with_capacity(words.len());
        for positions in Batcher::new(self.batch_size).batches(words.len(), 0) {
            let sentences: Vec<Vec<String>> = positions.iter().map(|&i| words[i].clone()).collect();
            predictions.extend(tagger.tag(&sentences, &self.device)?);
        }
        Ok(predictions)
    }
}

/// Write `word label` lines, with a blank line after every sentence.
pub fn write_tagged<W: Write>(mut out: W, words: &[Vec<String>], labels: &[Vec<String>]) -> Result<()> {
    for (words, labels) in words.iter().zip(labels) {
        for (word, label) in words.iter().zip(labels) {
            writeln!(out, "{word} {label}")?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

//! Training, evaluation and prediction for the Transformer translator.
//!
//! Sources are encoded as `tokens [EOS]`. Decoder inputs are
//! `[BOS] tokens` and decoder outputs `tokens [EOS]`. Both sides are cut to
//! the model's positional table, which after a resume may be shorter than
//! the `--max-length` the data was loaded with.

use std::io::Write;
use std::iter;
use std::path::Path;

use anyhow::{Context, Result, bail};
use candle_core::{D, DType, Device};
use candle_nn::{Optimizer, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use seqlab_core::data::{Batch, Batcher, ParallelData};
use seqlab_core::metrics::{TokenAccuracy, corpus_bleu};
use seqlab_core::model::{Seq2SeqTransformer, TransformerConfig, correct_tokens, masked_cross_entropy};
use seqlab_core::vocab::{BOS, EOS, PAD, Vocabulary};

use crate::checkpoint::Checkpoint;
use crate::optim::gradient_norm;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TranslatorMetadata {
    model: TransformerConfig,
    source: Vocabulary,
    target: Vocabulary,
}

/// One entry of the prediction dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    pub source: String,
    pub prediction: String,
}

/// Hyperparameters chosen on the command line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranslatorShape {
    pub embedding_dim: usize,
    pub head_num: usize,
    pub layer_num: usize,
    pub dropout: f32,
    /// Longest source or target sentence, markers excluded.
    pub max_length: usize,
}

/// A Transformer together with its variables and vocabularies.
pub struct TranslatorModel {
    varmap: VarMap,
    model: Seq2SeqTransformer,
    source: Vocabulary,
    target: Vocabulary,
    bos: u32,
    eos: u32,
}

impl TranslatorModel {
    pub fn build(source: Vocabulary, target: Vocabulary, shape: TranslatorShape, device: &Device) -> Result<Self> {
        let padding_idx = source.special(PAD)?;
        if target.special(PAD)? != padding_idx {
            bail!("source and target vocabularies disagree on the {PAD} index");
        }

        let config = TransformerConfig {
            source_vocab_size: source.len(),
            target_vocab_size: target.len(),
            embedding_dim: shape.embedding_dim,
            head_num: shape.head_num,
            layer_num: shape.layer_num,
            feed_forward_dim: 4 * shape.embedding_dim,
            dropout: shape.dropout,
            // one extra position for the [BOS] / [EOS] marker
            max_length: shape.max_length + 1,
            padding_idx,
        };
        Self::from_config(config, source, target, device)
    }

    fn from_config(config: TransformerConfig, source: Vocabulary, target: Vocabulary, device: &Device) -> Result<Self> {
        if config.source_vocab_size != source.len() || config.target_vocab_size != target.len() {
            bail!(
                "model sizes {}/{} do not match vocabularies {}/{}",
                config.source_vocab_size,
                config.target_vocab_size,
                source.len(),
                target.len()
            );
        }
        // [EOS] terminates sources too, so both vocabularies need it
        source.special(EOS)?;
        let bos = target.special(BOS)?;
        let eos = target.special(EOS)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Seq2SeqTransformer::new(config, vb)?;

        Ok(Self {
            varmap,
            model,
            source,
            target,
            bos,
            eos,
        })
    }

    pub fn load<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let checkpoint = Checkpoint::new(path);
        let meta: TranslatorMetadata = checkpoint.load_metadata()?;
        let mut translator = Self::from_config(meta.model, meta.source, meta.target, device)?;
        checkpoint.load_weights(&mut translator.varmap)?;

        info!(
            source = translator.source.len(),
            target = translator.target.len(),
            "Loaded translator from {}",
            checkpoint.weights_path().display()
        );
        Ok(translator)
    }

    /// Resume from the checkpoint at `path` when there is one, otherwise
    /// initialize through `build`. A resumed model keeps its saved shape.
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
        let meta = TranslatorMetadata {
            model: self.model.config().clone(),
            source: self.source.clone(),
            target: self.target.clone(),
        };
        Checkpoint::new(path).save(&self.varmap, &meta)
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn model(&self) -> &Seq2SeqTransformer {
        &self.model
    }

    pub fn source(&self) -> &Vocabulary {
        &self.source
    }

    pub fn target(&self) -> &Vocabulary {
        &self.target
    }

    fn padding_idx(&self) -> u32 {
        self.model.config().padding_idx
    }

    /// `tokens [EOS]`, truncated to fit the positional table.
    fn encode_source<S: AsRef<str>>(&self, tokens: &[S]) -> Result<Vec<u32>> {
        let keep = tokens.len().min(self.model.config().max_length - 1);
        let mut ids = self.source.encode(&tokens[..keep])?;
        ids.push(self.source.special(EOS)?);
        Ok(ids)
    }

    fn decoder_input(&self, target: &[u32]) -> Vec<u32> {
        iter::once(self.bos).chain(target.iter().copied()).collect()
    }

    fn decoder_output(&self, target: &[u32]) -> Vec<u32> {
        target.iter().copied().chain(iter::once(self.eos)).collect()
    }

    /// Greedy translations of already tokenized sources.
    pub fn translate<S: AsRef<str>>(&self, sources: &[Vec<S>], device: &Device) -> Result<Vec<Vec<String>>> {
        let encoded = sources
            .iter()
            .map(|tokens| self.encode_source(tokens))
            .collect::<Result<Vec<_>>>()?;
        let src = Batch::from_sequences(&encoded, self.padding_idx(), device)?;
        let outputs = self
            .model
            .greedy_decode(&src.ids, &src.mask, self.bos, self.eos, self.model.config().max_length)?;
        Ok(outputs.iter().map(|ids| self.target.decode(ids)).collect())
    }
}

/// Validation scores of a translator.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TranslatorMetrics {
    /// Mean token cross entropy with gold decoder inputs.
    pub loss: f32,
    pub accuracy: f32,
    pub bleu: f64,
}

impl TranslatorMetrics {
    /// Higher BLEU wins; lower loss breaks ties.
    pub fn improves_on(&self, best: Option<&TranslatorMetrics>) -> bool {
        match best {
            None => true,
            Some(best) => self.bleu > best.bleu || (self.bleu == best.bleu && self.loss < best.loss),
        }
    }
}

/// Drives a [`TranslatorModel`] over datasets.
pub struct TranslatorProcessor {
    batch_size: usize,
    device: Device,
    seed: u64,
    teacher_forcing_ratio: f64,
    log_gradients: bool,
    translator: Option<TranslatorModel>,
}

impl TranslatorProcessor {
    pub fn new(batch_size: usize, translator: TranslatorModel, device: Device) -> Self {
        Self {
            batch_size,
            device,
            seed: 0,
            teacher_forcing_ratio: 1.0,
            log_gradients: false,
            translator: Some(translator),
        }
    }

    pub fn for_prediction(batch_size: usize, device: Device) -> Self {
        Self {
            batch_size,
            device,
            seed: 0,
            teacher_forcing_ratio: 1.0,
            log_gradients: false,
            translator: None,
        }
    }

    /// Seed for shuffling and the teacher forcing draws.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Probability that a training batch is decoded from the gold target prefix.
    pub fn with_teacher_forcing(mut self, ratio: f64) -> Self {
        self.teacher_forcing_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn with_gradient_logging(mut self, enabled: bool) -> Self {
        self.log_gradients = enabled;
        self
    }

    pub fn translator(&self) -> Result<&TranslatorModel> {
        self.translator.as_ref().context("no translator loaded")
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.translator = Some(TranslatorModel::load(path, &self.device)?);
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.translator()?.save(path)
    }

    fn encode_pairs(&self, data: &ParallelData) -> Result<Vec<(Vec<u32>, Vec<u32>)>> {
        let translator = self.translator()?;
        let eos = translator.source.special(EOS)?;
        let limit = translator.model.config().max_length - 1;

        let pairs = data.encode(&translator.source, &translator.target)?;
        Ok(pairs
            .into_iter()
            .map(|(mut source, mut target)| {
                source.truncate(limit);
                source.push(eos);
                // [BOS] / [EOS] take the last position of the table
                target.truncate(limit);
                (source, target)
            })
            .collect())
    }

    /// Decoder inputs built from the model's own greedy predictions under a
    /// gold-input pass, shifted right behind `[BOS]`.
    fn sampled_inputs(&self, src: &Batch, gold_inputs: &Batch) -> Result<Batch> {
        let translator = self.translator()?;
        let logits = translator
            .model
            .forward(&src.ids, &src.mask, &gold_inputs.ids, &gold_inputs.mask, false)?
            .detach();
        let predicted: Vec<Vec<u32>> = logits.argmax(D::Minus1)?.to_vec2()?;

        let inputs: Vec<Vec<u32>> = predicted
            .iter()
            .zip(&gold_inputs.lengths)
            .map(|(row, &len)| translator.decoder_input(&row[..len - 1]))
            .collect();
        Ok(Batch::from_sequences(&inputs, translator.padding_idx(), &self.device)?)
    }

    /// Train for `epochs` epochs, saving to `path` whenever validation improves.
    pub fn fit<O: Optimizer, P: AsRef<Path>>(
        &self,
        optimizer: &mut O,
        epochs: usize,
        path: P,
        train_data: &ParallelData,
        valid_data: &ParallelData,
    ) -> Result<Option<TranslatorMetrics>> {
        let translator = self.translator()?;
        let encoded = self.encode_pairs(train_data)?;
        let batcher = Batcher::new(self.batch_size).shuffled(self.seed);
        let vars = translator.varmap.all_vars();
        let pad = translator.padding_idx();
        let mut rng = oorandom::Rand64::new(u128::from(self.seed));

        info!(
            pairs = encoded.len(),
            parameters = vars.iter().map(|v| v.elem_count()).sum::<usize>(),
            teacher_forcing_ratio = self.teacher_forcing_ratio,
            "Starting translator training"
        );

        let mut best: Option<TranslatorMetrics> = None;
        for epoch in 0..epochs {
            let batches = batcher.batches(encoded.len(), epoch);
            let mut epoch_loss = 0f32;

            for (step, positions) in batches.iter().enumerate() {
                let sources: Vec<Vec<u32>> = positions.iter().map(|&i| encoded[i].0.clone()).collect();
                let targets: Vec<&[u32]> = positions.iter().map(|&i| encoded[i].1.as_slice()).collect();

                let src = Batch::from_sequences(&sources, pad, &self.device)?;
                let gold_inputs: Vec<Vec<u32>> = targets.iter().map(|t| translator.decoder_input(t)).collect();
                let outputs: Vec<Vec<u32>> = targets.iter().map(|t| translator.decoder_output(t)).collect();
                let gold_inputs = Batch::from_sequences(&gold_inputs, pad, &self.device)?;
                let outputs = Batch::from_sequences(&outputs, pad, &self.device)?;

                let teacher_forced = rng.rand_float() < self.teacher_forcing_ratio;
                let inputs = if teacher_forced {
                    gold_inputs
                } else {
                    self.sampled_inputs(&src, &gold_inputs)?
                };

                let logits = translator
                    .model
                    .forward(&src.ids, &src.mask, &inputs.ids, &inputs.mask, true)?;
                let loss = masked_cross_entropy(&logits, &outputs.ids, &outputs.mask)?;

                let grads = loss.backward()?;
                if self.log_gradients {
                    info!(epoch = epoch + 1, step = step + 1, norm = gradient_norm(&grads, &vars)?, "gradient");
                }
                optimizer.step(&grads)?;

                let value = loss.to_scalar::<f32>()?;
                epoch_loss += value;
                debug!(epoch = epoch + 1, step = step + 1, loss = value, teacher_forced, "train step");
            }

            let metrics = self.evaluate(valid_data)?;
            info!(
                "Epoch {}/{} - train loss: {:.4}, valid loss: {:.4}, accuracy: {:.2}%, BLEU: {:.2}",
                epoch + 1,
                epochs,
                epoch_loss / batches.len().max(1) as f32,
                metrics.loss,
                metrics.accuracy * 100.0,
                metrics.bleu * 100.0
            );

            if metrics.improves_on(best.as_ref()) {
                translator.save(&path)?;
                best = Some(metrics);
            }
        }

        Ok(best)
    }

    /// Gold-input loss and token accuracy, plus BLEU of greedy translations.
    pub fn evaluate(&self, data: &ParallelData) -> Result<TranslatorMetrics> {
        let translator = self.translator()?;
        let encoded = self.encode_pairs(data)?;
        let pad = translator.padding_idx();

        let mut loss_sum = 0f32;
        let mut tokens = 0usize;
        let mut accuracy = TokenAccuracy::default();
        let mut hypotheses = Vec::with_capacity(encoded.len());

        for positions in Batcher::new(self.batch_size).batches(encoded.len(), 0) {
            let sources: Vec<Vec<u32>> = positions.iter().map(|&i| encoded[i].0.clone()).collect();
            let inputs: Vec<Vec<u32>> = positions.iter().map(|&i| translator.decoder_input(&encoded[i].1)).collect();
            let outputs: Vec<Vec<u32>> = positions.iter().map(|&i| translator.decoder_output(&encoded[i].1)).collect();

            let src = Batch::from_sequences(&sources, pad, &self.device)?;
            let inputs = Batch::from_sequences(&inputs, pad, &self.device)?;
            let outputs = Batch::from_sequences(&outputs, pad, &self.device)?;

            let logits = translator
                .model
                .forward(&src.ids, &src.mask, &inputs.ids, &inputs.mask, false)?;
            let loss = masked_cross_entropy(&logits, &outputs.ids, &outputs.mask)?;
            loss_sum += loss.to_scalar::<f32>()? * outputs.tokens() as f32;
            tokens += outputs.tokens();

            let correct = correct_tokens(&logits, &outputs.ids, &outputs.mask)?;
            accuracy.add(correct.round() as usize, outputs.tokens());

            let decoded = translator.model.greedy_decode(
                &src.ids,
                &src.mask,
                translator.bos,
                translator.eos,
                translator.model.config().max_length,
            )?;
            hypotheses.extend(decoded.iter().map(|ids| translator.target.decode(ids)));
        }

        let references: Vec<Vec<String>> = data.targets();
        Ok(TranslatorMetrics {
            loss: loss_sum / tokens.max(1) as f32,
            accuracy: accuracy.value(),
            bleu: corpus_bleu(&hypotheses, &references),
        })
    }

    /// Greedy translations for every source sentence, in order.
    pub fn predict(&self, data: &ParallelData) -> Result<Vec<Vec<String>>> {
        let translator = self.translator()?;
        let sources = data.sources();

        let mut predictions = Vec::with_capacity(sources.len());
        for positions in Batcher::new(self.batch_size).batches(sources.len(), 0) {
            let batch: Vec<Vec<String>> = positions.iter().map(|&i| sources[i].clone()).collect();
            predictions.extend(translator.translate(&batch, &self.device)?);
        }
        Ok(predictions)
    }
}

/// Write a pretty JSON array of `{source, prediction}` objects.
pub fn write_translations<W: Write>(mut out: W, sources: &[Vec<String>], predictions: &[Vec<String>]) -> Result<()> {
    let dump: Vec<Translation> = sources
        .iter()
        .zip(predictions)
        .map(|(source, prediction)| Translation {
            source: source.join(" "),
            prediction: prediction.join(" "),
        })
        .collect();
    serde_json::to_writer_pretty(&mut out, &dump)?;
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::adam;
    use seqlab_core::data::{SentencePair, Split};
    use seqlab_core::vocab::UNK;

    fn pair(source: &str, target: &str) -> SentencePair {
        SentencePair {
            source: source.split_whitespace().map(String::from).collect(),
            target: target.split_whitespace().map(String::from).collect(),
        }
    }

    fn corpus(split: Split) -> ParallelData {
        ParallelData::from_pairs(
            split,
            vec![
                pair("a b", "x y"),
                pair("b a", "y x"),
                pair("a a", "x x"),
                pair("b", "y"),
            ],
        )
    }

    fn vocabularies(data: &ParallelData) -> (Vocabulary, Vocabulary) {
        let mut source = Vocabulary::with_specials(&[PAD, UNK, BOS, EOS]);
        let mut target = Vocabulary::with_specials(&[PAD, UNK, BOS, EOS]);
        for p in data.pairs() {
            source.append(&p.source);
            target.append(&p.target);
        }
        (source, target)
    }

    fn shape() -> TranslatorShape {
        TranslatorShape {
            embedding_dim: 16,
            head_num: 2,
            layer_num: 1,
            dropout: 0.0,
            max_length: 6,
        }
    }

    fn processor(train: &ParallelData, ratio: f64) -> TranslatorProcessor {
        let (source, target) = vocabularies(train);
        let translator = TranslatorModel::build(source, target, shape(), &Device::Cpu).unwrap();
        TranslatorProcessor::new(4, translator, Device::Cpu)
            .with_seed(3)
            .with_teacher_forcing(ratio)
    }

    #[test]
    fn sequences_carry_markers() {
        let train = corpus(Split::Train);
        let processor = processor(&train, 1.0);
        let translator = processor.translator().unwrap();

        let encoded = processor.encode_pairs(&train).unwrap();
        let eos = translator.source().get(EOS).unwrap();
        assert_eq!(encoded[0].0.len(), 3);
        assert_eq!(*encoded[0].0.last().unwrap(), eos);

        let input = translator.decoder_input(&encoded[0].1);
        let output = translator.decoder_output(&encoded[0].1);
        assert_eq!(input[0], translator.target().get(BOS).unwrap());
        assert_eq!(*output.last().unwrap(), translator.target().get(EOS).unwrap());
        assert_eq!(input.len(), output.len());
    }

    #[test]
    fn long_sources_are_truncated_to_the_positional_table() {
        let train = corpus(Split::Train);
        let processor = processor(&train, 1.0);
        let translator = processor.translator().unwrap();

        let long: Vec<String> = iter::repeat_n("a".to_string(), 20).collect();
        let ids = translator.encode_source(&long).unwrap();
        assert_eq!(ids.len(), shape().max_length + 1);
        assert!(translator.translate(&[long], &Device::Cpu).is_ok());
    }

    #[test]
    fn resumed_model_cuts_targets_loaded_with_a_larger_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small");
        let train = corpus(Split::Train);
        processor(&train, 1.0).save(&path).unwrap();

        // data read with a larger --max-length than the checkpoint was built for
        let long_target = vec!["x"; 20].join(" ");
        let valid = ParallelData::from_pairs(Split::Valid, vec![pair("a b", &long_target), pair("b", "y")]);

        let translator = TranslatorModel::load_or_build(&path, &Device::Cpu, || {
            Err(anyhow::anyhow!("checkpoint was not used"))
        })
        .unwrap();
        let resumed = TranslatorProcessor::new(2, translator, Device::Cpu);

        let encoded = resumed.encode_pairs(&valid).unwrap();
        assert_eq!(encoded[0].1.len(), shape().max_length);
        assert!(resumed.evaluate(&valid).is_ok());

        let mut opt = adam(resumed.translator().unwrap().varmap().all_vars(), 0.01).unwrap();
        assert!(resumed.fit(&mut opt, 1, &path, &valid, &valid).is_ok());
    }

    #[test]
    fn load_or_build_without_checkpoint_builds() {
        let dir = tempfile::tempdir().unwrap();
        let (source, target) = vocabularies(&corpus(Split::Train));
        let translator = TranslatorModel::load_or_build(dir.path().join("missing"), &Device::Cpu, || {
            TranslatorModel::build(source.clone(), target.clone(), shape(), &Device::Cpu)
        })
        .unwrap();
        assert_eq!(translator.source(), &source);
        assert_eq!(translator.model().config().max_length, shape().max_length + 1);
    }

    #[test]
    fn translation_dump_is_a_json_array() {
        let sources = vec![vec!["a".to_string(), "b".to_string()]];
        let predictions = vec![vec!["x".to_string(), "y".to_string()]];

        let mut out = Vec::new();
        write_translations(&mut out, &sources, &predictions).unwrap();
        let dump: Vec<Translation> = serde_json::from_slice(&out).unwrap();
        assert_eq!(
            dump,
            vec![Translation {
                source: "a b".into(),
                prediction: "x y".into(),
            }]
        );
        let raw: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(raw[0]["source"], "a b");
        assert_eq!(raw[0]["prediction"], "x y");
    }

    #[test]
    fn sampled_inputs_keep_lengths() {
        let train = corpus(Split::Train);
        let processor = processor(&train, 0.0);
        let translator = processor.translator().unwrap();
        let encoded = processor.encode_pairs(&train).unwrap();

        let sources: Vec<Vec<u32>> = encoded.iter().map(|(s, _)| s.clone()).collect();
        let inputs: Vec<Vec<u32>> = encoded.iter().map(|(_, t)| translator.decoder_input(t)).collect();
        let src = Batch::from_sequences(&sources, 0, &Device::Cpu).unwrap();
        let gold = Batch::from_sequences(&inputs, 0, &Device::Cpu).unwrap();

        let sampled = processor.sampled_inputs(&src, &gold).unwrap();
        assert_eq!(sampled.lengths, gold.lengths);
        let rows: Vec<Vec<u32>> = sampled.ids.to_vec2().unwrap();
        assert!(rows.iter().all(|r| r[0] == translator.target().get(BOS).unwrap()));
    }

    #[test]
    fn fit_learns_and_checkpoint_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model/transformer");
        let train = corpus(Split::Train);
        let valid = corpus(Split::Valid);

        let processor = processor(&train, 0.5);
        let mut opt = adam(processor.translator().unwrap().varmap().all_vars(), 0.01).unwrap();
        let before = processor.evaluate(&valid).unwrap();
        let best = processor.fit(&mut opt, 60, &path, &train, &valid).unwrap().unwrap();
        assert!(best.loss < before.loss);
        assert!(Checkpoint::new(&path).exists());

        let mut restored = TranslatorProcessor::for_prediction(4, Device::Cpu);
        restored.load(&path).unwrap();
        let reloaded = restored.evaluate(&valid).unwrap();
        assert!((reloaded.bleu - best.bleu).abs() < 1e-9);
        assert!((reloaded.loss - best.loss).abs() < 1e-4);

        let predictions = restored.predict(&valid).unwrap();
        assert_eq!(predictions.len(), valid.len());
        assert!(predictions.iter().all(|p| p.len() <= shape().max_length));
    }

    #[test]
    fn metric_ordering() {
        let base = TranslatorMetrics {
            loss: 1.0,
            accuracy: 0.5,
            bleu: 0.3,
        };
        assert!(base.improves_on(None));
        assert!(!base.improves_on(Some(&base)));
        assert!(TranslatorMetrics { loss: 0.5, ..base }.improves_on(Some(&base)));
        assert!(!TranslatorMetrics { bleu: 0.2, loss: 0.1, ..base }.improves_on(Some(&base)));
    }
}

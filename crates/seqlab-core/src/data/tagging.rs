//! Data loading for CoNLL-style sequence labeling corpora.
//!
//! One `word label` pair per line, sentences separated by blank lines.
//! Lines starting with `#` are comments.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{debug, info};

use crate::data::Split;
use crate::error::{Result, SeqlabError};
use crate::vocab::{PAD, UNK, Vocabulary};

/// A single sentence: words and (optionally) their gold labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub words: Vec<String>,
    /// Empty for unlabeled test data.
    pub labels: Vec<String>,
}

impl Sentence {
    pub fn new(words: Vec<String>, labels: Vec<String>) -> Self {
        Self { words, labels }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn is_labeled(&self) -> bool {
        !self.labels.is_empty()
    }
}

/// A tagging corpus for one split.
#[derive(Debug, Clone)]
pub struct TaggingData {
    split: Split,
    sentences: Vec<Sentence>,
}

impl TaggingData {
    pub fn new(split: Split) -> Self {
        Self {
            split,
            sentences: Vec::new(),
        }
    }

    /// Build a dataset from in-memory sentences.
    pub fn from_sentences(split: Split, sentences: Vec<Sentence>) -> Self {
        Self { split, sentences }
    }

    /// Load sentences from `path`, truncating each to `max_length` tokens.
    ///
    /// Returns the word and label vocabularies observed in the file. The word
    /// vocabulary starts with `[PAD]` and `[UNK]`; labels appear in first-seen
    /// order.
    pub fn load<P: AsRef<Path>>(
        &mut self,
        path: P,
        max_length: usize,
    ) -> Result<(Vocabulary, Vocabulary)> {
        let path = path.as_ref();
        let file = File::open(path)?;
        self.sentences = parse_conll(
            BufReader::new(file),
            self.split,
            max_length,
            &path.display().to_string(),
        )?;

        let mut words = Vocabulary::with_specials(&[PAD, UNK]);
        let mut labels = Vocabulary::new();
        for sentence in &self.sentences {
            words.append(&sentence.words);
            labels.append(&sentence.labels);
        }

        info!(
            split = %self.split,
            sentences = self.sentences.len(),
            words = words.len(),
            labels = labels.len(),
            "loaded tagging data from {}",
            path.display()
        );

        Ok((words, labels))
    }

    pub fn split(&self) -> Split {
        self.split
    }

    pub fn sentences(&self) -> &[Sentence] {
        &self.sentences
    }

    /// The word sequences, in file order.
    pub fn words(&self) -> Vec<Vec<String>> {
        self.sentences.iter().map(|s| s.words.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    /// Encode every sentence as `(word indices, label indices)`.
    ///
    /// Unknown words map to `[UNK]`. Unknown labels are an error for splits
    /// that carry gold labels; unlabeled sentences get an empty label vector.
    pub fn encode(
        &self,
        word_vocab: &Vocabulary,
        label_vocab: &Vocabulary,
    ) -> Result<Vec<(Vec<u32>, Vec<u32>)>> {
        self.sentences
            .iter()
            .map(|sentence| {
                let words = word_vocab.encode(&sentence.words)?;
                let labels = sentence
                    .labels
                    .iter()
                    .map(|label| {
                        label_vocab.get(label).ok_or_else(|| SeqlabError::UnknownToken {
                            kind: "label",
                            token: label.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok((words, labels))
            })
            .collect()
    }
}

/// Parse CoNLL-style text into sentences.
fn parse_conll<R: BufRead>(
    reader: R,
    split: Split,
    max_length: usize,
    source: &str,
) -> Result<Vec<Sentence>> {
    let mut sentences = Vec::new();
    let mut words = Vec::new();
    let mut labels = Vec::new();

    let malformed = |line: usize, reason: &str| SeqlabError::MalformedData {
        path: source.to_string(),
        line,
        reason: reason.to_string(),
    };

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();

        if line.is_empty() {
            if !words.is_empty() {
                sentences.push(finish_sentence(
                    std::mem::take(&mut words),
                    std::mem::take(&mut labels),
                    max_length,
                ));
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [word, label] => {
                words.push(word.to_string());
                labels.push(label.to_string());
            }
            [word] if !split.requires_gold() => words.push(word.to_string()),
            [_] => return Err(malformed(line_no + 1, "missing label")),
            _ => return Err(malformed(line_no + 1, "expected `word label`")),
        }

        if !labels.is_empty() && labels.len() != words.len() {
            return Err(malformed(line_no + 1, "sentence mixes labeled and unlabeled tokens"));
        }
    }

    // Last sentence may not be followed by a blank line
    if !words.is_empty() {
        sentences.push(finish_sentence(words, labels, max_length));
    }

    debug!(sentences = sentences.len(), "parsed {}", source);
    Ok(sentences)
}

fn finish_sentence(mut words: Vec<String>, mut labels: Vec<String>, max_length: usize) -> Sentence {
    words.truncate(max_length);
    labels.truncate(max_length);
    Sentence::new(words, labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    const SAMPLE: &str = "# doc 1\nJohn B-PER\nlives O\nin O\nNew B-LOC\nYork I-LOC\n\nHi O\n";

    #[test]
    fn parses_sentences_and_comments() {
        let sentences = parse_conll(Cursor::new(SAMPLE), Split::Train, 512, "mem").unwrap();
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0].words, vec!["John", "lives", "in", "New", "York"]);
        assert_eq!(sentences[0].labels[3], "B-LOC");
        assert_eq!(sentences[1].words, vec!["Hi"]);
    }

    #[test]
    fn truncates_to_max_length() {
        let sentences = parse_conll(Cursor::new(SAMPLE), Split::Train, 2, "mem").unwrap();
        assert_eq!(sentences[0].words, vec!["John", "lives"]);
        assert_eq!(sentences[0].labels, vec!["B-PER", "O"]);
    }

    #[test]
    fn test_split_allows_missing_labels() {
        let sentences = parse_conll(Cursor::new("a\nb\n\nc\n"), Split::Test, 512, "mem").unwrap();
        assert_eq!(sentences.len(), 2);
        assert!(!sentences[0].is_labeled());
    }

    #[test]
    fn train_split_rejects_missing_labels() {
        let err = parse_conll(Cursor::new("a O\nb\n"), Split::Train, 512, "mem").unwrap_err();
        assert!(matches!(err, SeqlabError::MalformedData { line: 2, .. }));
    }

    #[test]
    fn rejects_extra_columns() {
        let err = parse_conll(Cursor::new("a b c\n"), Split::Valid, 512, "mem").unwrap_err();
        assert!(err.to_string().contains("expected `word label`"));
    }

    #[test]
    fn load_builds_vocabularies() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let mut data = TaggingData::new(Split::Train);
        let (words, labels) = data.load(file.path(), 512).unwrap();

        assert_eq!(data.len(), 2);
        assert_eq!(words.get(PAD), Some(0));
        assert_eq!(words.get(UNK), Some(1));
        assert_eq!(words.get("John"), Some(2));
        assert_eq!(labels.tokens(), &["B-PER", "O", "B-LOC", "I-LOC"]);
    }

    #[test]
    fn encode_maps_unknown_words_to_unk() {
        let mut words = Vocabulary::with_specials(&[PAD, UNK]);
        words.add("Hi");
        let labels = Vocabulary::from(vec!["O".to_string()]);

        let data = TaggingData::from_sentences(
            Split::Valid,
            vec![Sentence::new(
                vec!["Hi".into(), "there".into()],
                vec!["O".into(), "O".into()],
            )],
        );
        let encoded = data.encode(&words, &labels).unwrap();
        assert_eq!(encoded[0], (vec![2, 1], vec![0, 0]));
    }

    #[test]
    fn encode_rejects_unknown_labels() {
        let words = Vocabulary::with_specials(&[PAD, UNK]);
        let labels = Vocabulary::from(vec!["O".to_string()]);
        let data = TaggingData::from_sentences(
            Split::Valid,
            vec![Sentence::new(vec!["x".into()], vec!["B-MISC".into()])],
        );
        assert!(matches!(
            data.encode(&words, &labels),
            Err(SeqlabError::UnknownToken { kind: "label", .. })
        ));
    }
}

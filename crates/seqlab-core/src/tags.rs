//! # Chunk Tags
//!
//! Interpretation of label strings under the BIO and BIOES chunking schemes
//! (`B-PER`, `I-PER`, `E-PER`, `S-PER`, `O`). Labels without a recognised
//! prefix (e.g. part-of-speech tags) are treated as unconstrained.

use std::fmt;

/// Position of a token inside a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagPrefix {
    Begin,
    Inside,
    End,
    Single,
    Outside,
    /// Not a chunk tag at all.
    Plain,
}

/// Chunking scheme of a label set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Bio,
    Bioes,
}

/// A parsed label: prefix plus entity type (empty for `O` and plain labels).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTag<'a> {
    pub prefix: TagPrefix,
    pub kind: &'a str,
}

impl<'a> ChunkTag<'a> {
    /// Parse a label string.
    pub fn parse(label: &'a str) -> Self {
        if label == "O" {
            return Self {
                prefix: TagPrefix::Outside,
                kind: "",
            };
        }

        let prefix = match label.get(..2) {
            Some("B-") => TagPrefix::Begin,
            Some("I-") => TagPrefix::Inside,
            Some("E-") => TagPrefix::End,
            Some("S-") => TagPrefix::Single,
            _ => {
                return Self {
                    prefix: TagPrefix::Plain,
                    kind: label,
                };
            }
        };

        Self {
            prefix,
            kind: &label[2..],
        }
    }

    /// Whether this tag continues a chunk opened by an earlier tag.
    pub fn is_continuation(&self) -> bool {
        matches!(self.prefix, TagPrefix::Inside | TagPrefix::End)
    }

    /// Whether, under `scheme`, this tag leaves a chunk open.
    pub fn is_open(&self, scheme: Scheme) -> bool {
        scheme == Scheme::Bioes && matches!(self.prefix, TagPrefix::Begin | TagPrefix::Inside)
    }
}

impl fmt::Display for ChunkTag<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.prefix {
            TagPrefix::Begin => write!(f, "B-{}", self.kind),
            TagPrefix::Inside => write!(f, "I-{}", self.kind),
            TagPrefix::End => write!(f, "E-{}", self.kind),
            TagPrefix::Single => write!(f, "S-{}", self.kind),
            TagPrefix::Outside => write!(f, "O"),
            TagPrefix::Plain => write!(f, "{}", self.kind),
        }
    }
}

/// Detect the scheme of a label set: BIOES if any `E-`/`S-` label is present.
pub fn detect_scheme<S: AsRef<str>>(labels: &[S]) -> Scheme {
    let bioes = labels.iter().any(|l| {
        matches!(
            ChunkTag::parse(l.as_ref()).prefix,
            TagPrefix::End | TagPrefix::Single
        )
    });
    if bioes { Scheme::Bioes } else { Scheme::Bio }
}

/// Check if transitioning from `from` to `to` is valid under `scheme`.
pub fn is_valid_transition(from: ChunkTag<'_>, to: ChunkTag<'_>, scheme: Scheme) -> bool {
    // I-X / E-X only continue a chunk of the same type
    if to.is_continuation() {
        return matches!(from.prefix, TagPrefix::Begin | TagPrefix::Inside) && from.kind == to.kind;
    }
    // BIOES chunks must be closed by E-X before anything else starts
    !from.is_open(scheme)
}

/// Whether a sequence may start with `tag`.
pub fn is_valid_start(tag: ChunkTag<'_>) -> bool {
    !tag.is_continuation()
}

/// Whether a sequence may end with `tag`.
pub fn is_valid_end(tag: ChunkTag<'_>, scheme: Scheme) -> bool {
    !tag.is_open(scheme)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(s: &str) -> ChunkTag<'_> {
        ChunkTag::parse(s)
    }

    #[test]
    fn parses_prefixes() {
        assert_eq!(tag("B-PER").prefix, TagPrefix::Begin);
        assert_eq!(tag("B-PER").kind, "PER");
        assert_eq!(tag("E-LOC").prefix, TagPrefix::End);
        assert_eq!(tag("O").prefix, TagPrefix::Outside);
        assert_eq!(tag("NOUN").prefix, TagPrefix::Plain);
        assert_eq!(tag("NOUN").kind, "NOUN");
        assert_eq!(tag("B").prefix, TagPrefix::Plain);
    }

    #[test]
    fn display_roundtrips() {
        for label in ["B-PER", "I-LOC", "E-ORG", "S-MISC", "O", "VERB"] {
            assert_eq!(tag(label).to_string(), label);
        }
    }

    #[test]
    fn detects_scheme() {
        assert_eq!(detect_scheme(&["O", "B-PER", "I-PER"]), Scheme::Bio);
        assert_eq!(detect_scheme(&["O", "B-PER", "E-PER", "S-LOC"]), Scheme::Bioes);
    }

    #[test]
    fn bio_transitions() {
        let s = Scheme::Bio;
        assert!(is_valid_transition(tag("B-PER"), tag("I-PER"), s));
        assert!(is_valid_transition(tag("I-PER"), tag("I-PER"), s));
        assert!(is_valid_transition(tag("B-PER"), tag("O"), s));
        assert!(is_valid_transition(tag("I-PER"), tag("B-PER"), s));
        assert!(!is_valid_transition(tag("O"), tag("I-PER"), s));
        assert!(!is_valid_transition(tag("B-PER"), tag("I-LOC"), s));
    }

    #[test]
    fn bioes_transitions() {
        let s = Scheme::Bioes;
        assert!(is_valid_transition(tag("B-PER"), tag("E-PER"), s));
        assert!(is_valid_transition(tag("E-PER"), tag("S-LOC"), s));
        assert!(!is_valid_transition(tag("B-PER"), tag("O"), s));
        assert!(!is_valid_transition(tag("I-PER"), tag("B-LOC"), s));
        assert!(!is_valid_transition(tag("S-PER"), tag("E-PER"), s));
    }

    #[test]
    fn boundaries() {
        assert!(is_valid_start(tag("B-PER")));
        assert!(!is_valid_start(tag("I-PER")));
        assert!(is_valid_end(tag("I-PER"), Scheme::Bio));
        assert!(!is_valid_end(tag("I-PER"), Scheme::Bioes));
        assert!(is_valid_end(tag("E-PER"), Scheme::Bioes));
    }

    #[test]
    fn plain_labels_are_unconstrained() {
        assert!(is_valid_transition(tag("NOUN"), tag("VERB"), Scheme::Bio));
        assert!(is_valid_start(tag("DET")));
    }
}

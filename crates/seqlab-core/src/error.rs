use thiserror::Error;

/// Errors that can occur during seqlab core operations.
#[derive(Debug, Error)]
pub enum SeqlabError {
    /// A dataset file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A dataset line did not match the expected layout.
    #[error("malformed data at {path}:{line}: {reason}")]
    MalformedData {
        /// Path of the offending file.
        path: String,
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// A JSON document (dataset or checkpoint metadata) failed to parse.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A label or token has no entry in the vocabulary.
    #[error("unknown {kind} {token:?}")]
    UnknownToken {
        /// Which vocabulary was consulted ("label", "word", ...).
        kind: &'static str,
        /// The missing token.
        token: String,
    },

    /// A required special token is missing from a vocabulary.
    #[error("vocabulary has no {0} entry")]
    MissingSpecial(&'static str),

    /// The model weights could not be loaded.
    #[error("failed to load model: {0}")]
    ModelLoadError(String),

    /// Model hyperparameters are inconsistent.
    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),

    /// A decoder received inputs of the wrong shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// Candle ML framework error.
    #[error("ML framework error: {0}")]
    CandleError(String),
}

impl From<candle_core::Error> for SeqlabError {
    fn from(err: candle_core::Error) -> Self {
        SeqlabError::CandleError(err.to_string())
    }
}

/// Result type alias for seqlab operations.
pub type Result<T> = std::result::Result<T, SeqlabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = SeqlabError::MissingSpecial("[UNK]");
        assert_eq!(err.to_string(), "vocabulary has no [UNK] entry");

        let err = SeqlabError::MalformedData {
            path: "train.txt".into(),
            line: 7,
            reason: "missing label".into(),
        };
        assert_eq!(
            err.to_string(),
            "malformed data at train.txt:7: missing label"
        );
    }

    #[test]
    fn candle_errors_convert() {
        let err: SeqlabError = candle_core::Error::Msg("boom".into()).into();
        assert!(matches!(err, SeqlabError::CandleError(ref m) if m.contains("boom")));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SeqlabError>();
    }
}

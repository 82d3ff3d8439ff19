use thiserror::Error;

/// All errors produced by sotto-core.
#[derive(Debug, Error)]
pub enum SottoError {
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("decoding failed — every temperature attempt was exhausted without a result")]
    DecodingFailed,

    #[error("logits decode failed: {0}")]
    InvalidPrediction(String),

    #[error("invalid decoding options: {0}")]
    InvalidOptions(String),

    #[error("transcription cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SottoError {
    /// Cancellation is cooperative and not an application-level failure;
    /// callers often branch on it.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SottoError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, SottoError>;

//! Error types for cantus.

use std::fmt;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
///
/// The first four variants form the generation error taxonomy:
///
/// - [`Error::InvalidInput`] — rejected before any model invocation
/// - [`Error::Checkpoint`] — fatal at load time, nothing usable was built
/// - [`Error::Numerical`] — fatal mid-run, partial output is discarded
/// - [`Error::Cancelled`] — terminal but not a failure
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad caller input: empty lyrics/tags, out-of-range sampling parameters.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Checkpoint loading error (missing files, shape mismatch).
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// Non-finite logits or latents produced by a forward pass.
    ///
    /// Never substituted with fallback values — that would mask model or
    /// configuration bugs.
    #[error("numerical: {0}")]
    Numerical(String),

    /// Generation was cancelled by the caller.
    #[error("generation cancelled")]
    Cancelled,

    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer: {0}")]
    Tokenizer(TokenizerError),

    /// Audio processing error (WAV I/O, chunk assembly).
    #[error("audio: {0}")]
    Audio(String),

    /// Generation manager error (queue shut down, worker panicked).
    #[error("manager: {0}")]
    Manager(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wrapper for tokenizer errors (tokenizers::Error doesn't impl std::error::Error).
#[derive(Debug)]
pub struct TokenizerError(pub String);

impl fmt::Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<tokenizers::Error> for Error {
    fn from(error: tokenizers::Error) -> Self {
        Error::Tokenizer(TokenizerError(error.to_string()))
    }
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::Audio(error.to_string())
    }
}

impl Error {
    /// True if this error means the run was cancelled rather than failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

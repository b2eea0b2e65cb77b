//! Error types for crash-diffusion.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// An argument outside the accepted domain (step count, eta, shapes).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// Training data could not be loaded or batched.
    #[error("dataset: {0}")]
    Dataset(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

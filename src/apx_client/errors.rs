use crate::errors::{RestError, StreamError};

/// Result type used by [`ApxClient`](super::ApxClient).
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned while building the client or starting the mirror.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// REST transport construction or request failure.
    #[error("rest error: {0}")]
    Rest(#[from] RestError),
    /// Stream endpoint could not be parsed.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),
    /// Configuration validation failure raised by a builder.
    #[error("invalid config: {field}: {why}")]
    InvalidConfig {
        field: &'static str,
        why: &'static str,
    },
    #[error(transparent)]
    Config(#[from] anyhow::Error),
}

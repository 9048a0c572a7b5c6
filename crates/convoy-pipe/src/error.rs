//! Error types for the pipe.

/// Errors that can occur in pipe transports.
#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    /// The channel or connection has shut down.
    #[error("pipe closed")]
    Closed,

    /// A key failed to decode or load.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A frame or hello failed to encode or decode.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    /// Underlying socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

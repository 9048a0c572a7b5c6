//! Error types for the shared model.

/// Errors raised by model types.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// A topic name is empty or contains the reserved separator.
    #[error("invalid topic name: {0:?}")]
    InvalidTopic(String),

    /// A wire message failed to encode or decode.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

/// Errors raised by the archive codec.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The archive bytes or source directory could not be read.
    #[error("unreadable archive: {0}")]
    Unreadable(String),

    /// An entry would extract outside the destination directory.
    #[error("path escapes destination: {0}")]
    PathEscape(String),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

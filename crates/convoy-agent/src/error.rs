//! Error types for the agent.

/// Errors raised by the agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Artifact staging failed.
    #[error("artifact staging failed: {0}")]
    Staging(String),

    /// The pipe connection dropped.
    #[error("pipe error: {0}")]
    Pipe(#[from] convoy_pipe::PipeError),

    /// A wire envelope failed to encode or decode.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    /// Underlying I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

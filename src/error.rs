use audio_stream_lib::StreamError;
use thiserror::Error;

/// Main error type for the server binary
#[derive(Error, Debug)]
pub enum ServerError {
    /// Streaming core error
    #[error(transparent)]
    Library(#[from] StreamError),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ServerError>;

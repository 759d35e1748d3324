use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the streaming core
#[derive(Error, Debug)]
pub enum StreamError {
    /// A media file or transcoding rule record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The original media file could not be opened for raw streaming
    #[error("Invalid source {}: {source}", path.display())]
    InvalidSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The encoder failed to launch, exited unsuccessfully or its output broke
    #[error("Transcoding failed: {0}")]
    Generation(String),

    /// The transcoding cache could not write or read its backing storage
    #[error("Cache storage error: {0}")]
    Storage(String),

    /// Invalid cache or encoder configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    /// Whether the error is a missing record, as opposed to a processing failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, StreamError::NotFound(_))
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, StreamError>;

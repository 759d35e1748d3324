//! Media library loading
//!
//! The library scanner is a separate tool; the server only reads the JSON
//! index it produces.

use audio_stream_lib::MemoryMediaRepository;
use std::path::Path;

use crate::error::{Result, ServerError};

/// Load the media index at `path`, or an empty library when none is configured.
pub fn load_library(path: Option<&Path>) -> Result<MemoryMediaRepository> {
    let Some(path) = path else {
        tracing::warn!("No media library configured");
        return Ok(MemoryMediaRepository::new());
    };

    let content = std::fs::read_to_string(path).map_err(|e| {
        ServerError::Config(format!("reading media library {}: {}", path.display(), e))
    })?;
    let library = MemoryMediaRepository::from_json(&content)?;
    tracing::info!(path = %path.display(), files = library.len(), "Media library loaded");
    Ok(library)
}

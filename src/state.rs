//! Application state management
//!
//! This module defines the AppState structure that holds:
//! - Server configuration
//! - The media library
//! - The transcoding cache, shared by every request
//! - The media streamer

use audio_stream_lib::{
    CacheStats, MediaStreamer, MemoryMediaRepository, MemoryTranscodingRepository,
    ProcessTranscoder, TranscodeGenerator, TranscodingCache,
};
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::library::load_library;

/// Name of the transcoding cache in logs
const CACHE_NAME: &str = "transcoding";

/// Application state
pub struct AppState {
    /// Server configuration
    pub config: ServerConfig,

    pub media: Arc<MemoryMediaRepository>,

    pub streamer: MediaStreamer,
}

impl AppState {
    /// Build the state from configuration. The cache is created once here
    /// and handed to the streamer.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let media = Arc::new(load_library(config.library_path.as_deref())?);
        let transcodings = Arc::new(MemoryTranscodingRepository::new(
            config.transcodings.iter().cloned(),
        ));
        let transcoder = ProcessTranscoder::with_encoder_path(config.transcoding.encoder_path.clone());

        let generator = Arc::new(TranscodeGenerator::new(
            transcodings.clone(),
            Arc::new(transcoder),
        ));
        let cache = TranscodingCache::new(CACHE_NAME, config.cache.to_cache_config(), generator)?;

        let streamer = MediaStreamer::new(media.clone(), transcodings, cache)
            .with_default_downsampling_format(
                config.transcoding.default_downsampling_format.clone(),
            );

        Ok(Self {
            config,
            media,
            streamer,
        })
    }

    /// Get cache statistics
    pub fn cache_stats(&self) -> CacheStats {
        self.streamer.cache().stats()
    }
}

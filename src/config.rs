//! Server configuration

use audio_stream_lib::Transcoding;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Transcoding cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory for cached transcoded files
    pub dir: PathBuf,

    /// Maximum total size in megabytes; 0 disables the cache
    pub max_size_mb: u64,

    /// Maximum number of cached files; 0 means no limit
    pub max_items: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cache/transcoding"),
            max_size_mb: 100,
            max_items: 0,
        }
    }
}

impl CacheConfig {
    /// Get maximum size in bytes
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }

    pub fn to_cache_config(&self) -> audio_stream_lib::CacheConfig {
        audio_stream_lib::CacheConfig {
            dir: self.dir.clone(),
            max_size: self.max_size_bytes(),
            max_items: self.max_items,
        }
    }
}

/// Encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodingConfig {
    /// Format used when a client only asks for a lower bitrate
    pub default_downsampling_format: Option<String>,

    /// Encoder binary replacing `ffmpeg` in rule commands
    pub encoder_path: Option<PathBuf>,
}

impl Default for TranscodingConfig {
    fn default() -> Self {
        Self {
            default_downsampling_format: Some("opus".to_string()),
            encoder_path: None,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Cache configuration
    pub cache: CacheConfig,

    /// Encoder configuration
    pub transcoding: TranscodingConfig,

    /// JSON media index to load at startup
    pub library_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log output format (pretty, json)
    pub log_format: String,

    /// Transcoding rules
    pub transcodings: Vec<Transcoding>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            transcoding: TranscodingConfig::default(),
            library_path: None,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            transcodings: Transcoding::defaults(),
        }
    }
}

impl ServerConfig {
    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

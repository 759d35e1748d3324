//! Configuration file support
//!
//! Loads server configuration from TOML files. Every section is optional;
//! missing values fall back to the defaults of [`ServerConfig`].

use audio_stream_lib::Transcoding;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::{CacheConfig, ServerConfig, TranscodingConfig};
use crate::error::{Result, ServerError};

/// Configuration file format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Cache settings
    pub cache: Option<CacheSettings>,
    /// Encoder settings
    pub transcoding: Option<TranscodingSettings>,
    /// Media library settings
    pub library: Option<LibrarySettings>,
    /// Logging settings
    pub logging: Option<LoggingSettings>,
    /// Transcoding rules; the built-in rules are used when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transcodings: Vec<Transcoding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Cache directory
    pub dir: Option<PathBuf>,
    /// Maximum cache size in MB, 0 to disable caching
    pub max_size_mb: Option<u64>,
    /// Maximum number of cached files, 0 for no limit
    pub max_items: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodingSettings {
    /// Format used for bitrate-only requests; empty to disable
    pub default_downsampling_format: Option<String>,
    /// Path of the encoder binary
    pub encoder_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibrarySettings {
    /// JSON media index
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: Option<String>,
}

impl ConfigFile {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| ServerError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ServerError::Config(e.to_string()))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Generate default configuration file
    pub fn default_config() -> Self {
        let defaults = ServerConfig::default();
        Self {
            cache: Some(CacheSettings {
                dir: Some(defaults.cache.dir),
                max_size_mb: Some(defaults.cache.max_size_mb),
                max_items: Some(defaults.cache.max_items),
            }),
            transcoding: Some(TranscodingSettings {
                default_downsampling_format: defaults.transcoding.default_downsampling_format,
                encoder_path: None,
            }),
            library: Some(LibrarySettings {
                path: PathBuf::from("library.json"),
            }),
            logging: Some(LoggingSettings {
                level: defaults.log_level,
                format: Some(defaults.log_format),
            }),
            transcodings: defaults.transcodings,
        }
    }

    /// Convert to ServerConfig
    pub fn into_server_config(self) -> ServerConfig {
        let defaults = ServerConfig::default();

        let cache = match self.cache {
            Some(c) => CacheConfig {
                dir: c.dir.unwrap_or(defaults.cache.dir),
                max_size_mb: c.max_size_mb.unwrap_or(defaults.cache.max_size_mb),
                max_items: c.max_items.unwrap_or(defaults.cache.max_items),
            },
            None => defaults.cache,
        };

        let transcoding = match self.transcoding {
            Some(t) => TranscodingConfig {
                default_downsampling_format: t
                    .default_downsampling_format
                    .or(defaults.transcoding.default_downsampling_format)
                    .filter(|f| !f.is_empty()),
                encoder_path: t.encoder_path,
            },
            None => defaults.transcoding,
        };

        let (log_level, log_format) = match self.logging {
            Some(l) => (l.level, l.format.unwrap_or(defaults.log_format)),
            None => (defaults.log_level, defaults.log_format),
        };

        ServerConfig {
            cache,
            transcoding,
            library_path: self.library.map(|l| l.path),
            log_level,
            log_format,
            transcodings: if self.transcodings.is_empty() {
                defaults.transcodings
            } else {
                self.transcodings
            },
        }
    }
}

/// Generate default configuration file at the specified path
pub fn generate_default_config<P: AsRef<Path>>(path: P) -> Result<()> {
    ConfigFile::default_config().to_file(path)
}

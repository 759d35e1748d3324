use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Format name meaning "serve the original bytes"
pub const RAW_FORMAT: &str = "raw";

/// A media file as known to the library database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFile {
    pub id: String,
    pub path: PathBuf,
    /// Original container format, e.g. "flac"
    pub suffix: String,
    /// Original bitrate in kbps
    pub bit_rate: u32,
    /// Duration in seconds
    pub duration: f32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    /// Last metadata update. Part of the cache key.
    pub updated_at: DateTime<Utc>,
}

/// A transcoding rule: how to produce `target_format` with an external encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcoding {
    pub name: String,
    pub target_format: String,
    /// Default bitrate in kbps
    pub default_bit_rate: u32,
    /// Encoder command line. `%s` is replaced by the source path and `%b`
    /// by the bitrate in kbps.
    pub command: String,
}

impl Transcoding {
    /// Built-in rules used when no rules are configured
    pub fn defaults() -> Vec<Transcoding> {
        vec![
            Transcoding {
                name: "mp3 audio".to_string(),
                target_format: "mp3".to_string(),
                default_bit_rate: 192,
                command: "ffmpeg -i %s -map 0:a:0 -b:a %bk -v 0 -f mp3 -".to_string(),
            },
            Transcoding {
                name: "opus audio".to_string(),
                target_format: "opus".to_string(),
                default_bit_rate: 128,
                command: "ffmpeg -i %s -map 0:a:0 -b:a %bk -v 0 -c:a libopus -f opus -"
                    .to_string(),
            },
            Transcoding {
                name: "aac audio".to_string(),
                target_format: "aac".to_string(),
                default_bit_rate: 256,
                command: "ffmpeg -i %s -map 0:a:0 -b:a %bk -v 0 -c:a aac -f adts -".to_string(),
            },
        ]
    }
}

/// Transcoding preference attached to the calling client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodingProfile {
    pub target_format: String,
    pub default_bit_rate: u32,
}

/// Device the request comes from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerProfile {
    pub name: String,
    /// Maximum bitrate in kbps. 0 leaves the bitrate to the transcoding rule
    pub max_bit_rate: u32,
}

/// Parameters of one stream request
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    /// Requested format; empty for "no preference", `raw` for the original
    pub format: String,
    /// Requested bitrate in kbps; 0 for "no preference"
    pub bit_rate: u32,
    pub profile: Option<TranscodingProfile>,
    pub player: Option<PlayerProfile>,
    /// User name, only used for the request log record
    pub user: Option<String>,
}

impl StreamRequest {
    pub fn new(format: impl Into<String>, bit_rate: u32) -> Self {
        Self {
            format: format.into(),
            bit_rate,
            ..Default::default()
        }
    }

    pub fn with_profile(mut self, profile: TranscodingProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_player(mut self, player: PlayerProfile) -> Self {
        self.player = Some(player);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

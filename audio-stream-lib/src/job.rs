//! Transcode jobs and their cache keys

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

use crate::types::MediaFile;

/// Identity of one cacheable transcoding result.
///
/// The source version is part of the key, so updating a media file's
/// metadata makes every older entry for it unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub file_id: String,
    pub updated_at: DateTime<Utc>,
    pub bit_rate: u32,
    pub format: String,
}

impl JobKey {
    /// Stable, filesystem-safe name of the entry on disk.
    ///
    /// Every component is escaped so that the `.` separators never occur
    /// inside a component, which keeps the mapping injective.
    pub fn storage_name(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            escape_component(&self.file_id),
            self.updated_at.format("%Y%m%dT%H%M%S%9fZ"),
            self.bit_rate,
            escape_component(&self.format),
        )
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_name())
    }
}

/// Alphanumerics and `-` pass through, every other byte becomes `_xx`.
fn escape_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{:02x}", b));
        }
    }
    out
}

/// A unit of transcoding work: one media file version in one format/bitrate.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub media: Arc<MediaFile>,
    pub format: String,
    pub bit_rate: u32,
}

impl TranscodeJob {
    pub fn new(media: Arc<MediaFile>, format: impl Into<String>, bit_rate: u32) -> Self {
        Self {
            media,
            format: format.into(),
            bit_rate,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            file_id: self.media.id.clone(),
            updated_at: self.media.updated_at,
            bit_rate: self.bit_rate,
            format: self.format.clone(),
        }
    }
}

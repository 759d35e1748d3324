//! Stream handles returned to callers

use chrono::{DateTime, Utc};
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

use crate::cache::CachedStream;
use crate::negotiate::Selection;
use crate::types::MediaFile;

/// Content type used when the format has no known MIME type
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

enum Body {
    Raw { file: File, len: Option<u64> },
    Transcoded(CachedStream),
}

/// A readable stream of one media file in the negotiated format.
pub struct Stream {
    media: Arc<MediaFile>,
    format: String,
    bit_rate: u32,
    body: Body,
}

impl Stream {
    /// Original bytes. The format is the file's own suffix.
    pub(crate) fn raw(media: Arc<MediaFile>, file: File, len: Option<u64>) -> Self {
        Self {
            format: media.suffix.clone(),
            bit_rate: media.bit_rate,
            media,
            body: Body::Raw { file, len },
        }
    }

    pub(crate) fn from_cache(media: Arc<MediaFile>, selection: &Selection, body: CachedStream) -> Self {
        Self {
            media,
            format: selection.format.clone(),
            bit_rate: selection.bit_rate,
            body: Body::Transcoded(body),
        }
    }

    pub fn media(&self) -> &MediaFile {
        &self.media
    }

    /// Format actually served
    pub fn format(&self) -> &str {
        &self.format
    }

    /// Bitrate actually served, in kbps
    pub fn bit_rate(&self) -> u32 {
        self.bit_rate
    }

    /// Whether the content came from a completed cache entry
    pub fn cached(&self) -> bool {
        matches!(&self.body, Body::Transcoded(s) if s.cached())
    }

    pub fn transcoded(&self) -> bool {
        matches!(self.body, Body::Transcoded(_))
    }

    /// Raw files and completed cache entries can seek; live encoder output
    /// cannot.
    pub fn seekable(&self) -> bool {
        match &self.body {
            Body::Raw { .. } => true,
            Body::Transcoded(s) => s.seekable(),
        }
    }

    pub fn content_type(&self) -> String {
        mime_guess::from_ext(&self.format)
            .first_raw()
            .unwrap_or(FALLBACK_CONTENT_TYPE)
            .to_string()
    }

    /// Display name: `<title>.<format>`
    pub fn name(&self) -> String {
        format!("{}.{}", self.media.title, self.format)
    }

    pub fn mod_time(&self) -> DateTime<Utc> {
        self.media.updated_at
    }

    /// Duration in seconds
    pub fn duration(&self) -> f32 {
        self.media.duration
    }

    /// Size estimate from duration and bitrate, for clients that need a
    /// length before the output is complete.
    pub fn estimated_content_length(&self) -> u64 {
        (self.media.duration * self.bit_rate as f32 / 8.0 * 1024.0) as u64
    }

    /// Exact length when known: raw files and completed cache entries.
    pub fn content_length(&self) -> Option<u64> {
        match &self.body {
            Body::Raw { len, .. } => *len,
            Body::Transcoded(s) => s.len(),
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().body {
            Body::Raw { file, .. } => Pin::new(file).poll_read(cx, buf),
            Body::Transcoded(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncSeek for Stream {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        match &mut self.get_mut().body {
            Body::Raw { file, .. } => Pin::new(file).start_seek(position),
            Body::Transcoded(s) => Pin::new(s).start_seek(position),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        match &mut self.get_mut().body {
            Body::Raw { file, .. } => Pin::new(file).poll_complete(cx),
            Body::Transcoded(s) => Pin::new(s).poll_complete(cx),
        }
    }
}

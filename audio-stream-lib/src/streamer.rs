//! Entry point for stream requests
//!
//! Ties negotiation, the transcoding cache and raw file access together.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cache::{Generator, TranscodingCache};
use crate::error::{Result, StreamError};
use crate::job::TranscodeJob;
use crate::negotiate::{select_transcoding_options, Selection};
use crate::repository::{MediaFileRepository, TranscodingRepository};
use crate::stream::Stream;
use crate::transcode::{ByteStream, Transcoder};
use crate::types::{MediaFile, StreamRequest};

/// Cache generator that runs the transcoding rule for the job's format.
pub struct TranscodeGenerator {
    transcodings: Arc<dyn TranscodingRepository>,
    transcoder: Arc<dyn Transcoder>,
}

impl TranscodeGenerator {
    pub fn new(
        transcodings: Arc<dyn TranscodingRepository>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self {
            transcodings,
            transcoder,
        }
    }
}

impl Generator for TranscodeGenerator {
    fn generate(&self, job: &TranscodeJob, cancel: CancellationToken) -> Result<ByteStream> {
        let rule = self.transcodings.find_by_format(&job.format).map_err(|e| {
            tracing::error!(format = %job.format, error = %e, "Error loading transcoding command");
            StreamError::Generation(format!("no transcoding command for '{}': {}", job.format, e))
        })?;

        self.transcoder
            .start(&rule.command, &job.media.path, job.bit_rate, cancel)
            .map_err(|e| {
                tracing::error!(id = %job.media.id, path = %job.media.path.display(), error = %e, "Error starting transcoder");
                e
            })
    }
}

/// Serves media files, transcoding and caching them as negotiated.
pub struct MediaStreamer {
    media: Arc<dyn MediaFileRepository>,
    transcodings: Arc<dyn TranscodingRepository>,
    cache: TranscodingCache,
    default_downsampling_format: Option<String>,
}

impl MediaStreamer {
    /// `cache` is expected to generate with a [`TranscodeGenerator`] over the
    /// same rule store.
    pub fn new(
        media: Arc<dyn MediaFileRepository>,
        transcodings: Arc<dyn TranscodingRepository>,
        cache: TranscodingCache,
    ) -> Self {
        Self {
            media,
            transcodings,
            cache,
            default_downsampling_format: None,
        }
    }

    /// Format used when a client only asks for a lower bitrate
    pub fn with_default_downsampling_format(mut self, format: Option<String>) -> Self {
        self.default_downsampling_format = format.filter(|f| !f.is_empty());
        self
    }

    pub fn cache(&self) -> &TranscodingCache {
        &self.cache
    }

    /// Look up a media file by id and stream it.
    pub async fn new_stream(&self, id: &str, request: &StreamRequest) -> Result<Stream> {
        let mf = self.media.get(id)?;
        self.do_stream(Arc::new(mf), request).await
    }

    /// Stream an already loaded media file.
    pub async fn do_stream(&self, mf: Arc<MediaFile>, request: &StreamRequest) -> Result<Stream> {
        let selection = select_transcoding_options(
            self.transcodings.as_ref(),
            &mf,
            request,
            self.default_downsampling_format.as_deref(),
        );

        let result = self.open(Arc::clone(&mf), &selection).await;

        let cached = result.as_ref().map(|s| s.cached()).unwrap_or(false);
        tracing::info!(
            title = %mf.title,
            artist = %mf.artist,
            format = %selection.format,
            bit_rate = selection.bit_rate,
            cached,
            transcoding = !selection.is_raw(),
            user = request.user.as_deref().unwrap_or(""),
            original_format = %mf.suffix,
            original_bit_rate = mf.bit_rate,
            "Streaming file"
        );

        result
    }

    async fn open(&self, mf: Arc<MediaFile>, selection: &Selection) -> Result<Stream> {
        if selection.is_raw() {
            tracing::debug!(id = %mf.id, path = %mf.path.display(), "Streaming raw file");
            let file = tokio::fs::File::open(&mf.path)
                .await
                .map_err(|source| StreamError::InvalidSource {
                    path: mf.path.clone(),
                    source,
                })?;
            let len = file.metadata().await.ok().map(|m| m.len());
            return Ok(Stream::raw(mf, file, len));
        }

        let job = TranscodeJob::new(Arc::clone(&mf), selection.format.clone(), selection.bit_rate);
        let body = self.cache.get(&job).await.map_err(|e| {
            tracing::error!(id = %mf.id, key = %job.key(), error = %e, "Error accessing transcoding cache");
            e
        })?;
        Ok(Stream::from_cache(mf, selection, body))
    }
}

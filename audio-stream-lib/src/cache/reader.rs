//! Readers handed out by the transcoding cache

use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::Stream;
use tokio_util::sync::DropGuard;

use super::generation::{GenState, Interest, Progress};
use super::Inner;
use crate::transcode::ByteStream;

/// Keeps an entry out of eviction while a reader holds it
pub(crate) struct Lease {
    inner: Arc<Inner>,
    name: String,
}

impl Lease {
    pub fn new(inner: Arc<Inner>, name: &str) -> Self {
        Self {
            inner,
            name: name.to_string(),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.inner.index.lock().release(&self.name);
        // Evictions skipped because of this reader happen now
        self.inner.enforce_limits();
    }
}

/// Follows a part file while the producer is still appending to it.
///
/// Never reads past the length the producer has published, and only reports
/// end of stream once the generation completed.
pub(crate) struct GrowingReader {
    file: File,
    pos: u64,
    state: GenState,
    updates: WatchStream<GenState>,
    _interest: Interest,
}

impl GrowingReader {
    pub fn new(file: File, updates: watch::Receiver<GenState>, interest: Interest) -> Self {
        let state = updates.borrow().clone();
        Self {
            file,
            pos: 0,
            state,
            updates: WatchStream::new(updates),
            _interest: interest,
        }
    }
}

impl AsyncRead for GrowingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        let mut producer_gone = false;
        loop {
            match Pin::new(&mut this.updates).poll_next(cx) {
                Poll::Ready(Some(state)) => this.state = state,
                Poll::Ready(None) => {
                    producer_gone = true;
                    break;
                }
                Poll::Pending => break,
            }
        }

        if this.pos < this.state.written {
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            let available = (this.state.written - this.pos).min(buf.remaining() as u64) as usize;
            let mut limited = buf.take(available);
            ready!(Pin::new(&mut this.file).poll_read(cx, &mut limited))?;
            let n = limited.filled().len();
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "cache file is shorter than its published length",
                )));
            }
            // SAFETY: `limited` only fills bytes of `buf`'s unfilled region
            unsafe { buf.assume_init(n) };
            buf.advance(n);
            this.pos += n as u64;
            return Poll::Ready(Ok(()));
        }

        match &this.state.progress {
            Progress::Complete => Poll::Ready(Ok(())),
            Progress::Failed(failure) => Poll::Ready(Err(failure.to_io_error())),
            Progress::Running if producer_gone => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                "transcoding stopped unexpectedly",
            ))),
            // Woken by the next update
            Progress::Running => Poll::Pending,
        }
    }
}

enum Body {
    Ready(File),
    Growing(GrowingReader),
    Direct {
        source: ByteStream,
        _cancel: DropGuard,
    },
}

/// Byte stream returned by [`TranscodingCache::get`](super::TranscodingCache::get).
///
/// Ready entries are plain files and support seeking. Entries still being
/// produced, and output of a disabled cache, are forward-only.
pub struct CachedStream {
    body: Body,
    cached: bool,
    len: Option<u64>,
    // Released after the body is closed
    _lease: Option<Lease>,
}

impl CachedStream {
    pub(crate) fn ready(file: File, len: u64, lease: Lease) -> Self {
        Self {
            body: Body::Ready(file),
            cached: true,
            len: Some(len),
            _lease: Some(lease),
        }
    }

    pub(crate) fn growing(reader: GrowingReader, lease: Lease) -> Self {
        Self {
            body: Body::Growing(reader),
            cached: false,
            len: None,
            _lease: Some(lease),
        }
    }

    pub(crate) fn direct(source: ByteStream, cancel: DropGuard) -> Self {
        Self {
            body: Body::Direct {
                source,
                _cancel: cancel,
            },
            cached: false,
            len: None,
            _lease: None,
        }
    }

    /// True when served from a previously completed entry
    pub fn cached(&self) -> bool {
        self.cached
    }

    pub fn seekable(&self) -> bool {
        matches!(self.body, Body::Ready(_))
    }

    /// Exact length, known for completed entries only
    pub fn len(&self) -> Option<u64> {
        self.len
    }
}

impl AsyncRead for CachedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().body {
            Body::Ready(file) => Pin::new(file).poll_read(cx, buf),
            Body::Growing(reader) => Pin::new(reader).poll_read(cx, buf),
            Body::Direct { source, .. } => source.as_mut().poll_read(cx, buf),
        }
    }
}

impl AsyncSeek for CachedStream {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        match &mut self.get_mut().body {
            Body::Ready(file) => Pin::new(file).start_seek(position),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream is not seekable",
            )),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        match &mut self.get_mut().body {
            Body::Ready(file) => Pin::new(file).poll_complete(cx),
            _ => Poll::Ready(Ok(0)),
        }
    }
}

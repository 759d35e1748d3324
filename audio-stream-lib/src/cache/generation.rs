//! One in-flight transcoding run feeding a cache entry

use bytes::BytesMut;
use parking_lot::Mutex;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::index::EntryMeta;
use super::Inner;
use crate::error::StreamError;
use crate::job::TranscodeJob;

/// Read size when copying encoder output to disk
const CHUNK_SIZE: usize = 64 * 1024;

/// Lifecycle of a generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Progress {
    Running,
    Complete,
    Failed(Failure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Failure {
    Encoder(String),
    Storage(String),
    /// Every reader left before the output was complete
    Cancelled,
}

impl Failure {
    pub fn to_error(&self) -> StreamError {
        match self {
            Failure::Encoder(msg) => StreamError::Generation(msg.clone()),
            Failure::Storage(msg) => StreamError::Storage(msg.clone()),
            Failure::Cancelled => {
                StreamError::Generation("transcoding cancelled: no readers left".to_string())
            }
        }
    }

    pub fn to_io_error(&self) -> io::Error {
        let kind = match self {
            Failure::Cancelled => io::ErrorKind::Interrupted,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self.to_error().to_string())
    }
}

/// Published to readers after every chunk
#[derive(Debug, Clone)]
pub(crate) struct GenState {
    /// Bytes durably written to the part file
    pub written: u64,
    pub progress: Progress,
}

pub(crate) struct Generation {
    pub name: String,
    pub part_path: PathBuf,
    pub final_path: PathBuf,
    state: watch::Sender<GenState>,
    cancel: CancellationToken,
    /// Attached readers; the generation is cancelled when it drops to zero
    interest: Mutex<usize>,
}

impl Generation {
    pub fn new(name: &str, dir: &Path) -> Self {
        let (state, _) = watch::channel(GenState {
            written: 0,
            progress: Progress::Running,
        });
        Self {
            name: name.to_string(),
            part_path: dir.join(format!("{}.{}.part", name, uuid::Uuid::new_v4().simple())),
            final_path: dir.join(name),
            state,
            cancel: CancellationToken::new(),
            interest: Mutex::new(0),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<GenState> {
        self.state.subscribe()
    }

    /// Register a reader. Fails once the generation has been cancelled.
    pub fn try_attach(self: &Arc<Self>) -> Option<Interest> {
        let mut readers = self.interest.lock();
        if self.cancel.is_cancelled() {
            return None;
        }
        *readers += 1;
        Some(Interest {
            generation: Arc::clone(self),
        })
    }

    fn detach(&self) {
        let mut readers = self.interest.lock();
        *readers -= 1;
        if *readers == 0 && self.state.borrow().progress == Progress::Running {
            tracing::debug!(entry = %self.name, "Last reader left, cancelling transcoding");
            self.cancel.cancel();
        }
    }

    /// Whether a new reader should start over instead of joining
    pub fn is_defunct(&self) -> bool {
        self.cancel.is_cancelled()
            || matches!(self.state.borrow().progress, Progress::Failed(_))
    }

    fn publish_written(&self, written: u64) {
        self.state.send_modify(|s| s.written = written);
    }

    fn finish(&self, progress: Progress) {
        self.state.send_modify(|s| s.progress = progress);
    }
}

/// A reader's claim on a running generation
pub(crate) struct Interest {
    generation: Arc<Generation>,
}

impl Drop for Interest {
    fn drop(&mut self) {
        self.generation.detach();
    }
}

/// Drive a generation to completion: copy encoder output into the part file,
/// then promote it to a ready entry or clean it up.
pub(crate) async fn produce(
    inner: Arc<Inner>,
    generation: Arc<Generation>,
    job: TranscodeJob,
    file: std::fs::File,
) {
    let started = std::time::Instant::now();

    match write_output(&inner, &generation, &job, file).await {
        Ok(size) => match tokio::fs::rename(&generation.part_path, &generation.final_path).await {
            Ok(()) => {
                inner.index.lock().insert(
                    generation.name.clone(),
                    EntryMeta {
                        size,
                        path: generation.final_path.clone(),
                    },
                );
                generation.finish(Progress::Complete);
                tracing::info!(
                    cache = %inner.name,
                    entry = %generation.name,
                    size,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Transcoded file cached"
                );
            }
            Err(e) => {
                tracing::error!(entry = %generation.name, error = %e, "Failed to promote cache entry");
                remove_part(&generation.part_path).await;
                generation.finish(Progress::Failed(Failure::Storage(format!(
                    "renaming {}: {}",
                    generation.part_path.display(),
                    e
                ))));
            }
        },
        Err(failure) => {
            match &failure {
                Failure::Cancelled => {
                    tracing::debug!(entry = %generation.name, "Transcoding abandoned")
                }
                other => {
                    tracing::error!(
                        cache = %inner.name,
                        entry = %generation.name,
                        error = %other.to_error(),
                        "Error generating cache entry"
                    )
                }
            }
            remove_part(&generation.part_path).await;
            generation.finish(Progress::Failed(failure));
        }
    }

    inner
        .in_flight
        .remove_if(&generation.name, |_, current| Arc::ptr_eq(current, &generation));
    inner.enforce_limits();
}

async fn write_output(
    inner: &Inner,
    generation: &Generation,
    job: &TranscodeJob,
    file: std::fs::File,
) -> Result<u64, Failure> {
    let cancel = generation.cancel.clone();
    // A child token: the encoder output cancels its token when dropped,
    // which must not read as "abandoned" on the generation itself
    let mut source = inner
        .generator
        .generate(job, cancel.child_token())
        .map_err(|e| Failure::Encoder(e.to_string()))?;

    let mut out = tokio::fs::File::from_std(file);
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
    let mut written = 0u64;

    loop {
        buf.clear();
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Failure::Cancelled),
            read = source.read_buf(&mut buf) => read.map_err(|e| {
                if cancel.is_cancelled() {
                    Failure::Cancelled
                } else {
                    Failure::Encoder(e.to_string())
                }
            })?,
        };
        if n == 0 {
            break;
        }

        let storage = |e: io::Error| {
            Failure::Storage(format!("writing {}: {}", generation.part_path.display(), e))
        };
        out.write_all(&buf).await.map_err(storage)?;
        out.flush().await.map_err(storage)?;

        written += n as u64;
        generation.publish_written(written);
    }

    Ok(written)
}

async fn remove_part(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial cache file");
        }
    }
}

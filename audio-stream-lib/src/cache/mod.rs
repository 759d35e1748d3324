//! Disk-backed cache of transcoded files
//!
//! Each entry holds the complete encoder output for one [`JobKey`]. The cache
//! provides:
//! - Single-flight generation: concurrent requests for the same key share
//!   one encoder run and read its output while it is being written
//! - Size and item limits with LRU eviction that never removes an entry
//!   somebody is reading
//! - Cleanup of failed and abandoned generations
//! - Recovery of completed entries after a restart
//!
//! Output is first written to a uniquely named `.part` file and renamed into
//! place once the encoder finished successfully, so a file with an entry
//! name is always complete.

mod generation;
mod index;
mod reader;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StreamError};
use crate::job::{JobKey, TranscodeJob};
use crate::transcode::ByteStream;
use generation::{Generation, Interest, Progress};
use index::{CacheIndex, EntryMeta};
use reader::{GrowingReader, Lease};

pub use reader::CachedStream;

/// Suffix of files that are still being written
const PART_SUFFIX: &str = ".part";

/// Produces the bytes of a cache entry on a miss.
pub trait Generator: Send + Sync + 'static {
    /// Start producing the output of `job`. Cancelling `cancel` must stop
    /// the work; the stream then fails or ends early.
    fn generate(&self, job: &TranscodeJob, cancel: CancellationToken) -> Result<ByteStream>;
}

impl<F> Generator for F
where
    F: Fn(&TranscodeJob, CancellationToken) -> Result<ByteStream> + Send + Sync + 'static,
{
    fn generate(&self, job: &TranscodeJob, cancel: CancellationToken) -> Result<ByteStream> {
        self(job, cancel)
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the cache files
    pub dir: PathBuf,
    /// Maximum total size in bytes; 0 disables caching entirely
    pub max_size: u64,
    /// Maximum number of entries; 0 means no limit
    pub max_items: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cache/transcoding"),
            max_size: 100 * 1024 * 1024,
            max_items: 0,
        }
    }
}

impl CacheConfig {
    pub fn is_enabled(&self) -> bool {
        self.max_size > 0
    }
}

/// Cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_size_bytes: u64,
    pub max_size_bytes: u64,
    pub in_flight: usize,
    pub hits: u64,
    pub misses: u64,
}

pub(crate) struct Inner {
    name: String,
    config: CacheConfig,
    generator: Arc<dyn Generator>,
    index: Mutex<CacheIndex>,
    in_flight: DashMap<String, Arc<Generation>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Inner {
    /// Remove entries over the limits and delete their files.
    ///
    /// The index is updated right away. Files are deleted on the blocking
    /// pool when called from within a runtime.
    fn enforce_limits(self: &Arc<Self>) {
        let evicted = self.index.lock().evict();
        if evicted.is_empty() {
            return;
        }
        for (name, meta) in &evicted {
            tracing::debug!(cache = %self.name, entry = %name, size = meta.size, "Evicting cache entry");
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn_blocking(move || inner.remove_evicted(evicted));
            }
            Err(_) => self.remove_evicted(evicted),
        }
    }

    fn remove_evicted(&self, evicted: Vec<(String, EntryMeta)>) {
        for (name, meta) in evicted {
            // The key may have been generated again in the meantime
            if self.index.lock().contains(&name) {
                continue;
            }
            if let Err(e) = std::fs::remove_file(&meta.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %meta.path.display(), error = %e, "Failed to delete evicted cache file");
                }
            }
        }
    }

    /// Lease a ready entry, marking it most recently used.
    fn lease_ready(self: &Arc<Self>, name: &str) -> Option<(Lease, EntryMeta)> {
        let mut index = self.index.lock();
        let meta = index.get(name)?.clone();
        index.acquire(name);
        drop(index);
        Some((Lease::new(Arc::clone(self), name), meta))
    }

    fn lease(self: &Arc<Self>, name: &str) -> Lease {
        self.index.lock().acquire(name);
        Lease::new(Arc::clone(self), name)
    }

    fn start_generation(self: &Arc<Self>, name: &str, job: &TranscodeJob) -> Result<Arc<Generation>> {
        let generation = Arc::new(Generation::new(name, &self.config.dir));
        let file = std::fs::File::create(&generation.part_path).map_err(|e| {
            tracing::error!(path = %generation.part_path.display(), error = %e, "Failed to create cache file");
            StreamError::Storage(format!("creating {}: {}", generation.part_path.display(), e))
        })?;

        tracing::debug!(cache = %self.name, entry = %name, "Starting transcoding for cache entry");
        tokio::spawn(generation::produce(
            Arc::clone(self),
            Arc::clone(&generation),
            job.clone(),
            file,
        ));
        Ok(generation)
    }
}

enum Lookup {
    Ready(Lease, EntryMeta),
    InFlight {
        generation: Arc<Generation>,
        interest: Interest,
        lease: Lease,
    },
}

/// Disk cache of transcoded files with single-flight generation.
///
/// Cheap to clone; clones share the same entries.
#[derive(Clone)]
pub struct TranscodingCache {
    inner: Arc<Inner>,
}

impl TranscodingCache {
    /// Open the cache, picking up entries completed by a previous run.
    pub fn new(
        name: impl Into<String>,
        config: CacheConfig,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        let name = name.into();
        let mut index = CacheIndex::new(config.max_size, config.max_items);

        if config.is_enabled() {
            std::fs::create_dir_all(&config.dir).map_err(|e| {
                StreamError::Storage(format!("creating {}: {}", config.dir.display(), e))
            })?;
            restore(&config.dir, &mut index)?;
        }

        tracing::info!(
            cache = %name,
            dir = %config.dir.display(),
            enabled = config.is_enabled(),
            entries = index.len(),
            size = index.total_bytes(),
            "Transcoding cache ready"
        );

        let cache = Self {
            inner: Arc::new(Inner {
                name,
                config,
                generator,
                index: Mutex::new(index),
                in_flight: DashMap::new(),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        };
        // Limits may have shrunk since the entries were written
        cache.inner.enforce_limits();
        Ok(cache)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.config.is_enabled()
    }

    pub fn dir(&self) -> &Path {
        &self.inner.config.dir
    }

    /// Whether a completed entry exists for `key`
    pub fn contains(&self, key: &JobKey) -> bool {
        self.inner.index.lock().contains(&key.storage_name())
    }

    /// Return the output of `job`, generating it if needed.
    ///
    /// Returns once the first bytes are available. Concurrent calls for the
    /// same key share a single generation. A failed generation leaves no
    /// entry behind and is retried by the next call.
    pub async fn get(&self, job: &TranscodeJob) -> Result<CachedStream> {
        if !self.is_enabled() {
            return self.get_direct(job);
        }

        let name = job.key().storage_name();
        loop {
            match self.lookup(&name, job)? {
                Lookup::Ready(lease, meta) => match tokio::fs::File::open(&meta.path).await {
                    Ok(file) => {
                        self.inner.hits.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(cache = %self.inner.name, entry = %name, "Cache hit");
                        return Ok(CachedStream::ready(file, meta.size, lease));
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        tracing::warn!(entry = %name, "Cached file disappeared, regenerating");
                        drop(lease);
                        self.inner.index.lock().remove(&name);
                    }
                    Err(e) => {
                        return Err(StreamError::Storage(format!(
                            "opening {}: {}",
                            meta.path.display(),
                            e
                        )))
                    }
                },
                Lookup::InFlight {
                    generation,
                    interest,
                    lease,
                } => {
                    self.inner.misses.fetch_add(1, Ordering::Relaxed);
                    let file = open_output(&generation).await?;

                    let mut updates = generation.subscribe();
                    let state = updates
                        .wait_for(|s| s.written > 0 || s.progress != Progress::Running)
                        .await
                        .map_err(|_| StreamError::Generation("transcoding stopped".to_string()))?
                        .clone();
                    if let Progress::Failed(failure) = &state.progress {
                        return Err(failure.to_error());
                    }

                    let reader = GrowingReader::new(file, updates, interest);
                    return Ok(CachedStream::growing(reader, lease));
                }
            }
        }
    }

    fn lookup(&self, name: &str, job: &TranscodeJob) -> Result<Lookup> {
        if let Some((lease, meta)) = self.inner.lease_ready(name) {
            return Ok(Lookup::Ready(lease, meta));
        }

        // The map entry stays locked until the generation is registered
        let generation = match self.inner.in_flight.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().is_defunct() {
                    if let Some(interest) = occupied.get().try_attach() {
                        let generation = Arc::clone(occupied.get());
                        tracing::debug!(entry = %name, "Joining running transcoding");
                        return Ok(Lookup::InFlight {
                            generation,
                            interest,
                            lease: self.inner.lease(name),
                        });
                    }
                }
                // Finished between the index check and here
                if let Some((lease, meta)) = self.inner.lease_ready(name) {
                    return Ok(Lookup::Ready(lease, meta));
                }
                let generation = self.inner.start_generation(name, job)?;
                occupied.insert(Arc::clone(&generation));
                generation
            }
            Entry::Vacant(vacant) => {
                if let Some((lease, meta)) = self.inner.lease_ready(name) {
                    return Ok(Lookup::Ready(lease, meta));
                }
                let generation = self.inner.start_generation(name, job)?;
                vacant.insert(Arc::clone(&generation));
                generation
            }
        };

        let interest = generation.try_attach().ok_or_else(|| {
            StreamError::Generation("transcoding cancelled before start".to_string())
        })?;
        Ok(Lookup::InFlight {
            generation,
            interest,
            lease: self.inner.lease(name),
        })
    }

    fn get_direct(&self, job: &TranscodeJob) -> Result<CachedStream> {
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let source = self.inner.generator.generate(job, cancel.clone())?;
        Ok(CachedStream::direct(source, cancel.drop_guard()))
    }

    pub fn stats(&self) -> CacheStats {
        // Never hold the index lock while touching the in-flight map
        let in_flight = self.inner.in_flight.len();
        let index = self.inner.index.lock();
        CacheStats {
            entry_count: index.len(),
            total_size_bytes: index.total_bytes(),
            max_size_bytes: self.inner.config.max_size,
            in_flight,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
        }
    }
}

/// Open the output of a generation for reading from the start.
///
/// The part file may already have been renamed or removed if the generation
/// finished in the meantime.
async fn open_output(generation: &Generation) -> Result<tokio::fs::File> {
    match tokio::fs::File::open(&generation.part_path).await {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let mut updates = generation.subscribe();
            let progress = updates
                .wait_for(|s| s.progress != Progress::Running)
                .await
                .map_err(|_| StreamError::Generation("transcoding stopped".to_string()))?
                .progress
                .clone();
            match progress {
                Progress::Failed(failure) => Err(failure.to_error()),
                _ => tokio::fs::File::open(&generation.final_path)
                    .await
                    .map_err(|e| {
                        StreamError::Storage(format!(
                            "opening {}: {}",
                            generation.final_path.display(),
                            e
                        ))
                    }),
            }
        }
        Err(e) => Err(StreamError::Storage(format!(
            "opening {}: {}",
            generation.part_path.display(),
            e
        ))),
    }
}

/// Register completed entries found on disk, oldest first, and delete
/// leftovers of interrupted generations.
fn restore(dir: &Path, index: &mut CacheIndex) -> Result<()> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| StreamError::Storage(format!("reading {}: {}", dir.display(), e)))?;

    let mut found: Vec<(SystemTime, String, EntryMeta)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else { continue };
        if !metadata.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };

        if name.ends_with(PART_SUFFIX) {
            tracing::debug!(path = %path.display(), "Removing incomplete cache file");
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove incomplete cache file");
            }
            continue;
        }

        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((
            modified,
            name,
            EntryMeta {
                size: metadata.len(),
                path,
            },
        ));
    }

    found.sort_by(|a, b| a.0.cmp(&b.0));
    for (_, name, meta) in found {
        index.insert(name, meta);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MediaFile;
    use chrono::{TimeZone, Utc};
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, DuplexStream, ReadBuf};

    fn media(id: &str, version: i64) -> Arc<MediaFile> {
        Arc::new(MediaFile {
            id: id.to_string(),
            path: PathBuf::from(format!("/music/{}.flac", id)),
            suffix: "flac".to_string(),
            bit_rate: 1000,
            duration: 10.0,
            title: id.to_string(),
            artist: String::new(),
            updated_at: Utc.timestamp_opt(1_700_000_000 + version, 0).unwrap(),
        })
    }

    fn job(id: &str) -> TranscodeJob {
        TranscodeJob::new(media(id, 0), "mp3", 192)
    }

    fn config(dir: &Path, max_size: u64, max_items: usize) -> CacheConfig {
        CacheConfig {
            dir: dir.to_path_buf(),
            max_size,
            max_items,
        }
    }

    /// Emits "<id>:<format>:<bitrate>" and counts calls
    fn counting_generator(calls: Arc<AtomicUsize>) -> Arc<dyn Generator> {
        Arc::new(move |job: &TranscodeJob, _cancel: CancellationToken| -> Result<ByteStream> {
            calls.fetch_add(1, Ordering::SeqCst);
            let data = format!("{}:{}:{}", job.media.id, job.format, job.bit_rate).into_bytes();
            Ok(Box::pin(Cursor::new(data)) as ByteStream)
        })
    }

    /// Generator whose output the test writes by hand
    #[derive(Default)]
    struct Manual {
        writers: Mutex<Vec<DuplexStream>>,
        tokens: Mutex<Vec<CancellationToken>>,
    }

    impl Generator for Manual {
        fn generate(&self, _job: &TranscodeJob, cancel: CancellationToken) -> Result<ByteStream> {
            let (reader, writer) = tokio::io::duplex(64 * 1024);
            self.writers.lock().push(writer);
            self.tokens.lock().push(cancel);
            Ok(Box::pin(reader))
        }
    }

    impl Manual {
        async fn wait_for_runs(&self, n: usize) {
            for _ in 0..500 {
                if self.tokens.lock().len() >= n {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("generator was not called {} times", n);
        }

        fn take_writer(&self, i: usize) -> DuplexStream {
            let mut writers = self.writers.lock();
            let (a, _) = tokio::io::duplex(1);
            std::mem::replace(&mut writers[i], a)
        }

        fn token(&self, i: usize) -> CancellationToken {
            self.tokens.lock()[i].clone()
        }
    }

    /// Yields `data` once, then fails like a crashing encoder
    struct Failing {
        data: Option<Vec<u8>>,
    }

    impl AsyncRead for Failing {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.data.take() {
                Some(data) => {
                    buf.put_slice(&data);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Other,
                    "encoder exited with exit status: 1",
                ))),
            }
        }
    }

    async fn read_all(stream: &mut CachedStream) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await?;
        Ok(data)
    }

    async fn wait_idle(cache: &TranscodingCache) {
        for _ in 0..500 {
            if cache.stats().in_flight == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("generation did not finish");
    }

    /// Evicted files are deleted in the background
    async fn wait_for_file_count(dir: &Path, n: usize) {
        for _ in 0..500 {
            if files_in(dir).len() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} files, found {:?}", n, files_in(dir));
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = TranscodingCache::new(
            "test",
            config(dir.path(), 1024, 0),
            counting_generator(calls.clone()),
        )
        .unwrap();

        let mut first = cache.get(&job("a")).await.unwrap();
        assert!(!first.cached());
        assert!(!first.seekable());
        assert_eq!(read_all(&mut first).await.unwrap(), b"a:mp3:192");
        drop(first);

        assert!(cache.contains(&job("a").key()));
        let mut second = cache.get(&job("a")).await.unwrap();
        assert!(second.cached());
        assert!(second.seekable());
        assert_eq!(second.len(), Some(9));
        assert_eq!(read_all(&mut second).await.unwrap(), b"a:mp3:192");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.total_size_bytes, 9);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(files_in(dir.path()), vec![job("a").key().storage_name()]);
    }

    #[tokio::test]
    async fn test_seek_on_ready_entry() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = TranscodingCache::new(
            "test",
            config(dir.path(), 1024, 0),
            counting_generator(calls),
        )
        .unwrap();

        let mut first = cache.get(&job("a")).await.unwrap();
        read_all(&mut first).await.unwrap();
        assert!(first.seek(io::SeekFrom::Start(0)).await.is_err());
        drop(first);

        let mut ready = cache.get(&job("a")).await.unwrap();
        ready.seek(io::SeekFrom::Start(6)).await.unwrap();
        assert_eq!(read_all(&mut ready).await.unwrap(), b"192");
    }

    #[tokio::test]
    async fn test_seek_on_growing_entry_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let manual = Arc::new(Manual::default());
        let cache =
            TranscodingCache::new("test", config(dir.path(), 1 << 20, 0), manual.clone()).unwrap();

        let get = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(&job("a")).await })
        };
        manual.wait_for_runs(1).await;
        let mut writer = manual.take_writer(0);
        writer.write_all(b"partial").await.unwrap();

        let mut stream = get.await.unwrap().unwrap();
        assert!(!stream.seekable());
        let err = stream.seek(io::SeekFrom::Start(2)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);

        writer.write_all(b" output").await.unwrap();
        drop(writer);
        assert_eq!(read_all(&mut stream).await.unwrap(), b"partial output");
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_generation() {
        let dir = tempfile::tempdir().unwrap();
        let manual = Arc::new(Manual::default());
        let cache =
            TranscodingCache::new("test", config(dir.path(), 1 << 20, 0), manual.clone()).unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                let mut stream = cache.get(&job("a")).await.unwrap();
                read_all(&mut stream).await.unwrap()
            }));
        }

        manual.wait_for_runs(1).await;
        let mut writer = manual.take_writer(0);
        writer.write_all(b"first chunk, ").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.write_all(b"second chunk").await.unwrap();
        drop(writer);

        for task in tasks {
            assert_eq!(task.await.unwrap(), b"first chunk, second chunk");
        }
        assert_eq!(manual.tokens.lock().len(), 1);
        assert!(cache.contains(&job("a").key()));
    }

    #[tokio::test]
    async fn test_keys_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = TranscodingCache::new(
            "test",
            config(dir.path(), 1 << 20, 0),
            counting_generator(calls.clone()),
        )
        .unwrap();

        let jobs = [
            TranscodeJob::new(media("a", 0), "mp3", 192),
            TranscodeJob::new(media("a", 0), "mp3", 128),
            TranscodeJob::new(media("a", 0), "opus", 192),
            TranscodeJob::new(media("a", 1), "mp3", 192),
        ];
        for job in &jobs {
            let mut stream = cache.get(job).await.unwrap();
            assert!(!stream.cached());
            read_all(&mut stream).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(cache.stats().entry_count, 4);
    }

    #[tokio::test]
    async fn test_failed_generation_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let generator = move |_job: &TranscodeJob, _cancel: CancellationToken| -> Result<ByteStream> {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Box::pin(Failing { data: None }))
            } else {
                Ok(Box::pin(Cursor::new(b"good".to_vec())))
            }
        };
        let cache =
            TranscodingCache::new("test", config(dir.path(), 1024, 0), Arc::new(generator)).unwrap();

        let err = cache.get(&job("a")).await.err().unwrap();
        assert!(matches!(err, StreamError::Generation(_)), "{:?}", err);
        assert!(!cache.contains(&job("a").key()));
        wait_idle(&cache).await;
        assert!(files_in(dir.path()).is_empty());

        // The next request starts over
        let mut stream = cache.get(&job("a")).await.unwrap();
        assert_eq!(read_all(&mut stream).await.unwrap(), b"good");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_after_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let generator = |_job: &TranscodeJob, _cancel: CancellationToken| -> Result<ByteStream> {
            Ok(Box::pin(Failing {
                data: Some(b"partial".to_vec()),
            }))
        };
        let cache =
            TranscodingCache::new("test", config(dir.path(), 1024, 0), Arc::new(generator)).unwrap();

        let result = async {
            let mut stream = cache.get(&job("a")).await?;
            read_all(&mut stream).await.map_err(StreamError::from)
        }
        .await;
        assert!(result.is_err());

        wait_idle(&cache).await;
        assert!(!cache.contains(&job("a").key()));
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_generator_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let generator = |_job: &TranscodeJob, _cancel: CancellationToken| -> Result<ByteStream> {
            Err(StreamError::Generation("failed to start ffmpeg".into()))
        };
        let cache =
            TranscodingCache::new("test", config(dir.path(), 1024, 0), Arc::new(generator)).unwrap();

        let err = cache.get(&job("a")).await.err().unwrap();
        assert!(err.to_string().contains("failed to start"));
        wait_idle(&cache).await;
        assert_eq!(cache.stats().entry_count, 0);
    }

    #[tokio::test]
    async fn test_size_limit_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        // Every entry is 9 bytes; two fit
        let cache = TranscodingCache::new(
            "test",
            config(dir.path(), 20, 0),
            counting_generator(calls),
        )
        .unwrap();

        for id in ["a", "b", "c"] {
            let mut stream = cache.get(&job(id)).await.unwrap();
            read_all(&mut stream).await.unwrap();
        }
        wait_idle(&cache).await;

        assert!(!cache.contains(&job("a").key()));
        assert!(cache.contains(&job("b").key()));
        assert!(cache.contains(&job("c").key()));
        assert_eq!(cache.stats().total_size_bytes, 18);
        wait_for_file_count(dir.path(), 2).await;
        assert!(!files_in(dir.path()).contains(&job("a").key().storage_name()));
    }

    #[tokio::test]
    async fn test_eviction_skips_entries_being_read() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = TranscodingCache::new(
            "test",
            config(dir.path(), 1 << 20, 2),
            counting_generator(calls),
        )
        .unwrap();

        let mut held = cache.get(&job("a")).await.unwrap();
        assert_eq!(read_all(&mut held).await.unwrap(), b"a:mp3:192");
        for id in ["b", "c"] {
            let mut stream = cache.get(&job(id)).await.unwrap();
            read_all(&mut stream).await.unwrap();
        }
        wait_idle(&cache).await;

        // "a" is the oldest but still open, so "b" goes instead
        assert!(cache.contains(&job("a").key()));
        assert!(!cache.contains(&job("b").key()));
        assert!(cache.contains(&job("c").key()));
        drop(held);
        assert_eq!(cache.stats().entry_count, 2);
    }

    #[tokio::test]
    async fn test_eviction_deferred_until_reader_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = TranscodingCache::new(
            "test",
            config(dir.path(), 1 << 20, 1),
            counting_generator(calls),
        )
        .unwrap();

        let mut a = cache.get(&job("a")).await.unwrap();
        read_all(&mut a).await.unwrap();
        let mut b = cache.get(&job("b")).await.unwrap();
        read_all(&mut b).await.unwrap();
        wait_idle(&cache).await;

        // Both are open: the limit is exceeded for now
        assert_eq!(cache.stats().entry_count, 2);

        drop(a);
        assert_eq!(cache.stats().entry_count, 1);
        assert!(!cache.contains(&job("a").key()));
        assert!(cache.contains(&job("b").key()));

        drop(b);
        wait_for_file_count(dir.path(), 1).await;
        assert_eq!(files_in(dir.path()), vec![job("b").key().storage_name()]);
    }

    #[tokio::test]
    async fn test_generation_survives_while_one_reader_remains() {
        let dir = tempfile::tempdir().unwrap();
        let manual = Arc::new(Manual::default());
        let cache =
            TranscodingCache::new("test", config(dir.path(), 1 << 20, 0), manual.clone()).unwrap();

        let first = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get(&job("a")).await.unwrap() }
        });
        manual.wait_for_runs(1).await;
        let second = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get(&job("a")).await.unwrap() }
        });

        let mut writer = manual.take_writer(0);
        writer.write_all(b"head").await.unwrap();
        let first = first.await.unwrap();
        let mut second = second.await.unwrap();

        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!manual.token(0).is_cancelled());

        writer.write_all(b" tail").await.unwrap();
        drop(writer);
        assert_eq!(read_all(&mut second).await.unwrap(), b"head tail");
        assert!(cache.contains(&job("a").key()));
    }

    #[tokio::test]
    async fn test_last_reader_leaving_cancels_generation() {
        let dir = tempfile::tempdir().unwrap();
        let manual = Arc::new(Manual::default());
        let cache =
            TranscodingCache::new("test", config(dir.path(), 1 << 20, 0), manual.clone()).unwrap();

        let pending = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get(&job("a")).await.unwrap() }
        });
        manual.wait_for_runs(1).await;
        let mut writer = manual.take_writer(0);
        writer.write_all(b"head").await.unwrap();
        let stream = pending.await.unwrap();

        drop(stream);
        tokio::time::timeout(Duration::from_secs(5), manual.token(0).cancelled())
            .await
            .expect("generation should be cancelled");
        wait_idle(&cache).await;

        assert!(!cache.contains(&job("a").key()));
        assert!(files_in(dir.path()).is_empty());

        // A later request starts a fresh generation
        let retry = tokio::spawn({
            let cache = cache.clone();
            async move {
                let mut stream = cache.get(&job("a")).await.unwrap();
                read_all(&mut stream).await.unwrap()
            }
        });
        manual.wait_for_runs(2).await;
        let mut writer = manual.take_writer(1);
        writer.write_all(b"again").await.unwrap();
        drop(writer);
        assert_eq!(retry.await.unwrap(), b"again");
    }

    #[tokio::test]
    async fn test_disabled_cache_streams_directly() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("never-created");
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = TranscodingCache::new(
            "test",
            config(&cache_dir, 0, 0),
            counting_generator(calls.clone()),
        )
        .unwrap();
        assert!(!cache.is_enabled());

        for _ in 0..2 {
            let mut stream = cache.get(&job("a")).await.unwrap();
            assert!(!stream.cached());
            assert!(!stream.seekable());
            assert_eq!(read_all(&mut stream).await.unwrap(), b"a:mp3:192");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!cache_dir.exists());
    }

    #[tokio::test]
    async fn test_entries_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let cache = TranscodingCache::new(
                "test",
                config(dir.path(), 1024, 0),
                counting_generator(calls.clone()),
            )
            .unwrap();
            let mut stream = cache.get(&job("a")).await.unwrap();
            read_all(&mut stream).await.unwrap();
            wait_idle(&cache).await;
        }
        // Leftover of a generation interrupted by the restart
        std::fs::write(dir.path().join("b.x.192.mp3.0123.part"), b"half").unwrap();

        let cache = TranscodingCache::new(
            "test",
            config(dir.path(), 1024, 0),
            counting_generator(calls.clone()),
        )
        .unwrap();
        assert!(cache.contains(&job("a").key()));
        assert_eq!(files_in(dir.path()), vec![job("a").key().storage_name()]);

        let mut stream = cache.get(&job("a")).await.unwrap();
        assert!(stream.cached());
        assert_eq!(read_all(&mut stream).await.unwrap(), b"a:mp3:192");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_vanished_file_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = TranscodingCache::new(
            "test",
            config(dir.path(), 1024, 0),
            counting_generator(calls.clone()),
        )
        .unwrap();

        let mut stream = cache.get(&job("a")).await.unwrap();
        read_all(&mut stream).await.unwrap();
        drop(stream);
        wait_idle(&cache).await;

        std::fs::remove_file(dir.path().join(job("a").key().storage_name())).unwrap();

        let mut stream = cache.get(&job("a")).await.unwrap();
        assert!(!stream.cached());
        assert_eq!(read_all(&mut stream).await.unwrap(), b"a:mp3:192");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

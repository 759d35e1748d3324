pub(crate) mod cache;
pub(crate) mod error;
pub(crate) mod job;
pub(crate) mod negotiate;
pub(crate) mod repository;
pub(crate) mod stream;
pub(crate) mod streamer;
pub(crate) mod transcode;
pub(crate) mod types;

#[cfg(test)]
pub(crate) mod tests;

pub use cache::{CacheConfig, CacheStats, CachedStream, Generator, TranscodingCache};
pub use error::{Result, StreamError};
pub use job::{JobKey, TranscodeJob};
pub use negotiate::{select_transcoding_options, Selection};
pub use repository::{
    MediaFileRepository, MemoryMediaRepository, MemoryTranscodingRepository,
    TranscodingRepository,
};
pub use stream::Stream;
pub use streamer::{MediaStreamer, TranscodeGenerator};
pub use transcode::{build_command, ByteStream, ProcessOutput, ProcessTranscoder, Transcoder};
pub use types::{
    MediaFile, PlayerProfile, StreamRequest, Transcoding, TranscodingProfile, RAW_FORMAT,
};

//! External encoder processes
//!
//! This module handles launching the encoder for a transcoding rule:
//! - Command template expansion (`%s` source path, `%b` bitrate)
//! - Process spawning with piped output
//! - Cancellation and reaping of the child process
//! - Stderr capture for diagnostics

pub mod command;
pub mod process;

use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use command::build_command;
pub use process::{ProcessOutput, ProcessTranscoder};

/// Sequential byte source produced by an encoder
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Something that turns a source file into an encoded byte stream.
pub trait Transcoder: Send + Sync {
    /// Start encoding `path` with the rule's `command` at `bit_rate` kbps.
    ///
    /// The returned stream fails if the encoder does not finish cleanly.
    /// Cancelling `cancel`, or dropping the stream, stops the encoder.
    fn start(
        &self,
        command: &str,
        path: &Path,
        bit_rate: u32,
        cancel: CancellationToken,
    ) -> Result<ByteStream>;
}

//! Encoder subprocess with a cancellable output stream

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, ReadBuf};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::{build_command, ByteStream, Transcoder};
use crate::error::{Result, StreamError};

/// How much of the encoder's stderr is kept for error messages
const STDERR_TAIL_BYTES: usize = 4096;

/// Runs transcoding rules as external processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessTranscoder {
    /// Replaces the `ffmpeg` program name of rule templates when set
    encoder_path: Option<PathBuf>,
}

impl ProcessTranscoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_encoder_path(encoder_path: Option<PathBuf>) -> Self {
        Self { encoder_path }
    }
}

impl Transcoder for ProcessTranscoder {
    fn start(
        &self,
        command: &str,
        path: &Path,
        bit_rate: u32,
        cancel: CancellationToken,
    ) -> Result<ByteStream> {
        let args = build_command(command, path, bit_rate, self.encoder_path.as_deref())?;
        let program = args[0].to_string_lossy().into_owned();

        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(command = ?args, "Starting encoder");
        let mut child = cmd
            .spawn()
            .map_err(|e| StreamError::Generation(format!("failed to start {}: {}", program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StreamError::Generation("encoder stdout not captured".to_string()))?;
        let stderr = child.stderr.take();
        let pid = child.id();

        let (exit_tx, exit_rx) = oneshot::channel();
        let watcher_cancel = cancel.clone();
        tokio::spawn(async move {
            let stderr_task = stderr.map(|s| tokio::spawn(capture_stderr(s)));

            let status = tokio::select! {
                status = child.wait() => status,
                _ = watcher_cancel.cancelled() => {
                    tracing::debug!(pid, "Killing cancelled encoder");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(pid, error = %e, "Failed to kill encoder");
                    }
                    Err(io::Error::new(io::ErrorKind::Interrupted, "encoder cancelled"))
                }
            };

            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            if let Ok(status) = &status {
                tracing::debug!(pid, %status, "Encoder exited");
            }
            let _ = exit_tx.send(ExitReport { status, stderr });
        });

        Ok(Box::pin(ProcessOutput {
            stdout,
            exit: Some(exit_rx),
            _cancel_on_drop: cancel.drop_guard(),
        }))
    }
}

/// Drain stderr, logging each line and keeping the last few KiB.
async fn capture_stderr(stderr: ChildStderr) -> String {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    let mut tail = String::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                tracing::debug!(target: "encoder", "{}", text);
                tail.push_str(text);
                tail.push('\n');
                if tail.len() > STDERR_TAIL_BYTES {
                    let mut cut = tail.len() - STDERR_TAIL_BYTES;
                    while !tail.is_char_boundary(cut) {
                        cut += 1;
                    }
                    tail.drain(..cut);
                }
            }
        }
    }
    tail
}

struct ExitReport {
    status: io::Result<ExitStatus>,
    stderr: String,
}

impl ExitReport {
    fn into_result(self) -> io::Result<()> {
        match self.status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("encoder exited with {}: {}", status, self.stderr.trim()),
            )),
            Err(e) => Err(e),
        }
    }
}

/// Standard output of a running encoder.
///
/// End of stream is only reported once the process has exited successfully;
/// a failed exit turns into a read error. Dropping it kills the encoder.
pub struct ProcessOutput {
    stdout: ChildStdout,
    exit: Option<oneshot::Receiver<ExitReport>>,
    _cancel_on_drop: DropGuard,
}

impl AsyncRead for ProcessOutput {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.stdout).poll_read(cx, buf))?;
        if buf.filled().len() > before {
            return Poll::Ready(Ok(()));
        }

        // Stdout is closed: the outcome depends on the exit status
        let Some(exit) = this.exit.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let report = ready!(Pin::new(exit).poll(cx));
        this.exit = None;
        match report {
            Ok(report) => Poll::Ready(report.into_result()),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                "encoder watcher stopped",
            ))),
        }
    }
}

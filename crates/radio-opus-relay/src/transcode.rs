//! Encoder process supervision.
//!
//! One [`TranscodeSession`] owns one encoder process for one client response.
//! A single supervisor task forwards stdout into a bounded channel that the
//! response body drains, and settles on exactly one [`SessionEnd`] before
//! tearing the process down.

use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;

use actix_web::HttpResponse;
use actix_web::web::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::Url;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;

use crate::models::StreamRequest;

/// Media type of the encoder output.
pub const OUTPUT_CONTENT_TYPE: &str = "audio/opus";

/// Encoded chunks buffered between the encoder and a slow client.
const CHANNEL_CHUNKS: usize = 8;
const READ_CHUNK_BYTES: usize = 4096;
/// Time an encoder gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(1);

/// How encoder processes are launched.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub program: PathBuf,
    pub timezone: String,
}

/// Arguments for an ffmpeg-compatible encoder: paced read of `source`,
/// audio only, constrained-VBR Opus at `bitrate_kbps`, raw Ogg/Opus on stdout.
pub fn encoder_args(source: &Url, bitrate_kbps: u32) -> Vec<String> {
    let mut args: Vec<String> = [
        "-nostdin",
        "-loglevel",
        "warning",
        "-thread_queue_size",
        "512",
        "-re",
        "-probesize",
        "7500000",
        "-i",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect();
    args.push(source.to_string());
    args.extend(
        ["-vn", "-c:a", "libopus", "-b:a"]
            .iter()
            .map(|arg| arg.to_string()),
    );
    args.push(format!("{bitrate_kbps}k"));
    args.extend(
        [
            "-vbr",
            "constrained",
            "-flush_packets",
            "0",
            "-f",
            "opus",
            "pipe:1",
        ]
        .iter()
        .map(|arg| arg.to_string()),
    );
    args
}

/// How a session ended. Exactly one is produced per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The encoder exited on its own (`None` when killed by a signal).
    Exited(Option<i32>),
    /// Reading output or reaping the process failed.
    Errored(String),
    /// The client went away and the encoder was terminated.
    Killed,
}

#[derive(Debug)]
pub enum TranscodeError {
    Spawn { program: String, reason: String },
    MissingPipe(&'static str),
}

impl std::fmt::Display for TranscodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscodeError::Spawn { program, reason } => {
                write!(f, "failed to spawn encoder {program}: {reason}")
            }
            TranscodeError::MissingPipe(pipe) => write!(f, "encoder {pipe} was not captured"),
        }
    }
}

impl TranscodeError {
    pub fn into_response(self) -> HttpResponse {
        HttpResponse::BadGateway().finish()
    }
}

/// Response body fed by a session's supervisor.
pub struct TranscodeStream {
    rx: mpsc::Receiver<Bytes>,
}

impl Stream for TranscodeStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

/// Handle for observing a running session.
pub struct SessionHandle {
    pid: Option<u32>,
    supervisor: JoinHandle<SessionEnd>,
}

impl SessionHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the session to reach its terminal state.
    pub async fn wait(self) -> SessionEnd {
        match self.supervisor.await {
            Ok(end) => end,
            Err(e) => SessionEnd::Errored(format!("supervisor task failed: {e}")),
        }
    }
}

/// A running encoder bound to one response stream.
pub struct TranscodeSession {
    child: Child,
    pid: Option<u32>,
    source: Url,
    bitrate_kbps: u32,
}

impl TranscodeSession {
    /// Spawn the encoder for `request` and start supervising it.
    pub fn start(
        encoder: &EncoderConfig,
        request: &StreamRequest,
    ) -> Result<(TranscodeStream, SessionHandle), TranscodeError> {
        let mut child = Command::new(&encoder.program)
            .args(encoder_args(&request.source, request.bitrate_kbps))
            .env("TZ", &encoder.timezone)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TranscodeError::Spawn {
                program: encoder.program.display().to_string(),
                reason: e.to_string(),
            })?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or(TranscodeError::MissingPipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr, pid));
        }

        tracing::info!(
            pid = ?pid,
            url = %request.source,
            bitrate_kbps = request.bitrate_kbps,
            "spawned encoder"
        );

        let session = TranscodeSession {
            child,
            pid,
            source: request.source.clone(),
            bitrate_kbps: request.bitrate_kbps,
        };
        let (tx, rx) = mpsc::channel(CHANNEL_CHUNKS);
        let supervisor = tokio::spawn(session.supervise(stdout, tx));

        Ok((TranscodeStream { rx }, SessionHandle { pid, supervisor }))
    }

    async fn supervise(mut self, stdout: ChildStdout, tx: mpsc::Sender<Bytes>) -> SessionEnd {
        let mut output = ReaderStream::with_capacity(stdout, READ_CHUNK_BYTES);

        let end = loop {
            let next = tokio::select! {
                _ = tx.closed() => None,
                chunk = output.next() => Some(chunk),
            };
            match next {
                None => break SessionEnd::Killed,
                Some(Some(Ok(bytes))) => {
                    // Waits while the client is slow; fails once it is gone.
                    if tx.send(bytes).await.is_err() {
                        break SessionEnd::Killed;
                    }
                }
                Some(Some(Err(e))) => break SessionEnd::Errored(format!("read encoder output: {e}")),
                Some(None) => {
                    // Stdout is closed but the process may linger.
                    break tokio::select! {
                        status = self.child.wait() => match status {
                            Ok(status) => SessionEnd::Exited(status.code()),
                            Err(e) => SessionEnd::Errored(format!("wait for encoder: {e}")),
                        },
                        _ = tx.closed() => SessionEnd::Killed,
                    };
                }
            }
        };

        drop(tx);
        self.teardown(end).await
    }

    async fn teardown(mut self, end: SessionEnd) -> SessionEnd {
        match &end {
            SessionEnd::Exited(code) => {
                tracing::info!(
                    pid = ?self.pid,
                    code = ?code,
                    url = %self.source,
                    "encoder exited"
                );
            }
            SessionEnd::Errored(cause) => {
                tracing::warn!(
                    pid = ?self.pid,
                    url = %self.source,
                    error = %cause,
                    "encoder failed; ending stream"
                );
                self.terminate().await;
            }
            SessionEnd::Killed => {
                tracing::debug!(
                    pid = ?self.pid,
                    bitrate_kbps = self.bitrate_kbps,
                    "client disconnected; terminating encoder"
                );
                self.terminate().await;
            }
        }
        end
    }

    /// Ask the encoder to stop, then force it after [`TERMINATE_GRACE`].
    async fn terminate(&mut self) {
        if self.request_stop() {
            match tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await {
                Ok(Ok(_)) => return,
                Ok(Err(e)) => {
                    tracing::warn!(pid = ?self.pid, error = %e, "failed to reap encoder");
                    return;
                }
                Err(_) => tracing::debug!(pid = ?self.pid, "encoder ignored SIGTERM; killing"),
            }
        }
        if let Err(e) = self.child.start_kill() {
            tracing::warn!(pid = ?self.pid, error = %e, "failed to signal encoder");
        }
        if let Err(e) = self.child.wait().await {
            tracing::warn!(pid = ?self.pid, error = %e, "failed to reap encoder");
        }
    }

    #[cfg(unix)]
    fn request_stop(&self) -> bool {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        // No id means the child was already reaped.
        let Some(pid) = self.child.id() else {
            return false;
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(pid, error = %e, "SIGTERM failed");
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn request_stop(&self) -> bool {
        false
    }
}

async fn log_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "encoder", pid = ?pid, "{}", line);
    }
}

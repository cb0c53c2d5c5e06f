//! Line-delimited JSON transport over a child process's stdio.
//!
//! Handles low-level communication with tool server child processes:
//! - Spawning the child with piped stdin/stdout/stderr
//! - Writing one JSON message per line to stdin
//! - Reading complete lines from stdout, never a partial frame
//! - Terminating the child when the channel is closed

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use super::errors::RpcError;
use super::types::{Message, ServerDescriptor};

/// Maximum stderr captured for a failed handshake.
const STDERR_CAPTURE_LIMIT: usize = 2000;

// ─── Reading ─────────────────────────────────────────────────────────────────

/// Outcome of one read from the channel.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    /// One complete frame, without its trailing newline.
    Frame(Vec<u8>),
    /// The peer closed its end of the stream.
    EndOfStream,
}

/// Reads newline-delimited frames from a byte stream.
pub struct FrameReader {
    server: String,
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
}

impl FrameReader {
    /// Wrap a readable stream.
    pub fn new<R>(server: &str, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            server: server.to_string(),
            reader: BufReader::new(Box::new(reader)),
        }
    }

    /// Read the next complete frame.
    ///
    /// Blank lines are skipped. An unterminated fragment at end of stream is
    /// discarded and reported as [`Received::EndOfStream`].
    pub async fn receive(&mut self) -> Result<Received, RpcError> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let bytes_read = self
                .reader
                .read_until(b'\n', &mut buf)
                .await
                .map_err(|e| RpcError::Transport {
                    server: self.server.clone(),
                    reason: format!("failed to read from stdout: {e}"),
                })?;

            if bytes_read == 0 {
                return Ok(Received::EndOfStream);
            }

            if buf.last() != Some(&b'\n') {
                tracing::warn!(
                    server = %self.server,
                    bytes = buf.len(),
                    "discarding unterminated frame at end of stream"
                );
                return Ok(Received::EndOfStream);
            }

            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            if buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Ok(Received::Frame(buf));
        }
    }

    /// Read and decode the next message. `Ok(None)` means end of stream.
    pub async fn receive_message(&mut self) -> Result<Option<Message>, RpcError> {
        match self.receive().await? {
            Received::Frame(frame) => decode_frame(&self.server, &frame).map(Some),
            Received::EndOfStream => Ok(None),
        }
    }
}

/// Decode one frame into a [`Message`].
pub fn decode_frame(server: &str, frame: &[u8]) -> Result<Message, RpcError> {
    serde_json::from_slice(frame).map_err(|e| RpcError::Protocol {
        server: server.to_string(),
        reason: format!("malformed message: {e}"),
    })
}

// ─── Writing ─────────────────────────────────────────────────────────────────

/// Writes one message per line to a byte stream.
pub struct FrameWriter {
    server: String,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl FrameWriter {
    /// Wrap a writable stream.
    pub fn new<W>(server: &str, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            server: server.to_string(),
            writer: Box::new(writer),
        }
    }

    /// Serialize and send one message, flushing immediately.
    pub async fn send(&mut self, message: &Message) -> Result<(), RpcError> {
        let mut json = serde_json::to_string(message).map_err(|e| RpcError::Transport {
            server: self.server.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');

        self.writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| RpcError::Transport {
                server: self.server.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        self.writer
            .flush()
            .await
            .map_err(|e| RpcError::Transport {
                server: self.server.clone(),
                reason: format!("failed to flush stdin: {e}"),
            })
    }

    /// Close the write half so the peer observes end of stream.
    pub async fn close(&mut self) {
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(server = %self.server, error = %e, "error closing stdin");
        }
    }
}

// ─── Child Process ───────────────────────────────────────────────────────────

/// The spawned peer process behind a channel.
pub struct ChildProcess {
    server: String,
    child: Child,
    stderr: Option<ChildStderr>,
}

impl ChildProcess {
    /// OS process id, if the child is still running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Read whatever the child wrote to stderr, for diagnostics on failure.
    ///
    /// Uses a short timeout so a silent child does not block the caller.
    pub async fn capture_stderr(&mut self) -> String {
        use tokio::io::AsyncReadExt;

        let Some(mut stderr) = self.stderr.take() else {
            return String::new();
        };

        let mut buf = String::new();
        match tokio::time::timeout(Duration::from_millis(500), stderr.read_to_string(&mut buf))
            .await
        {
            Ok(Ok(_)) => {
                if buf.len() > STDERR_CAPTURE_LIMIT {
                    let mut cut = STDERR_CAPTURE_LIMIT;
                    while !buf.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    buf.truncate(cut);
                    buf.push_str("...(truncated)");
                }
                buf.trim().to_string()
            }
            _ => String::new(),
        }
    }

    /// Signal the child to exit immediately, without waiting for it.
    pub fn start_kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(server = %self.server, error = %e, "failed to signal server");
        }
    }

    /// Forward the child's stderr to the log for the rest of its life.
    ///
    /// Keeps the pipe drained so a chatty child never blocks on a full buffer.
    pub fn forward_stderr(&mut self) {
        let Some(stderr) = self.stderr.take() else {
            return;
        };
        let server = self.server.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(server = %server, line = %line, "server stderr");
            }
        });
    }

    /// Wait up to `grace` for the child to exit on its own, then kill it.
    pub async fn terminate(mut self, grace: Duration) -> Result<(), RpcError> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server, %status, "server exited");
                Ok(())
            }
            _ => {
                tracing::warn!(
                    server = %self.server,
                    grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                    "server did not exit in time, killing"
                );
                self.child.kill().await.map_err(|e| RpcError::Shutdown {
                    server: self.server.clone(),
                    reason: format!("failed to kill process: {e}"),
                })
            }
        }
    }
}

// ─── Channel ─────────────────────────────────────────────────────────────────

/// A bidirectional framed channel, optionally owning the peer process.
pub struct Channel {
    pub reader: FrameReader,
    pub writer: FrameWriter,
    pub process: Option<ChildProcess>,
}

impl Channel {
    /// Build a channel over arbitrary streams (no child process).
    pub fn from_streams<R, W>(server: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: FrameReader::new(server, reader),
            writer: FrameWriter::new(server, writer),
            process: None,
        }
    }

    /// Spawn the server described by `descriptor` and wire its stdio.
    pub fn spawn(descriptor: &ServerDescriptor) -> Result<Self, RpcError> {
        let name = descriptor.name.as_str();
        let mut cmd = Command::new(&descriptor.command);
        cmd.args(&descriptor.args);

        for (key, value) in &descriptor.env {
            cmd.env(key, value);
        }

        if let Some(dir) = descriptor.cwd.as_deref() {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| RpcError::Spawn {
            server: name.to_string(),
            reason: format!("{}: {e}", descriptor.command),
        })?;

        let stdin = child.stdin.take().ok_or(RpcError::Spawn {
            server: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;

        let stdout = child.stdout.take().ok_or(RpcError::Spawn {
            server: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr = child.stderr.take();

        tracing::debug!(
            server = name,
            command = %descriptor.command,
            pid = ?child.id(),
            "spawned server process"
        );

        Ok(Self {
            reader: FrameReader::new(name, stdout),
            writer: FrameWriter::new(name, stdin),
            process: Some(ChildProcess {
                server: name.to_string(),
                child,
                stderr,
            }),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

pub mod rpc_client;
pub mod tool_server;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub use rpc_client::{Orchestrator, RpcError, ServerDescriptor};

/// Env var selecting the log format (`json` or anything else for text).
pub const LOG_FORMAT_ENV: &str = "TOOLMESH_LOG_FORMAT";

/// Return the platform-standard data directory for toolmesh.
///
/// - macOS: `~/Library/Application Support/toolmesh/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolmesh\`
/// - Linux: `$XDG_DATA_HOME/toolmesh/` (fallback `~/.local/share/toolmesh/`)
///
/// Falls back to `~/.toolmesh/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolmesh");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolmesh")
}

/// Initialize the tracing subscriber.
///
/// Without a log file, logs go to stderr; stdout carries the wire protocol
/// in the server binaries and must stay clean. With a log file:
/// 1. Rotates existing logs (toolmesh.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh file with a line-flushing writer for crash resilience.
///
/// `RUST_LOG` overrides the default `toolmesh=info,warn` filter and
/// `TOOLMESH_LOG_FORMAT=json` switches to JSON lines. Calling this twice is
/// harmless; the second subscriber is ignored.
pub fn init_tracing(log_file: Option<&Path>) -> io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolmesh=info,warn"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    let installed = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            rotate_log_file(path, 3);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let writer = FlushingWriter::new(file);
            let builder = builder.with_writer(writer).with_ansi(false);
            if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
        None => {
            let builder = builder.with_writer(std::io::stderr);
            if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
    };

    if installed.is_ok() {
        tracing::debug!(
            version = env!("CARGO_PKG_VERSION"),
            log_file = ?log_file,
            pid = std::process::id(),
            "tracing initialized"
        );
    }
    Ok(())
}

/// Shift earlier runs' logs up one suffix before a new run starts writing.
///
/// `toolmesh.log` becomes `toolmesh.log.1`; whatever sat at `.{keep}` is gone.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let numbered = |n: u32| PathBuf::from(format!("{}.{n}", base_path.display()));

    let _ = std::fs::remove_file(numbered(keep));
    for n in (1..keep).rev() {
        let _ = std::fs::rename(numbered(n), numbered(n + 1));
    }
    if base_path.exists() {
        let _ = std::fs::rename(base_path, numbered(1));
    }
}

/// Log file sink shared by every subscriber writer; each event is flushed
/// as soon as it is written.
///
/// The orchestrator kills unresponsive peers, and a tool server may be
/// killed the same way, so nothing is left sitting in a buffer.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<File>>,
}

impl FlushingWriter {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }

    fn locked(&self) -> io::Result<MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.locked()?;
        file.write_all(buf)?;
        file.flush()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.locked()?.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

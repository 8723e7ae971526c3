//! Logging setup: rotating file sink plus console echo.
//!
//! Every significant event goes to `~/.chatbaz-cursor/proxy.log` at debug
//! level, rotated by size with a fixed number of retained backups
//! (`proxy.log.1` is the newest backup). The console gets the same stream at
//! info level, or debug with `--verbose`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Maximum size of the active log file before rotation.
const LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Number of rotated backups kept next to the active file.
const LOG_BACKUP_COUNT: u32 = 3;

const LOG_FILE_NAME: &str = "proxy.log";

struct Inner {
    file: Mutex<File>,
    path: PathBuf,
    max_bytes: u64,
    backup_count: u32,
}

/// Size-rotating log file writer.
///
/// When a write would land in a file past the size limit, the current file
/// becomes `.1`, existing backups shift up, and the oldest falls off.
#[derive(Clone)]
pub struct RotatingFileWriter(Arc<Inner>);

impl RotatingFileWriter {
    /// Opens (or creates) the log file in append mode.
    pub fn new(path: PathBuf, max_bytes: u64, backup_count: u32) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = open_append(&path)?;
        Ok(Self(Arc::new(Inner {
            file: Mutex::new(file),
            path,
            max_bytes,
            backup_count,
        })))
    }

    fn rotate(&self, file: &mut File) -> io::Result<()> {
        file.flush()?;

        // Shift proxy.log.1 -> proxy.log.2 -> ... oldest dropped
        for index in (1..self.0.backup_count).rev() {
            let from = backup_path(&self.0.path, index);
            if from.exists() {
                let _ = fs::rename(&from, backup_path(&self.0.path, index + 1));
            }
        }
        if self.0.backup_count > 0 {
            let _ = fs::rename(&self.0.path, backup_path(&self.0.path, 1));
        }

        *file = open_append(&self.0.path)?;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn backup_path(path: &Path, index: u32) -> PathBuf {
    let mut os = path.to_path_buf().into_os_string();
    os.push(format!(".{index}"));
    PathBuf::from(os)
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut file = self
            .0
            .file
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?;

        let len = file.metadata().map_or(0, |m| m.len());
        if len + buf.len() as u64 > self.0.max_bytes {
            self.rotate(&mut file)?;
        }

        file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut file = self
            .0
            .file
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?;
        file.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingFileWriter {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Initializes the global subscriber with console and file layers.
///
/// Returns the path of the active log file. `RUST_LOG` overrides the
/// built-in filters when set.
pub fn init(verbose: bool) -> Result<PathBuf> {
    let log_path = chatbaz_proxy::storage_dir()
        .context("Failed to determine log directory")?
        .join(LOG_FILE_NAME);

    let file_writer = RotatingFileWriter::new(log_path.clone(), LOG_MAX_BYTES, LOG_BACKUP_COUNT)
        .with_context(|| format!("Failed to open log file at {}", log_path.display()))?;

    let console_level = if verbose { "debug" } else { "info" };
    let console_filter = env_filter(console_level);
    let file_filter = env_filter("debug");

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(io::stderr)
                .with_filter(console_filter),
        )
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(file_writer)
                .with_filter(file_filter),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(log_path)
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("chatbaz_proxy={level},chatbaz_proxy_cli={level}")))
}

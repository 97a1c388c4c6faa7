//! Container output logs.
//!
//! Every chunk a container writes to stdout or stderr is appended to
//! `<data_dir>/containers/<id>/<id>-json.log` as one JSON object per line.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use berth_common::error::{BerthError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// Stream name recorded for stdout chunks.
pub const STDOUT: &str = "stdout";
/// Stream name recorded for stderr chunks.
pub const STDERR: &str = "stderr";

/// One logged chunk of container output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Output exactly as the container wrote it.
    pub log: String,
    /// `stdout` or `stderr`.
    pub stream: String,
    /// When the chunk was read.
    pub time: DateTime<Utc>,
}

impl LogEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn now(stream: &str, chunk: &[u8]) -> Self {
        Self {
            log: String::from_utf8_lossy(chunk).into_owned(),
            stream: stream.to_string(),
            time: Utc::now(),
        }
    }
}

/// Returns the state directory of a container.
#[must_use]
pub fn container_dir(data_dir: &Path, container_id: &str) -> PathBuf {
    data_dir.join("containers").join(container_id)
}

/// Returns the log file path for a container.
#[must_use]
pub fn log_path(data_dir: &Path, container_id: &str) -> PathBuf {
    container_dir(data_dir, container_id).join(format!("{container_id}-json.log"))
}

/// Reads every logged entry of a container, oldest first.
///
/// Returns an empty list if the log file does not exist yet. Lines that fail
/// to decode are skipped.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_logs(data_dir: &Path, container_id: &str) -> Result<Vec<LogEntry>> {
    let path = log_path(data_dir, container_id);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(&path).map_err(|e| BerthError::io(&path, e))?;
    let mut entries = Vec::new();
    for line in std::io::BufReader::new(file).lines() {
        let line = line.map_err(|e| BerthError::io(&path, e))?;
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::debug!(path = %path.display(), error = %e, "skipping malformed log line"),
        }
    }
    Ok(entries)
}

/// Appends one entry to a container's log.
///
/// Creates the log directory and file if they do not exist.
///
/// # Errors
///
/// Returns an error if the directory or file cannot be created or written.
pub fn append_log(data_dir: &Path, container_id: &str, entry: &LogEntry) -> Result<()> {
    let path = log_path(data_dir, container_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| BerthError::io(parent, e))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| BerthError::io(&path, e))?;
    let line = serde_json::to_string(entry)?;
    writeln!(file, "{line}").map_err(|e| BerthError::io(&path, e))?;
    Ok(())
}

/// Async append handle shared by the stdout and stderr pumps of one run.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl LogSink {
    /// Opens (creating if needed) the log file of a container for appending.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created.
    pub async fn open(data_dir: &Path, container_id: &str) -> Result<Self> {
        let path = log_path(data_dir, container_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BerthError::io(parent, e))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| BerthError::io(&path, e))?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    /// Appends one chunk of output.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be encoded or written.
    pub async fn write(&self, stream: &str, chunk: &[u8]) -> Result<()> {
        let mut line = serde_json::to_vec(&LogEntry::now(stream, chunk))?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(|e| BerthError::io(&self.path, e))
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

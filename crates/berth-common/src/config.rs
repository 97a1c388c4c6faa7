//! Daemon configuration model.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{BerthError, Result};

/// Address the API server binds to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ListenAddr {
    /// A unix domain socket path (`unix:///path` or a bare path).
    Unix(PathBuf),
    /// A TCP address (`tcp://host:port`).
    Tcp(SocketAddr),
}

impl FromStr for ListenAddr {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            let addr = addr.parse().map_err(|e| BerthError::Config {
                message: format!("invalid tcp address {addr:?}: {e}"),
            })?;
            return Ok(Self::Tcp(addr));
        }
        let path = s.strip_prefix("unix://").unwrap_or(s);
        if path.is_empty() {
            return Err(BerthError::Config {
                message: "empty listen address".into(),
            });
        }
        Ok(Self::Unix(PathBuf::from(path)))
    }
}

impl TryFrom<String> for ListenAddr {
    type Error = BerthError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ListenAddr> for String {
    fn from(addr: ListenAddr) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Root configuration for the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Base directory for container layers, images and logs.
    pub data_dir: PathBuf,
    /// Where the API server listens.
    pub listen: ListenAddr,
    /// Whether CORS headers are added to every response.
    pub enable_cors: bool,
    /// Reported by `/info` and used to raise log verbosity.
    pub debug: bool,
    /// Events retained for `since` replay.
    pub event_log_capacity: usize,
    /// Per-listener buffer before events are dropped for that listener.
    pub listener_buffer: usize,
    /// Default grace period for stop and restart, in seconds.
    pub stop_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: constants::data_dir().clone(),
            listen: ListenAddr::Unix(PathBuf::from(constants::DEFAULT_SOCKET_PATH)),
            enable_cors: false,
            debug: false,
            event_log_capacity: constants::DEFAULT_EVENT_LOG_CAPACITY,
            listener_buffer: constants::DEFAULT_LISTENER_BUFFER,
            stop_timeout_secs: constants::DEFAULT_STOP_TIMEOUT_SECS,
        }
    }
}

impl DaemonConfig {
    /// Creates a configuration rooted at `data_dir` with defaults elsewhere.
    #[must_use]
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Loads a configuration from a JSON file. Missing keys take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, cannot be parsed, or
    /// holds invalid values.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| BerthError::io(path, e))?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Config`] for a zero-sized event log or listener buffer.
    pub fn validate(&self) -> Result<()> {
        if self.event_log_capacity == 0 {
            return Err(BerthError::Config {
                message: "event_log_capacity must be at least 1".into(),
            });
        }
        if self.listener_buffer == 0 {
            return Err(BerthError::Config {
                message: "listener_buffer must be at least 1".into(),
            });
        }
        Ok(())
    }
}

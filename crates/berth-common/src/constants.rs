//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

use crate::types::ApiVersion;

/// Newest API version served by this daemon.
pub const API_VERSION: ApiVersion = ApiVersion::new(1, 6);

/// Oldest API version any endpoint accepts.
pub const MIN_API_VERSION: ApiVersion = ApiVersion::new(1, 0);

/// First API version whose attach streams are multiplexed.
pub const MULTIPLEXED_STREAMS_VERSION: ApiVersion = ApiVersion::new(1, 6);

/// Daemon release version.
pub const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default base directory for berth data on Linux with root access.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/berth";

/// Default unix socket the daemon listens on.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/berth.sock";

/// Number of events retained for `since` replay.
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 64;

/// Per-listener delivery buffer before events are dropped for that listener.
pub const DEFAULT_LISTENER_BUFFER: usize = 64;

/// Seconds a stopped container gets between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

/// Minimum memory limit accepted at container creation, in bytes.
pub const MIN_MEMORY_LIMIT: i64 = 524_288;

/// Application name used in logs and paths.
pub const APP_NAME: &str = "berth";

/// Binary name of the daemon.
pub const BIN_NAME: &str = "berthd";

/// Returns the data directory, preferring `$HOME/.berth` for non-root
/// environments, falling back to `/var/lib/berth`.
fn resolve_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let user_dir = PathBuf::from(home).join(".berth");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

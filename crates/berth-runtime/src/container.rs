//! Container record: identity, configuration, state and stream handles.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use berth_common::error::{BerthError, Result};
use berth_common::types::{ContainerConfig, ContainerId, HostConfig, ImageId};
use chrono::{DateTime, Utc};

use crate::attach::{AttachOptions, AttachSession};
use crate::state::State;
use crate::stdio::ContainerStdio;

/// A container known to the daemon.
///
/// Identity and configuration are fixed at creation. The state, host config
/// and stream handles change across runs and sit behind their own locks.
#[derive(Debug)]
pub struct Container {
    /// Unique identifier.
    pub id: ContainerId,
    /// Optional operator-chosen name.
    pub name: Option<String>,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
    /// Executable of the container process.
    pub path: String,
    /// Arguments of the container process.
    pub args: Vec<String>,
    /// Creation-time configuration, merged with the image defaults.
    pub config: ContainerConfig,
    /// Image the container was created from.
    pub image: ImageId,
    /// Lifecycle state.
    pub state: State,
    rootfs: PathBuf,
    host_config: Mutex<HostConfig>,
    stdio: Mutex<ContainerStdio>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Container {
    /// Creates a stopped container.
    #[must_use]
    pub fn new(
        id: ContainerId,
        name: Option<String>,
        config: ContainerConfig,
        image: ImageId,
        rootfs: PathBuf,
    ) -> Self {
        let mut command = config.entrypoint.iter().chain(&config.cmd).cloned();
        let path = command.next().unwrap_or_default();
        let args = command.collect();
        Self {
            id,
            name,
            created: Utc::now(),
            path,
            args,
            config,
            image,
            state: State::new(),
            rootfs,
            host_config: Mutex::new(HostConfig::default()),
            stdio: Mutex::new(ContainerStdio::detached()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Command line as shown in listings.
    #[must_use]
    pub fn command(&self) -> String {
        std::iter::once(self.path.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Directory the container process runs in.
    #[must_use]
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Host configuration of the latest start.
    #[must_use]
    pub fn host_config(&self) -> HostConfig {
        self.host_config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the host configuration.
    pub fn set_host_config(&self, host_config: HostConfig) {
        *self.host_config.lock().unwrap_or_else(PoisonError::into_inner) = host_config;
    }

    /// Stream handles of the current (or last) run.
    #[must_use]
    pub fn stdio(&self) -> ContainerStdio {
        self.stdio.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Installs the stream handles of a new run.
    pub fn set_stdio(&self, stdio: ContainerStdio) {
        *self.stdio.lock().unwrap_or_else(PoisonError::into_inner) = stdio;
    }

    /// Serializes start, stop, kill and restart of this container.
    pub async fn lock_lifecycle(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    /// Prepares an attach session on the current run.
    ///
    /// Stdin is only wired when the container has an open stdin. Output
    /// subscriptions are taken here, before any connection is handed over.
    ///
    /// # Errors
    ///
    /// Returns a conflict when stdin is requested on a running `StdinOnce`
    /// container whose stdin was already closed by an earlier session.
    pub fn attach(&self, options: AttachOptions) -> Result<AttachSession> {
        let stdio = self.stdio();
        let stdin = if options.stdin && self.config.open_stdin {
            if self.config.stdin_once && stdio.stdin.is_closed() && self.state.is_running() {
                return Err(BerthError::conflict(format!(
                    "stdin of container {} was closed by a previous attach",
                    self.id.short()
                )));
            }
            Some(Arc::clone(&stdio.stdin))
        } else {
            None
        };
        Ok(AttachSession::new(
            self.id.clone(),
            stdin,
            self.config.stdin_once,
            options.stdout.then(|| stdio.stdout.follow()),
            options.stderr.then(|| stdio.stderr.follow()),
            options.multiplex,
        ))
    }
}

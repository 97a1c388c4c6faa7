//! Domain primitive types used across the berth workspace.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{BerthError, Result};

/// Number of hex characters shown for abbreviated identifiers.
pub const SHORT_ID_LENGTH: usize = 12;

fn random_hex_id() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Unique identifier for a container instance (64 hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(random_hex_id())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the abbreviated form used in listings.
    #[must_use]
    pub fn short(&self) -> &str {
        truncate_id(&self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a container image (64 hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    /// Creates a new image ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random image ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(random_hex_id())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the abbreviated form used in listings.
    #[must_use]
    pub fn short(&self) -> &str {
        truncate_id(&self.0)
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn truncate_id(id: &str) -> &str {
    id.get(..SHORT_ID_LENGTH).unwrap_or(id)
}

/// Version of the HTTP management API, ordered by `(major, minor)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApiVersion {
    major: u16,
    minor: u16,
}

impl ApiVersion {
    /// Creates a version from its components.
    #[must_use]
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Major component.
    #[must_use]
    pub const fn major(self) -> u16 {
        self.major
    }

    /// Minor component.
    #[must_use]
    pub const fn minor(self) -> u16 {
        self.minor
    }
}

impl PartialOrd for ApiVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ApiVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor).cmp(&(other.major, other.minor))
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ApiVersion {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BerthError::invalid_parameter(format!("invalid API version: {s:?}"));
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        let major = major.parse().map_err(|_| invalid())?;
        let minor = minor.parse().map_err(|_| invalid())?;
        Ok(Self::new(major, minor))
    }
}

/// Accepts `null` wherever the field's default is a valid value.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Creation-time configuration of a container, as exchanged over the API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerConfig {
    /// Hostname inside the container.
    pub hostname: String,
    /// User the process runs as.
    pub user: String,
    /// Memory limit in bytes (0 means unlimited).
    pub memory: i64,
    /// Memory plus swap limit in bytes; `-1` disables swap.
    pub memory_swap: i64,
    /// CPU shares (relative weight).
    pub cpu_shares: i64,
    /// Whether clients attach stdin by default.
    pub attach_stdin: bool,
    /// Whether clients attach stdout by default.
    pub attach_stdout: bool,
    /// Whether clients attach stderr by default.
    pub attach_stderr: bool,
    /// Exposed port specifications.
    #[serde(deserialize_with = "null_as_default")]
    pub port_specs: Vec<String>,
    /// Whether the process runs on a terminal.
    pub tty: bool,
    /// Whether the process gets an open stdin.
    pub open_stdin: bool,
    /// Close stdin after the first attached client disconnects.
    pub stdin_once: bool,
    /// Environment in `KEY=VALUE` form.
    #[serde(deserialize_with = "null_as_default")]
    pub env: Vec<String>,
    /// Command and arguments.
    #[serde(deserialize_with = "null_as_default")]
    pub cmd: Vec<String>,
    /// DNS servers.
    #[serde(deserialize_with = "null_as_default")]
    pub dns: Vec<String>,
    /// Image name as given by the operator.
    pub image: String,
    /// Volume mount points.
    #[serde(deserialize_with = "null_as_default")]
    pub volumes: BTreeMap<String, serde_json::Value>,
    /// Container whose volumes are shared.
    pub volumes_from: String,
    /// Entrypoint prepended to the command.
    #[serde(deserialize_with = "null_as_default")]
    pub entrypoint: Vec<String>,
    /// Disables networking.
    pub network_disabled: bool,
}

impl ContainerConfig {
    /// Fills unset command, environment and entrypoint from an image config.
    pub fn merge_from(&mut self, image: &Self) {
        if self.cmd.is_empty() {
            self.cmd.clone_from(&image.cmd);
        }
        if self.entrypoint.is_empty() {
            self.entrypoint.clone_from(&image.entrypoint);
        }
        if self.env.is_empty() {
            self.env.clone_from(&image.env);
        }
        if self.user.is_empty() {
            self.user.clone_from(&image.user);
        }
        if self.port_specs.is_empty() {
            self.port_specs.clone_from(&image.port_specs);
        }
    }
}

/// Host-side configuration supplied when a container is started.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Bind mounts in `host:container[:ro]` form.
    #[serde(rename = "Binds", deserialize_with = "null_as_default")]
    pub binds: Vec<String>,
    /// File the container id is written to.
    #[serde(rename = "ContainerIDFile")]
    pub container_id_file: String,
}

/// Kind of a filesystem change between a container and its image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ChangeKind {
    /// An existing path was modified.
    Modify,
    /// A path was added.
    Add,
    /// A path was deleted.
    Delete,
}

impl From<ChangeKind> for u8 {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Modify => 0,
            ChangeKind::Add => 1,
            ChangeKind::Delete => 2,
        }
    }
}

impl TryFrom<u8> for ChangeKind {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Modify),
            1 => Ok(Self::Add),
            2 => Ok(Self::Delete),
            other => Err(format!("unknown change kind {other}")),
        }
    }
}

/// A single filesystem change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Change {
    /// Absolute path inside the container.
    pub path: String,
    /// What happened to the path.
    pub kind: ChangeKind,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ChangeKind::Modify => "C",
            ChangeKind::Add => "A",
            ChangeKind::Delete => "D",
        };
        write!(f, "{kind} {}", self.path)
    }
}

//! Wire types of the management API.

use std::collections::BTreeMap;

use berth_common::types::{ContainerConfig, HostConfig};
use berth_runtime::backend::Image;
use berth_runtime::state::StateSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Saturating conversion for sizes reported as signed integers.
#[must_use]
pub fn signed_size(size: u64) -> i64 {
    i64::try_from(size).unwrap_or(i64::MAX)
}

/// `GET /version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionResponse {
    /// Daemon release.
    pub version: String,
    /// Newest API version served.
    pub api_version: String,
    /// Host operating system.
    pub os: String,
    /// Host architecture.
    pub arch: String,
    /// Commit the daemon was built from, when known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub git_commit: Option<String>,
}

/// `GET /info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InfoResponse {
    /// Whether the daemon runs in debug mode.
    pub debug: bool,
    /// Known containers.
    pub containers: usize,
    /// Known images.
    pub images: usize,
    /// Open file descriptors of the daemon.
    #[serde(rename = "NFd")]
    pub n_fd: usize,
    /// Live tasks of the daemon's async runtime.
    #[serde(rename = "NGoroutines")]
    pub n_goroutines: usize,
    /// Connected event listeners.
    #[serde(rename = "NEventsListener")]
    pub n_events_listener: usize,
    /// Kernel release of the host.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub kernel_version: String,
    /// Whether IPv4 forwarding is enabled on the host.
    #[serde(rename = "IPv4Forwarding")]
    pub ipv4_forwarding: bool,
}

/// One row of `GET /containers/json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    /// Container id.
    #[serde(rename = "Id")]
    pub id: String,
    /// Names, each with a leading `/`.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub names: Vec<String>,
    /// Image reference or short id.
    pub image: String,
    /// Command line.
    pub command: String,
    /// Creation time, unix seconds.
    pub created: i64,
    /// Human-readable state.
    pub status: String,
    /// Published ports.
    pub ports: String,
    /// Size of the writable layer, when requested.
    pub size_rw: i64,
    /// Size of the whole filesystem, when requested.
    pub size_root_fs: i64,
}

/// `POST /containers/create` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateResponse {
    /// New container id.
    #[serde(rename = "Id")]
    pub id: String,
    /// Non-fatal remarks about the configuration.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<String>,
}

/// Network settings shown by inspect; networking is not managed here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkSettings {
    /// Container address.
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    /// Prefix length of the address.
    #[serde(rename = "IPPrefixLen")]
    pub ip_prefix_len: u8,
    /// Default gateway.
    pub gateway: String,
    /// Host bridge.
    pub bridge: String,
}

/// `GET /containers/{name}/json`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    /// Container id.
    #[serde(rename = "ID")]
    pub id: String,
    /// Operator-chosen name.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Executable.
    pub path: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Creation configuration.
    pub config: ContainerConfig,
    /// Lifecycle state.
    pub state: StateSnapshot,
    /// Image id.
    pub image: String,
    /// Network settings.
    pub network_settings: NetworkSettings,
    /// Host volume paths by container path.
    pub volumes: BTreeMap<String, String>,
    /// Writability of each volume.
    #[serde(rename = "VolumesRW")]
    pub volumes_rw: BTreeMap<String, bool>,
    /// Host configuration of the latest start.
    pub host_config: HostConfig,
}

/// `POST /containers/{name}/wait` response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitResponse {
    /// Exit code of the container process.
    pub status_code: i32,
}

/// Body of `POST /containers/{name}/copy`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CopyRequest {
    /// Path inside the container.
    pub resource: String,
}

/// A bare `{Id}` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdResponse {
    /// Identifier of the created object.
    #[serde(rename = "Id")]
    pub id: String,
}

/// One row of `GET /images/json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    /// Repository, `<none>` for untagged images.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub repository: String,
    /// Tag, `<none>` for untagged images.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub tag: String,
    /// Image id.
    #[serde(rename = "Id")]
    pub id: String,
    /// Creation time, unix seconds.
    pub created: i64,
    /// Size of the image's own layer.
    pub size: i64,
    /// Size including all ancestors.
    pub virtual_size: i64,
}

/// `GET /images/{name}/json`.
#[derive(Debug, Clone, Serialize)]
pub struct ImageInspect {
    /// Image id.
    pub id: String,
    /// Parent image id.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parent: String,
    /// Commit message.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub comment: String,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Container the image was committed from.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub container: String,
    /// Configuration of that container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_config: Option<ContainerConfig>,
    /// Daemon release that created the image.
    pub docker_version: String,
    /// Author of the commit.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub author: String,
    /// Default run configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<ContainerConfig>,
    /// Host architecture.
    pub architecture: String,
    /// Size of the layer.
    #[serde(rename = "Size")]
    pub size: i64,
}

impl From<Image> for ImageInspect {
    fn from(image: Image) -> Self {
        Self {
            id: image.id.to_string(),
            parent: image.parent.map(|p| p.to_string()).unwrap_or_default(),
            comment: image.comment,
            created: image.created,
            container: image.container.map(|c| c.to_string()).unwrap_or_default(),
            container_config: image.container_config,
            docker_version: berth_common::constants::DAEMON_VERSION.to_string(),
            author: image.author,
            config: image.config,
            architecture: std::env::consts::ARCH.to_string(),
            size: signed_size(image.size),
        }
    }
}

/// One entry of `GET /images/{name}/history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HistoryEntry {
    /// Image id.
    #[serde(rename = "Id")]
    pub id: String,
    /// References pointing at the image.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
    /// Creation time, unix seconds.
    pub created: i64,
    /// Command of the container the image was committed from.
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub created_by: String,
}

/// One step of `DELETE /images/{name}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteEntry {
    /// Id of a deleted image.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deleted: Option<String>,
    /// Reference that was removed.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub untagged: Option<String>,
}

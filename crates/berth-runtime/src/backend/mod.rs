//! Interfaces to the collaborators the control plane drives.
//!
//! The engine never forks processes, stores images or touches layer content
//! itself. It goes through the three traits below, each with one reference
//! implementation in a submodule.

pub mod graph;
pub mod host;
pub mod layers;

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use berth_common::error::Result;
use berth_common::types::{Change, ContainerConfig, ContainerId, ImageId};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::stdio::{OutputReader, StdinWriter};

pub use graph::MemoryGraph;
pub use host::HostSupervisor;
pub use layers::DirLayers;

/// Chunked byte stream produced by export and copy.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Everything the supervisor needs to start a container process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Container the process belongs to.
    pub container: ContainerId,
    /// Executable.
    pub path: String,
    /// Arguments after the executable.
    pub args: Vec<String>,
    /// Environment in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// Working directory of the process.
    pub working_dir: PathBuf,
    /// Whether stdin is piped.
    pub open_stdin: bool,
}

/// Raw pipes of a freshly spawned process.
#[derive(Default)]
pub struct ProcessStdio {
    /// Stdin pipe, when the container has an open stdin.
    pub stdin: Option<StdinWriter>,
    /// Stdout pipe.
    pub stdout: Option<OutputReader>,
    /// Stderr pipe.
    pub stderr: Option<OutputReader>,
}

/// A process handed over by the supervisor.
pub struct SpawnedProcess {
    /// Host PID.
    pub pid: u32,
    /// Raw pipes.
    pub stdio: ProcessStdio,
    /// Resolves to the exit code once the process has been reaped.
    pub exit: BoxFuture<'static, i32>,
}

impl std::fmt::Debug for SpawnedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedProcess")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Forks, signals and inspects container processes.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Starts the container process.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started.
    async fn spawn(&self, spec: &ProcessSpec) -> Result<SpawnedProcess>;

    /// Delivers `signal` to `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the process does not exist or cannot be signaled.
    fn signal(&self, pid: u32, signal: Signal) -> Result<()>;

    /// Lists `pid` and all of its descendants.
    ///
    /// # Errors
    ///
    /// Returns an error if the process table cannot be read.
    async fn processes(&self, pid: u32) -> Result<Vec<u32>>;
}

/// Metadata of one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// Image id.
    pub id: ImageId,
    /// Parent image, if any.
    pub parent: Option<ImageId>,
    /// Free-form comment given at commit.
    pub comment: String,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Container the image was committed from.
    pub container: Option<ContainerId>,
    /// Configuration of that container at commit time.
    pub container_config: Option<ContainerConfig>,
    /// Author given at commit.
    pub author: String,
    /// Default run configuration.
    pub config: Option<ContainerConfig>,
    /// Size of this layer in bytes.
    pub size: u64,
}

impl Image {
    /// A parentless image with no metadata.
    #[must_use]
    pub fn new(id: ImageId) -> Self {
        Self {
            id,
            parent: None,
            comment: String::new(),
            created: Utc::now(),
            container: None,
            container_config: None,
            author: String::new(),
            config: None,
            size: 0,
        }
    }
}

/// One `repository:tag` reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RepoTag {
    /// Repository name, possibly with `/`.
    pub repository: String,
    /// Tag within the repository.
    pub tag: String,
}

impl std::fmt::Display for RepoTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Image metadata store with a repository/tag table.
pub trait ImageGraph: Send + Sync {
    /// Resolves an id, id prefix, `repo:tag` or `repo` (tag `latest`).
    ///
    /// # Errors
    ///
    /// Returns [`berth_common::error::BerthError::NotFound`] when nothing matches.
    fn lookup(&self, name: &str) -> Result<Image>;

    /// Every image, in no particular order.
    fn list(&self) -> Vec<Image>;

    /// Adds an image.
    ///
    /// # Errors
    ///
    /// Returns a conflict if the id is already registered or the parent is
    /// unknown.
    fn register(&self, image: Image) -> Result<()>;

    /// Points `repository:tag` at `id`.
    ///
    /// # Errors
    ///
    /// Returns a conflict if the tag exists for another image and `force` is
    /// unset, or not-found if `id` is unknown.
    fn tag(&self, id: &ImageId, repository: &str, tag: &str, force: bool) -> Result<()>;

    /// Removes `repository:tag`, returning the image it pointed at.
    fn untag(&self, repository: &str, tag: &str) -> Option<ImageId>;

    /// Every reference to `id`, sorted.
    fn references(&self, id: &ImageId) -> Vec<RepoTag>;

    /// Removes an image's metadata.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown ids and a conflict while children exist.
    fn delete(&self, id: &ImageId) -> Result<()>;

    /// Direct children of `id`.
    fn children(&self, id: &ImageId) -> Vec<Image>;

    /// `id` followed by its ancestors, nearest first.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown ids.
    fn history(&self, id: &ImageId) -> Result<Vec<Image>>;
}

/// Container filesystem layers.
#[async_trait]
pub trait Layers: Send + Sync {
    /// Creates the empty layer of a new image and returns its directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    async fn create_image_layer(&self, image: &ImageId) -> Result<PathBuf>;

    /// Creates the writable layer of a container and returns the directory
    /// its process runs in.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    async fn prepare(&self, container: &ContainerId) -> Result<PathBuf>;

    /// Changes of the container relative to `lineage` (image first, then its
    /// ancestors).
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be read.
    async fn diff(&self, container: &ContainerId, lineage: &[ImageId]) -> Result<Vec<Change>>;

    /// Tar stream of the container's merged filesystem.
    ///
    /// # Errors
    ///
    /// Returns an error if the export cannot be started.
    async fn export(&self, container: &ContainerId, lineage: &[ImageId]) -> Result<ByteStream>;

    /// Tar stream of one path of the container's merged filesystem.
    ///
    /// # Errors
    ///
    /// Returns not-found if `resource` does not exist.
    async fn copy(
        &self,
        container: &ContainerId,
        lineage: &[ImageId],
        resource: &str,
    ) -> Result<ByteStream>;

    /// Captures the container's writable layer as the layer of `image` and
    /// returns its size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer cannot be copied.
    async fn commit(&self, container: &ContainerId, image: &ImageId) -> Result<u64>;

    /// Bytes held by regular files of the container's writable layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer cannot be read.
    async fn size(&self, container: &ContainerId) -> Result<u64>;

    /// Removes the container's writable layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed.
    async fn remove(&self, container: &ContainerId) -> Result<()>;

    /// Removes an image layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed.
    async fn remove_image(&self, image: &ImageId) -> Result<()>;
}

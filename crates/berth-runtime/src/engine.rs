//! Runtime engine that orchestrates container and image lifecycle.
//!
//! The engine owns the container table and is the only place that records
//! lifecycle events. Table lookups take a short read lock; every transition
//! of one container is serialized by that container's own lifecycle lock, so
//! work on two different containers never contends.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use berth_common::config::DaemonConfig;
use berth_common::constants::MIN_MEMORY_LIMIT;
use berth_common::error::{BerthError, Result};
use berth_common::types::{Change, ContainerConfig, ContainerId, HostConfig, ImageId};
use nix::sys::signal::Signal;

use crate::backend::graph::{DEFAULT_TAG, parse_repository_tag};
use crate::backend::{
    ByteStream, DirLayers, HostSupervisor, Image, ImageGraph, Layers, MemoryGraph, ProcessSpec,
    ProcessSupervisor, RepoTag,
};
use crate::container::Container;
use crate::events::EventBus;
use crate::logs::{self, LogEntry, LogSink};
use crate::stdio::ContainerStdio;
use crate::top::{self, TopResult};

/// Filters of a container listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Include stopped containers.
    pub all: bool,
    /// Show at most this many containers.
    pub limit: Option<usize>,
    /// Only containers created after this one.
    pub since: Option<String>,
    /// Only containers created before this one.
    pub before: Option<String>,
}

/// Parameters of a commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitOptions {
    /// Repository to tag the new image into.
    pub repository: Option<String>,
    /// Tag within the repository.
    pub tag: Option<String>,
    /// Commit message.
    pub comment: String,
    /// Author of the commit.
    pub author: String,
    /// Run configuration of the new image; defaults to the container's.
    pub config: Option<ContainerConfig>,
}

/// One row of an image listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageListing {
    /// Repository and tag, `None` for untagged images.
    pub reference: Option<RepoTag>,
    /// The image.
    pub image: Image,
    /// Size of the image plus all of its ancestors.
    pub virtual_size: u64,
}

/// Outcome of one step of an image delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageDelete {
    /// A `repository:tag` reference was removed.
    Untagged(String),
    /// An image was removed.
    Deleted(ImageId),
}

/// Counters reported by `/info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineInfo {
    /// Containers known to the daemon.
    pub containers: usize,
    /// Images in the graph.
    pub images: usize,
    /// Connected event listeners.
    pub event_listeners: usize,
}

/// The runtime engine that coordinates all container and image operations.
pub struct Engine {
    containers: RwLock<HashMap<ContainerId, Arc<Container>>>,
    events: Arc<EventBus>,
    supervisor: Arc<dyn ProcessSupervisor>,
    graph: Arc<dyn ImageGraph>,
    layers: Arc<dyn Layers>,
    data_dir: PathBuf,
    stop_timeout: Duration,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.data_dir)
            .field("stop_timeout", &self.stop_timeout)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine with the host supervisor, an in-memory image graph
    /// and directory layers under the configured data dir.
    #[must_use]
    pub fn new(config: &DaemonConfig) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(HostSupervisor::new()),
            Arc::new(MemoryGraph::new()),
            Arc::new(DirLayers::new(&config.data_dir)),
        )
    }

    /// Creates an engine over explicit collaborators.
    #[must_use]
    pub fn with_collaborators(
        config: &DaemonConfig,
        supervisor: Arc<dyn ProcessSupervisor>,
        graph: Arc<dyn ImageGraph>,
        layers: Arc<dyn Layers>,
    ) -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            events: Arc::new(EventBus::new(
                config.event_log_capacity,
                config.listener_buffer,
            )),
            supervisor,
            graph,
            layers,
            data_dir: config.data_dir.clone(),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
        }
    }

    fn table(&self) -> RwLockReadGuard<'_, HashMap<ContainerId, Arc<Container>>> {
        self.containers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn table_mut(&self) -> RwLockWriteGuard<'_, HashMap<ContainerId, Arc<Container>>> {
        self.containers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Shared event bus.
    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Data directory of the daemon.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Default grace period of stop and restart.
    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Counters for `/info`.
    #[must_use]
    pub fn info(&self) -> EngineInfo {
        EngineInfo {
            containers: self.table().len(),
            images: self.graph.list().len(),
            event_listeners: self.events.listener_count(),
        }
    }

    // -- containers ---------------------------------------------------------

    /// Resolves a container by name, full id or unique id prefix.
    ///
    /// # Errors
    ///
    /// Returns not-found when nothing matches and an invalid parameter when a
    /// prefix is ambiguous.
    pub fn get(&self, name: &str) -> Result<Arc<Container>> {
        let table = self.table();
        if let Some(container) = table.get(&ContainerId::new(name)) {
            return Ok(Arc::clone(container));
        }
        if let Some(container) = table.values().find(|c| c.name.as_deref() == Some(name)) {
            return Ok(Arc::clone(container));
        }
        if !name.is_empty() {
            let mut matches = table.values().filter(|c| c.id.as_str().starts_with(name));
            if let Some(first) = matches.next() {
                if matches.next().is_some() {
                    return Err(BerthError::invalid_parameter(format!(
                        "container id prefix {name} is ambiguous"
                    )));
                }
                return Ok(Arc::clone(first));
            }
        }
        Err(BerthError::container_not_found(name))
    }

    /// Creates a container from `config` and returns it with any warnings.
    ///
    /// # Errors
    ///
    /// Returns an invalid parameter for a memory limit below the minimum or a
    /// missing command, not-found for an unknown image, and a conflict for a
    /// name already in use.
    pub async fn create(
        &self,
        mut config: ContainerConfig,
        name: Option<String>,
    ) -> Result<(Arc<Container>, Vec<String>)> {
        if config.memory != 0 && config.memory < MIN_MEMORY_LIMIT {
            return Err(BerthError::invalid_parameter(
                "minimum memory limit allowed is 512k",
            ));
        }
        let image = self.graph.lookup(&config.image)?;
        if let Some(defaults) = &image.config {
            config.merge_from(defaults);
        }
        if config.cmd.is_empty() && config.entrypoint.is_empty() {
            return Err(BerthError::invalid_parameter("no command specified"));
        }
        if let Some(name) = &name {
            if self.table().values().any(|c| c.name.as_ref() == Some(name)) {
                return Err(BerthError::conflict(format!("name {name} is already in use")));
            }
        }

        let mut warnings = Vec::new();
        if config.memory > 0 && config.memory_swap > 0 && config.memory_swap < config.memory {
            warnings.push("MemorySwap is lower than Memory and will be ignored".to_string());
        }

        let id = ContainerId::generate();
        let rootfs = self.layers.prepare(&id).await?;
        let container = Arc::new(Container::new(id.clone(), name, config, image.id, rootfs));
        let _ = self.table_mut().insert(id.clone(), Arc::clone(&container));

        tracing::info!(id = %id, image = %container.image, "container created");
        let _ = self.events.log_event("create", id.as_str());
        Ok((container, warnings))
    }

    /// Lists containers, newest first.
    ///
    /// # Errors
    ///
    /// Returns not-found if `since` or `before` names an unknown container.
    pub fn list(&self, options: &ListOptions) -> Result<Vec<Arc<Container>>> {
        let since = options.since.as_deref().map(|name| self.get(name)).transpose()?;
        let before = options.before.as_deref().map(|name| self.get(name)).transpose()?;
        let only_running =
            !options.all && options.limit.is_none() && since.is_none() && before.is_none();

        let mut containers: Vec<Arc<Container>> = self.table().values().cloned().collect();
        containers.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id)));

        let mut found_before = before.is_none();
        let mut out = Vec::new();
        for container in containers {
            if only_running && !container.state.is_running() {
                continue;
            }
            if let Some(before) = &before {
                if before.id == container.id {
                    found_before = true;
                    continue;
                }
            }
            if !found_before {
                continue;
            }
            if options.limit == Some(out.len()) {
                break;
            }
            if since.as_ref().is_some_and(|since| since.id == container.id) {
                break;
            }
            out.push(container);
        }
        Ok(out)
    }

    /// Starts a stopped container.
    ///
    /// # Errors
    ///
    /// Returns a conflict if the container is running, or the supervisor's
    /// error if the process cannot be spawned.
    pub async fn start(&self, name: &str, host_config: Option<HostConfig>) -> Result<()> {
        let container = self.get(name)?;
        let _guard = container.lock_lifecycle().await;
        self.start_locked(&container, host_config).await?;
        let _ = self.events.log_event("start", container.id.as_str());
        Ok(())
    }

    async fn start_locked(&self, container: &Arc<Container>, host_config: Option<HostConfig>) -> Result<()> {
        if container.state.is_running() {
            return Err(BerthError::conflict(format!(
                "container {} is already running",
                container.id.short()
            )));
        }
        if let Some(host_config) = host_config {
            container.set_host_config(host_config);
        }

        let log = match LogSink::open(&self.data_dir, container.id.as_str()).await {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => {
                tracing::warn!(id = %container.id, error = %e, "container log unavailable");
                None
            }
        };

        let spec = ProcessSpec {
            container: container.id.clone(),
            path: container.path.clone(),
            args: container.args.clone(),
            env: container.config.env.clone(),
            working_dir: container.rootfs().to_path_buf(),
            open_stdin: container.config.open_stdin,
        };
        let spawned = self.supervisor.spawn(&spec).await?;
        let pid = spawned.pid;
        let (stdio, _pumps) = ContainerStdio::wire(
            spawned.stdio.stdin,
            spawned.stdio.stdout,
            spawned.stdio.stderr,
            log,
        );
        container.set_stdio(stdio.clone());
        container.state.set_running(pid);
        tracing::info!(id = %container.id, pid, "container started");

        let monitored = Arc::clone(container);
        let events = Arc::clone(&self.events);
        let exit = spawned.exit;
        drop(tokio::spawn(async move {
            let code = exit.await;
            monitored.state.set_stopped(code);
            let _ = events.log_event("die", monitored.id.as_str());
            tracing::info!(id = %monitored.id, exit_code = code, "container exited");
            stdio.stdin.close().await;
        }));
        Ok(())
    }

    /// Stops a container: SIGTERM, then SIGKILL after `timeout`.
    ///
    /// Stopping a stopped container succeeds without effect.
    ///
    /// # Errors
    ///
    /// Returns a conflict for a ghost container.
    pub async fn stop(&self, name: &str, timeout: Option<Duration>) -> Result<()> {
        let container = self.get(name)?;
        let _guard = container.lock_lifecycle().await;
        if self.stop_locked(&container, timeout.unwrap_or(self.stop_timeout)).await? {
            let _ = self.events.log_event("stop", container.id.as_str());
        }
        Ok(())
    }

    /// Returns whether a running process was stopped.
    async fn stop_locked(&self, container: &Container, timeout: Duration) -> Result<bool> {
        let snapshot = container.state.snapshot();
        if !snapshot.running {
            return Ok(false);
        }
        if snapshot.ghost {
            return Err(BerthError::conflict(format!(
                "cannot stop ghost container {}",
                container.id.short()
            )));
        }

        if let Err(e) = self.supervisor.signal(snapshot.pid, Signal::SIGTERM) {
            tracing::warn!(id = %container.id, error = %e, "SIGTERM failed, killing");
            return self.kill_locked(container).await.map(|()| true);
        }
        if tokio::time::timeout(timeout, container.state.wait_stopped())
            .await
            .is_err()
        {
            tracing::info!(id = %container.id, ?timeout, "container ignored SIGTERM, killing");
            self.kill_locked(container).await?;
        }
        tracing::info!(id = %container.id, "container stopped");
        Ok(true)
    }

    /// Kills a running container with SIGKILL and waits for it to exit.
    ///
    /// # Errors
    ///
    /// Returns a conflict for a ghost container.
    pub async fn kill(&self, name: &str) -> Result<()> {
        let container = self.get(name)?;
        let _guard = container.lock_lifecycle().await;
        let snapshot = container.state.snapshot();
        if !snapshot.running {
            return Ok(());
        }
        if snapshot.ghost {
            return Err(BerthError::conflict(format!(
                "cannot kill ghost container {}",
                container.id.short()
            )));
        }
        self.kill_locked(&container).await?;
        let _ = self.events.log_event("kill", container.id.as_str());
        Ok(())
    }

    async fn kill_locked(&self, container: &Container) -> Result<()> {
        let pid = container.state.snapshot().pid;
        if pid == 0 {
            return Ok(());
        }
        if let Err(e) = self.supervisor.signal(pid, Signal::SIGKILL) {
            // The process may have exited between the check and the signal.
            if container.state.is_running() {
                return Err(e);
            }
        }
        let _ = container.state.wait_stopped().await;
        tracing::info!(id = %container.id, "container killed");
        Ok(())
    }

    /// Stops (if running) and starts a container again.
    ///
    /// # Errors
    ///
    /// Returns a conflict for a ghost container, or the start error.
    pub async fn restart(&self, name: &str, timeout: Option<Duration>) -> Result<()> {
        let container = self.get(name)?;
        let _guard = container.lock_lifecycle().await;
        let _ = self
            .stop_locked(&container, timeout.unwrap_or(self.stop_timeout))
            .await?;
        self.start_locked(&container, None).await?;
        let _ = self.events.log_event("restart", container.id.as_str());
        Ok(())
    }

    /// Waits for a container to stop and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown containers.
    pub async fn wait(&self, name: &str) -> Result<i32> {
        let container = self.get(name)?;
        Ok(container.state.wait_stopped().await)
    }

    /// Removes a stopped container with its layer and logs.
    ///
    /// # Errors
    ///
    /// Returns a conflict if the container is running.
    pub async fn destroy(&self, name: &str) -> Result<()> {
        let container = self.get(name)?;
        let _guard = container.lock_lifecycle().await;
        if container.state.is_running() {
            return Err(BerthError::conflict(format!(
                "cannot remove running container {}, stop it first",
                container.id.short()
            )));
        }
        self.layers.remove(&container.id).await?;
        let _ = self.table_mut().remove(&container.id);
        let dir = logs::container_dir(&self.data_dir, container.id.as_str());
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(id = %container.id, error = %e, "failed to remove container directory");
            }
        }
        tracing::info!(id = %container.id, "container removed");
        let _ = self.events.log_event("destroy", container.id.as_str());
        Ok(())
    }

    fn lineage(&self, image: &ImageId) -> Result<Vec<ImageId>> {
        Ok(self
            .graph
            .history(image)?
            .into_iter()
            .map(|image| image.id)
            .collect())
    }

    /// Filesystem changes of a container relative to its image.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown containers, or a layer error.
    pub async fn changes(&self, name: &str) -> Result<Vec<Change>> {
        let container = self.get(name)?;
        let lineage = self.lineage(&container.image)?;
        self.layers.diff(&container.id, &lineage).await
    }

    /// Tar stream of a container's filesystem.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown containers, or a layer error.
    pub async fn export(&self, name: &str) -> Result<ByteStream> {
        let container = self.get(name)?;
        let lineage = self.lineage(&container.image)?;
        let stream = self.layers.export(&container.id, &lineage).await?;
        let _ = self.events.log_event("export", container.id.as_str());
        Ok(stream)
    }

    /// Tar stream of one path inside a container.
    ///
    /// # Errors
    ///
    /// Returns an invalid parameter for an empty resource and not-found for a
    /// missing path.
    pub async fn copy(&self, name: &str, resource: &str) -> Result<ByteStream> {
        if resource.is_empty() {
            return Err(BerthError::invalid_parameter("path cannot be empty"));
        }
        let container = self.get(name)?;
        let lineage = self.lineage(&container.image)?;
        self.layers.copy(&container.id, &lineage, resource).await
    }

    /// Processes of a running container as reported by `ps`.
    ///
    /// # Errors
    ///
    /// Returns a conflict if the container is not running.
    pub async fn top(&self, name: &str, ps_args: &str) -> Result<TopResult> {
        let container = self.get(name)?;
        let snapshot = container.state.snapshot();
        if !snapshot.running {
            return Err(BerthError::conflict(format!(
                "container {} is not running",
                container.id.short()
            )));
        }
        let pids = self.supervisor.processes(snapshot.pid).await?;
        top::top(ps_args, &pids).await
    }

    /// Size of a container's writable layer and of its whole filesystem.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer or the image ancestry cannot be read.
    pub async fn size(&self, container: &Container) -> Result<(u64, u64)> {
        let rw = self.layers.size(&container.id).await?;
        let images: u64 = self
            .graph
            .history(&container.image)?
            .iter()
            .map(|image| image.size)
            .sum();
        Ok((rw, rw + images))
    }

    /// Logged output of a container, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the log exists but cannot be read.
    pub async fn logs(&self, container: &Container) -> Result<Vec<LogEntry>> {
        let data_dir = self.data_dir.clone();
        let id = container.id.clone();
        tokio::task::spawn_blocking(move || logs::read_logs(&data_dir, id.as_str()))
            .await
            .map_err(|e| BerthError::process(format!("log read failed: {e}")))?
    }

    /// Captures a container's writable layer as a new image.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown containers, or a layer or graph error.
    pub async fn commit(&self, name: &str, options: CommitOptions) -> Result<ImageId> {
        let container = self.get(name)?;
        let id = ImageId::generate();
        let size = self.layers.commit(&container.id, &id).await?;

        let mut image = Image::new(id.clone());
        image.parent = Some(container.image.clone());
        image.comment = options.comment;
        image.author = options.author;
        image.container = Some(container.id.clone());
        image.container_config = Some(container.config.clone());
        image.config = Some(options.config.unwrap_or_else(|| container.config.clone()));
        image.size = size;
        self.graph.register(image)?;

        if let Some(repository) = options.repository.filter(|r| !r.is_empty()) {
            let tag = options.tag.unwrap_or_default();
            self.graph.tag(&id, &repository, &tag, true)?;
            let _ = self.events.log_event("tag", id.as_str());
        }
        tracing::info!(id = %id, container = %container.id, "container committed");
        Ok(id)
    }

    // -- images -------------------------------------------------------------

    /// Creates an empty, parentless image tagged `repository:tag`.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer cannot be created or the tag is taken.
    pub async fn create_image(
        &self,
        repository: &str,
        tag: &str,
        config: Option<ContainerConfig>,
    ) -> Result<ImageId> {
        let id = ImageId::generate();
        let _ = self.layers.create_image_layer(&id).await?;
        let mut image = Image::new(id.clone());
        image.config = config;
        self.graph.register(image)?;
        self.graph.tag(&id, repository, tag, false)?;
        tracing::info!(id = %id, repository, tag, "image created");
        Ok(id)
    }

    /// Resolves an image by id, prefix or reference.
    ///
    /// # Errors
    ///
    /// Returns not-found when nothing matches.
    pub fn image(&self, name: &str) -> Result<Image> {
        self.graph.lookup(name)
    }

    /// References pointing at an image.
    #[must_use]
    pub fn image_references(&self, id: &ImageId) -> Vec<RepoTag> {
        self.graph.references(id)
    }

    /// Image listing, one row per reference; untagged images only with `all`.
    ///
    /// A non-empty `filter` keeps only that repository.
    ///
    /// # Errors
    ///
    /// Returns an error if an image's ancestry is broken.
    pub fn images(&self, all: bool, filter: &str) -> Result<Vec<ImageListing>> {
        let mut rows = Vec::new();
        for image in self.graph.list() {
            let virtual_size = self.graph.history(&image.id)?.iter().map(|i| i.size).sum();
            let references = self.graph.references(&image.id);
            if references.is_empty() {
                if all && filter.is_empty() {
                    rows.push(ImageListing {
                        reference: None,
                        image,
                        virtual_size,
                    });
                }
                continue;
            }
            for reference in references {
                if !filter.is_empty() && reference.repository != filter {
                    continue;
                }
                rows.push(ImageListing {
                    reference: Some(reference),
                    image: image.clone(),
                    virtual_size,
                });
            }
        }
        rows.sort_by(|a, b| {
            b.image
                .created
                .cmp(&a.image.created)
                .then_with(|| a.reference.cmp(&b.reference))
        });
        Ok(rows)
    }

    /// An image followed by its ancestors.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown images.
    pub fn history(&self, name: &str) -> Result<Vec<Image>> {
        let image = self.graph.lookup(name)?;
        self.graph.history(&image.id)
    }

    /// Tags an image into `repository`.
    ///
    /// # Errors
    ///
    /// Returns not-found for unknown images and a conflict for a taken tag
    /// without `force`.
    pub fn tag(&self, name: &str, repository: &str, tag: &str, force: bool) -> Result<()> {
        let image = self.graph.lookup(name)?;
        self.graph.tag(&image.id, repository, tag, force)
    }

    fn running_lineages(&self) -> Vec<(ContainerId, ImageId)> {
        self.table()
            .values()
            .filter(|c| c.state.is_running())
            .map(|c| (c.id.clone(), c.image.clone()))
            .collect()
    }

    fn used_by_container(&self, id: &ImageId) -> Option<ContainerId> {
        self.table()
            .values()
            .find(|c| &c.image == id)
            .map(|c| c.id.clone())
    }

    /// Untags and deletes an image.
    ///
    /// A `repository[:tag]` name removes that reference and deletes the image
    /// once nothing else refers to it. An id deletes the image outright. Parent
    /// images left untagged and unused are deleted along with it.
    ///
    /// # Errors
    ///
    /// Returns a conflict when a running container uses the image or one of
    /// its descendants, or when deleting by id an image that is tagged in
    /// several repositories, has children, or is used by a container.
    pub async fn delete_image(&self, name: &str) -> Result<Vec<ImageDelete>> {
        let image = self.graph.lookup(name)?;
        let id = image.id.clone();

        for (container, container_image) in self.running_lineages() {
            if self.lineage(&container_image)?.contains(&id) {
                return Err(BerthError::conflict(format!(
                    "cannot delete {name} because the running container {} is using it",
                    container.short()
                )));
            }
        }

        let (repository, tag) = parse_repository_tag(name);
        let by_reference = RepoTag {
            repository: repository.to_string(),
            tag: tag.unwrap_or(DEFAULT_TAG).to_string(),
        };
        let references = self.graph.references(&id);
        let mut out = Vec::new();

        if references.contains(&by_reference) {
            let _ = self.graph.untag(&by_reference.repository, &by_reference.tag);
            out.push(ImageDelete::Untagged(by_reference.to_string()));
            let _ = self.events.log_event("untag", id.as_str());
            if !self.graph.references(&id).is_empty()
                || !self.graph.children(&id).is_empty()
                || self.used_by_container(&id).is_some()
            {
                return Ok(out);
            }
        } else {
            let repositories: std::collections::BTreeSet<&str> =
                references.iter().map(|r| r.repository.as_str()).collect();
            if repositories.len() > 1 {
                return Err(BerthError::conflict(format!(
                    "cannot delete image {} because it is tagged in multiple repositories",
                    id.short()
                )));
            }
            if !self.graph.children(&id).is_empty() {
                return Err(BerthError::conflict(format!(
                    "cannot delete image {} because it has children",
                    id.short()
                )));
            }
            if let Some(container) = self.used_by_container(&id) {
                return Err(BerthError::conflict(format!(
                    "cannot delete image {} because it is used by container {}",
                    id.short(),
                    container.short()
                )));
            }
            for reference in references {
                let _ = self.graph.untag(&reference.repository, &reference.tag);
                out.push(ImageDelete::Untagged(reference.to_string()));
                let _ = self.events.log_event("untag", id.as_str());
            }
        }

        self.remove_image(&id).await?;
        out.push(ImageDelete::Deleted(id.clone()));

        let mut parent = image.parent;
        while let Some(current) = parent.take() {
            let Ok(candidate) = self.graph.lookup(current.as_str()) else {
                break;
            };
            if !self.graph.references(&current).is_empty()
                || !self.graph.children(&current).is_empty()
                || self.used_by_container(&current).is_some()
            {
                break;
            }
            self.remove_image(&current).await?;
            out.push(ImageDelete::Deleted(current));
            parent = candidate.parent;
        }
        Ok(out)
    }

    async fn remove_image(&self, id: &ImageId) -> Result<()> {
        self.graph.delete(id)?;
        self.layers.remove_image(id).await?;
        tracing::info!(id = %id, "image deleted");
        let _ = self.events.log_event("delete", id.as_str());
        Ok(())
    }

    /// Graphviz rendering of the image graph.
    #[must_use]
    pub fn viz(&self) -> String {
        let mut images = self.graph.list();
        images.sort_by(|a, b| a.id.cmp(&b.id));

        let mut out = String::from("digraph docker {\n");
        let mut labels: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for image in &images {
            match &image.parent {
                Some(parent) => out.push_str(&format!(" \"{}\" -> \"{}\"\n", parent.short(), image.id.short())),
                None => out.push_str(&format!(" base -> \"{}\" [style=invis]\n", image.id.short())),
            }
            let references = self.graph.references(&image.id);
            if !references.is_empty() {
                let _ = labels.insert(
                    image.id.short().to_string(),
                    references.iter().map(ToString::to_string).collect(),
                );
            }
        }
        for (id, references) in labels {
            out.push_str(&format!(
                " \"{id}\" [label=\"{id}\\n{}\\n\",shape=box,fillcolor=\"paleturquoise\",style=\"filled,rounded\"];\n",
                references.join("\\n")
            ));
        }
        out.push_str(" base [style=invisible]\n}\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;

    fn engine(dir: &Path) -> Engine {
        Engine::new(&DaemonConfig::with_data_dir(dir))
    }

    /// Directory layers whose container removal can be made to fail.
    struct StuckLayers {
        inner: DirLayers,
        stuck: AtomicBool,
    }

    #[async_trait]
    impl Layers for StuckLayers {
        async fn create_image_layer(&self, image: &ImageId) -> Result<PathBuf> {
            self.inner.create_image_layer(image).await
        }
        async fn prepare(&self, container: &ContainerId) -> Result<PathBuf> {
            self.inner.prepare(container).await
        }
        async fn diff(&self, container: &ContainerId, lineage: &[ImageId]) -> Result<Vec<Change>> {
            self.inner.diff(container, lineage).await
        }
        async fn export(&self, container: &ContainerId, lineage: &[ImageId]) -> Result<ByteStream> {
            self.inner.export(container, lineage).await
        }
        async fn copy(
            &self,
            container: &ContainerId,
            lineage: &[ImageId],
            resource: &str,
        ) -> Result<ByteStream> {
            self.inner.copy(container, lineage, resource).await
        }
        async fn commit(&self, container: &ContainerId, image: &ImageId) -> Result<u64> {
            self.inner.commit(container, image).await
        }
        async fn size(&self, container: &ContainerId) -> Result<u64> {
            self.inner.size(container).await
        }
        async fn remove(&self, container: &ContainerId) -> Result<()> {
            if self.stuck.load(Ordering::SeqCst) {
                return Err(BerthError::process("layer busy"));
            }
            self.inner.remove(container).await
        }
        async fn remove_image(&self, image: &ImageId) -> Result<()> {
            self.inner.remove_image(image).await
        }
    }

    async fn engine_with_image(dir: &Path) -> (Engine, ImageId) {
        let engine = engine(dir);
        let image = engine
            .create_image("base", "latest", None)
            .await
            .expect("image");
        (engine, image)
    }

    fn sleeper() -> ContainerConfig {
        ContainerConfig {
            image: "base".into(),
            cmd: vec!["/bin/sleep".into(), "30".into()],
            ..ContainerConfig::default()
        }
    }

    #[tokio::test]
    async fn create_rejects_small_memory_and_missing_command() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (engine, _) = engine_with_image(dir.path()).await;

        let small = ContainerConfig {
            memory: 1024,
            ..sleeper()
        };
        assert!(matches!(
            engine.create(small, None).await,
            Err(BerthError::InvalidParameter { .. })
        ));

        let no_cmd = ContainerConfig {
            image: "base".into(),
            ..ContainerConfig::default()
        };
        assert!(matches!(
            engine.create(no_cmd, None).await,
            Err(BerthError::InvalidParameter { .. })
        ));

        let unknown = ContainerConfig {
            image: "nope".into(),
            ..sleeper()
        };
        assert!(matches!(
            engine.create(unknown, None).await,
            Err(BerthError::NotFound { kind: "image", .. })
        ));
    }

    #[tokio::test]
    async fn lookup_by_prefix_and_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (engine, _) = engine_with_image(dir.path()).await;
        let (c, _) = engine
            .create(sleeper(), Some("web".into()))
            .await
            .expect("create");

        assert_eq!(engine.get(&c.id.as_str()[..8]).expect("prefix").id, c.id);
        assert_eq!(engine.get("web").expect("name").id, c.id);
        assert!(matches!(
            engine.create(sleeper(), Some("web".into())).await,
            Err(BerthError::Conflict { .. })
        ));
        assert!(matches!(
            engine.get("missing"),
            Err(BerthError::NotFound { kind: "container", .. })
        ));
    }

    #[tokio::test]
    async fn start_stop_lifecycle_emits_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (engine, _) = engine_with_image(dir.path()).await;
        let (c, _) = engine.create(sleeper(), None).await.expect("create");
        let id = c.id.as_str();

        engine.start(id, None).await.expect("start");
        assert!(c.state.is_running());
        assert!(matches!(
            engine.start(id, None).await,
            Err(BerthError::Conflict { .. })
        ));
        assert!(matches!(engine.destroy(id).await, Err(BerthError::Conflict { .. })));

        engine
            .stop(id, Some(Duration::from_secs(5)))
            .await
            .expect("stop");
        assert!(!c.state.is_running());
        assert_eq!(engine.wait(id).await.expect("wait"), 128 + 15);

        engine.destroy(id).await.expect("destroy");
        assert!(engine.get(id).is_err());

        let statuses: Vec<String> = engine
            .events()
            .events_since(0)
            .into_iter()
            .map(|e| e.status)
            .collect();
        assert_eq!(statuses.first().map(String::as_str), Some("create"));
        for status in ["start", "die", "stop", "destroy"] {
            assert!(statuses.iter().any(|s| s == status), "missing {status}");
        }
    }

    #[tokio::test]
    async fn list_shows_running_unless_all() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (engine, _) = engine_with_image(dir.path()).await;
        let (first, _) = engine.create(sleeper(), None).await.expect("create");
        let (second, _) = engine.create(sleeper(), None).await.expect("create");
        engine.start(second.id.as_str(), None).await.expect("start");

        let running = engine.list(&ListOptions::default()).expect("list");
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, second.id);

        let all = engine
            .list(&ListOptions {
                all: true,
                ..ListOptions::default()
            })
            .expect("list");
        assert_eq!(all.len(), 2);

        let limited = engine
            .list(&ListOptions {
                limit: Some(1),
                ..ListOptions::default()
            })
            .expect("list");
        assert_eq!(limited.len(), 1);

        engine.kill(second.id.as_str()).await.expect("kill");
        assert_eq!(engine.wait(second.id.as_str()).await.expect("wait"), 137);
        let _ = first;
    }

    #[tokio::test]
    async fn delete_image_semantics() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (engine, base) = engine_with_image(dir.path()).await;
        engine.tag("base", "other", "v1", false).expect("tag");

        assert!(matches!(
            engine.delete_image(base.as_str()).await,
            Err(BerthError::Conflict { .. })
        ));

        let untagged = engine.delete_image("other:v1").await.expect("untag");
        assert_eq!(untagged, [ImageDelete::Untagged("other:v1".into())]);

        let deleted = engine.delete_image("base").await.expect("delete");
        assert_eq!(
            deleted,
            [
                ImageDelete::Untagged("base:latest".into()),
                ImageDelete::Deleted(base.clone())
            ]
        );
        assert!(engine.image(base.as_str()).is_err());
    }

    #[tokio::test]
    async fn commit_creates_child_image_and_viz_shows_edge() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (engine, base) = engine_with_image(dir.path()).await;
        let (c, _) = engine.create(sleeper(), None).await.expect("create");
        std::fs::write(c.rootfs().join("hello"), "world").expect("write");

        let id = engine
            .commit(
                c.id.as_str(),
                CommitOptions {
                    repository: Some("snap".into()),
                    tag: Some("v1".into()),
                    author: "me".into(),
                    ..CommitOptions::default()
                },
            )
            .await
            .expect("commit");

        let image = engine.image("snap:v1").expect("lookup");
        assert_eq!(image.id, id);
        assert_eq!(image.parent.as_ref(), Some(&base));
        assert_eq!(image.size, 5);
        assert_eq!(engine.history("snap:v1").expect("history").len(), 2);

        let viz = engine.viz();
        assert!(viz.starts_with("digraph docker {"));
        assert!(viz.contains(&format!("\"{}\" -> \"{}\"", base.short(), id.short())));

        let rows = engine.images(false, "snap").expect("images");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].virtual_size, 5);
    }

    #[tokio::test]
    async fn failed_layer_removal_keeps_container_listed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = DaemonConfig::with_data_dir(dir.path());
        let layers = Arc::new(StuckLayers {
            inner: DirLayers::new(dir.path()),
            stuck: AtomicBool::new(true),
        });
        let engine = Engine::with_collaborators(
            &config,
            Arc::new(HostSupervisor::new()),
            Arc::new(MemoryGraph::new()),
            Arc::clone(&layers) as Arc<dyn Layers>,
        );
        let _ = engine
            .create_image("base", "latest", None)
            .await
            .expect("image");
        let (c, _) = engine.create(sleeper(), None).await.expect("create");
        let id = c.id.as_str();

        assert!(engine.destroy(id).await.is_err());
        assert!(engine.get(id).is_ok());

        layers.stuck.store(false, Ordering::SeqCst);
        engine.destroy(id).await.expect("destroy");
        assert!(matches!(engine.get(id), Err(BerthError::NotFound { .. })));
    }
}

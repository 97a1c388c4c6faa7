//! Directory-backed container layers.
//!
//! Each image owns `<root>/layers/<image-id>/`; each container owns a
//! writable directory `<root>/containers/<id>/rw/` that its process runs in.
//! A file named `.wh.<name>` in an upper layer hides `<name>` below it.

use std::collections::BTreeMap;
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use berth_common::error::{BerthError, Result};
use berth_common::types::{Change, ChangeKind, ContainerId, ImageId};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{ByteStream, Layers};

const WHITEOUT_PREFIX: &str = ".wh.";
const STREAM_BUFFER: usize = 32 * 1024;
const STREAM_CHANNEL: usize = 16;

/// Layers stored as plain directories under a root.
#[derive(Debug, Clone)]
pub struct DirLayers {
    root: PathBuf,
}

impl DirLayers {
    /// Creates layers rooted at `root` (usually the daemon data dir).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory of an image layer.
    #[must_use]
    pub fn layer_dir(&self, image: &ImageId) -> PathBuf {
        self.root.join("layers").join(image.as_str())
    }

    /// Writable directory of a container.
    #[must_use]
    pub fn rw_dir(&self, container: &ContainerId) -> PathBuf {
        crate::logs::container_dir(&self.root, container.as_str()).join("rw")
    }

    /// Layer directories from the container's rw layer down to the base image.
    fn stack(&self, container: &ContainerId, lineage: &[ImageId]) -> Vec<PathBuf> {
        std::iter::once(self.rw_dir(container))
            .chain(lineage.iter().map(|image| self.layer_dir(image)))
            .collect()
    }
}

/// Runs blocking filesystem work off the async workers.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| BerthError::process(format!("layer task failed: {e}")))?
}

/// Relative paths of everything below `dir`, parents before children.
fn walk(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let mut pending = vec![PathBuf::new()];
    while let Some(rel) = pending.pop() {
        let abs = dir.join(&rel);
        let entries = std::fs::read_dir(&abs).map_err(|e| BerthError::io(&abs, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| BerthError::io(&abs, e))?;
            let child = rel.join(entry.file_name());
            let file_type = entry.file_type().map_err(|e| BerthError::io(entry.path(), e))?;
            if file_type.is_dir() {
                pending.push(child.clone());
            }
            out.push(child);
        }
    }
    out.sort();
    Ok(out)
}

/// Path hidden by a whiteout entry, if `rel` is one.
fn whiteout_target(rel: &Path) -> Option<PathBuf> {
    let name = rel.file_name()?.to_str()?;
    let hidden = name.strip_prefix(WHITEOUT_PREFIX)?;
    Some(rel.with_file_name(hidden))
}

fn exists_in_any(layers: &[PathBuf], rel: &Path) -> bool {
    layers
        .iter()
        .any(|layer| layer.join(rel).symlink_metadata().is_ok())
}

fn remove_subtree(view: &mut BTreeMap<PathBuf, PathBuf>, rel: &Path) {
    view.retain(|path, _| !path.starts_with(rel));
}

/// Merged view of a layer stack (top first): relative path to source path.
fn merged_view(stack: &[PathBuf]) -> Result<BTreeMap<PathBuf, PathBuf>> {
    let mut view = BTreeMap::new();
    for layer in stack.iter().rev() {
        for rel in walk(layer)? {
            if let Some(hidden) = whiteout_target(&rel) {
                remove_subtree(&mut view, &hidden);
                continue;
            }
            let abs = layer.join(&rel);
            if !abs.is_dir() {
                remove_subtree(&mut view, &rel);
            }
            let _ = view.insert(rel, abs);
        }
    }
    Ok(view)
}

/// Normalizes an in-container path, refusing to climb out of the root.
fn container_relative(resource: &str) -> Result<PathBuf> {
    let mut rel = PathBuf::new();
    for component in Path::new(resource).components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(BerthError::invalid_parameter(format!(
                    "invalid resource path: {resource}"
                )));
            }
        }
    }
    Ok(rel)
}

/// `io::Write` adapter feeding an async byte stream from a blocking task.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive reader went away"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Streams a tar of `entries` (archive name, source path) in order.
fn tar_stream(entries: Vec<(PathBuf, PathBuf)>) -> ByteStream {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL);
    let errors = tx.clone();
    drop(tokio::task::spawn_blocking(move || {
        let writer = BufWriter::with_capacity(STREAM_BUFFER, ChannelWriter { tx });
        let mut builder = tar::Builder::new(writer);
        builder.follow_symlinks(false);
        let result = entries
            .iter()
            .try_for_each(|(name, source)| builder.append_path_with_name(source, name))
            .and_then(|()| builder.into_inner())
            .and_then(|mut writer| writer.flush());
        if let Err(e) = result {
            tracing::debug!(error = %e, "archive stream ended early");
            let _ = errors.blocking_send(Err(e));
        }
    }));
    ReceiverStream::new(rx).boxed()
}

fn copy_tree(from: &Path, to: &Path) -> Result<u64> {
    std::fs::create_dir_all(to).map_err(|e| BerthError::io(to, e))?;
    let mut size = 0;
    for rel in walk(from)? {
        let source = from.join(&rel);
        let target = to.join(&rel);
        let meta = source
            .symlink_metadata()
            .map_err(|e| BerthError::io(&source, e))?;
        if meta.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| BerthError::io(&target, e))?;
        } else if meta.file_type().is_symlink() {
            let link = std::fs::read_link(&source).map_err(|e| BerthError::io(&source, e))?;
            std::os::unix::fs::symlink(link, &target).map_err(|e| BerthError::io(&target, e))?;
        } else {
            size += std::fs::copy(&source, &target).map_err(|e| BerthError::io(&target, e))?;
        }
    }
    Ok(size)
}

fn tree_size(dir: &Path) -> Result<u64> {
    let mut size = 0;
    for rel in walk(dir)? {
        let path = dir.join(rel);
        let meta = path.symlink_metadata().map_err(|e| BerthError::io(&path, e))?;
        if meta.is_file() {
            size += meta.len();
        }
    }
    Ok(size)
}

fn remove_dir(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BerthError::io(path, e)),
    }
}

#[async_trait]
impl Layers for DirLayers {
    async fn create_image_layer(&self, image: &ImageId) -> Result<PathBuf> {
        let dir = self.layer_dir(image);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BerthError::io(&dir, e))?;
        Ok(dir)
    }

    async fn prepare(&self, container: &ContainerId) -> Result<PathBuf> {
        let dir = self.rw_dir(container);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BerthError::io(&dir, e))?;
        Ok(dir)
    }

    async fn diff(&self, container: &ContainerId, lineage: &[ImageId]) -> Result<Vec<Change>> {
        let rw = self.rw_dir(container);
        let lower: Vec<PathBuf> = lineage.iter().map(|image| self.layer_dir(image)).collect();
        blocking(move || {
            let mut changes = Vec::new();
            for rel in walk(&rw)? {
                let (path, kind) = match whiteout_target(&rel) {
                    Some(hidden) => (hidden, ChangeKind::Delete),
                    None if exists_in_any(&lower, &rel) => (rel, ChangeKind::Modify),
                    None => (rel, ChangeKind::Add),
                };
                changes.push(Change {
                    path: format!("/{}", path.display()),
                    kind,
                });
            }
            changes.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(changes)
        })
        .await
    }

    async fn export(&self, container: &ContainerId, lineage: &[ImageId]) -> Result<ByteStream> {
        let stack = self.stack(container, lineage);
        let view = blocking(move || merged_view(&stack)).await?;
        Ok(tar_stream(view.into_iter().collect()))
    }

    async fn copy(
        &self,
        container: &ContainerId,
        lineage: &[ImageId],
        resource: &str,
    ) -> Result<ByteStream> {
        let rel = container_relative(resource)?;
        let stack = self.stack(container, lineage);
        let view = blocking(move || merged_view(&stack)).await?;

        let base = rel.parent().map(Path::to_path_buf).unwrap_or_default();
        let entries: Vec<(PathBuf, PathBuf)> = view
            .into_iter()
            .filter(|(path, _)| rel.as_os_str().is_empty() || path.starts_with(&rel))
            .filter_map(|(path, source)| {
                let name = path.strip_prefix(&base).ok()?.to_path_buf();
                Some((name, source))
            })
            .collect();
        if entries.is_empty() {
            return Err(BerthError::NotFound {
                kind: "file",
                id: resource.to_string(),
            });
        }
        Ok(tar_stream(entries))
    }

    async fn commit(&self, container: &ContainerId, image: &ImageId) -> Result<u64> {
        let rw = self.rw_dir(container);
        let layer = self.layer_dir(image);
        blocking(move || copy_tree(&rw, &layer)).await
    }

    async fn size(&self, container: &ContainerId) -> Result<u64> {
        let rw = self.rw_dir(container);
        blocking(move || tree_size(&rw)).await
    }

    async fn remove(&self, container: &ContainerId) -> Result<()> {
        let rw = self.rw_dir(container);
        blocking(move || remove_dir(&rw)).await
    }

    async fn remove_image(&self, image: &ImageId) -> Result<()> {
        let layer = self.layer_dir(image);
        blocking(move || remove_dir(&layer)).await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use futures::TryStreamExt;

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        layers: DirLayers,
        container: ContainerId,
        image: ImageId,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let layers = DirLayers::new(dir.path());
        let image = ImageId::new("img1");
        let container = ContainerId::new("ctr1");

        let base = layers.create_image_layer(&image).await.expect("layer");
        std::fs::create_dir_all(base.join("etc")).expect("mkdir");
        std::fs::write(base.join("etc/hosts"), "base").expect("write");
        std::fs::write(base.join("etc/passwd"), "root").expect("write");
        std::fs::write(base.join("old"), "gone soon").expect("write");

        let rw = layers.prepare(&container).await.expect("prepare");
        std::fs::create_dir_all(rw.join("etc")).expect("mkdir");
        std::fs::write(rw.join("etc/hosts"), "changed").expect("write");
        std::fs::write(rw.join("new"), "fresh").expect("write");
        std::fs::write(rw.join(".wh.old"), "").expect("whiteout");

        Fixture {
            _dir: dir,
            layers,
            container,
            image,
        }
    }

    async fn archive(stream: ByteStream) -> BTreeMap<String, String> {
        let chunks: Vec<Bytes> = stream.try_collect().await.expect("stream");
        let data: Vec<u8> = chunks.concat();
        let mut archive = tar::Archive::new(data.as_slice());
        let mut out = BTreeMap::new();
        for entry in archive.entries().expect("entries") {
            let mut entry = entry.expect("entry");
            let name = entry.path().expect("path").display().to_string();
            let mut content = String::new();
            let _ = entry.read_to_string(&mut content).expect("read");
            let _ = out.insert(name, content);
        }
        out
    }

    #[tokio::test]
    async fn diff_reports_modify_add_and_delete() {
        let f = fixture().await;
        let changes = f
            .layers
            .diff(&f.container, std::slice::from_ref(&f.image))
            .await
            .expect("diff");
        let rendered: Vec<String> = changes.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["C /etc", "C /etc/hosts", "A /new", "D /old"]);
    }

    #[tokio::test]
    async fn export_tars_the_merged_view() {
        let f = fixture().await;
        let stream = f
            .layers
            .export(&f.container, std::slice::from_ref(&f.image))
            .await
            .expect("export");
        let files = archive(stream).await;
        assert_eq!(files.get("etc/hosts").map(String::as_str), Some("changed"));
        assert_eq!(files.get("etc/passwd").map(String::as_str), Some("root"));
        assert_eq!(files.get("new").map(String::as_str), Some("fresh"));
        assert!(!files.contains_key("old"));
        assert!(!files.keys().any(|name| name.contains(".wh.")));
    }

    #[tokio::test]
    async fn copy_names_entries_relative_to_parent() {
        let f = fixture().await;
        let lineage = std::slice::from_ref(&f.image);
        let files = archive(f.layers.copy(&f.container, lineage, "/etc/hosts").await.expect("copy")).await;
        assert_eq!(files.keys().collect::<Vec<_>>(), ["hosts"]);
        assert_eq!(files["hosts"], "changed");

        let dir = archive(f.layers.copy(&f.container, lineage, "/etc").await.expect("copy")).await;
        assert!(dir.contains_key("etc/passwd"));

        assert!(matches!(
            f.layers.copy(&f.container, lineage, "/old").await,
            Err(BerthError::NotFound { .. })
        ));
        assert!(matches!(
            f.layers.copy(&f.container, lineage, "/../etc").await,
            Err(BerthError::InvalidParameter { .. })
        ));
    }

    #[tokio::test]
    async fn commit_copies_rw_layer_and_remove_cleans_up() {
        let f = fixture().await;
        let committed = ImageId::new("img2");
        let size = f.layers.commit(&f.container, &committed).await.expect("commit");
        assert_eq!(size, "changed".len() as u64 + "fresh".len() as u64);
        assert_eq!(f.layers.size(&f.container).await.expect("size"), size);
        assert!(f.layers.layer_dir(&committed).join("new").exists());

        f.layers.remove(&f.container).await.expect("remove");
        assert!(!f.layers.rw_dir(&f.container).exists());
        f.layers.remove(&f.container).await.expect("remove twice");
        f.layers.remove_image(&committed).await.expect("remove image");
        assert!(!f.layers.layer_dir(&committed).exists());
    }
}

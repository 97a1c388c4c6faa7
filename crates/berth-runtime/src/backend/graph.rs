//! In-memory image graph.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use berth_common::error::{BerthError, Result};
use berth_common::types::ImageId;

use super::{Image, ImageGraph, RepoTag};

/// Tag assumed when a reference names only a repository.
pub const DEFAULT_TAG: &str = "latest";

/// Splits `repo[:tag]`, leaving registry ports (`host:5000/app`) intact.
#[must_use]
pub fn parse_repository_tag(name: &str) -> (&str, Option<&str>) {
    if let Some((repo, tag)) = name.rsplit_once(':') {
        if !tag.contains('/') {
            return (repo, Some(tag));
        }
    }
    (name, None)
}

#[derive(Debug, Default)]
struct GraphInner {
    images: HashMap<ImageId, Image>,
    repositories: BTreeMap<String, BTreeMap<String, ImageId>>,
}

/// Image graph kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryGraph {
    inner: RwLock<GraphInner>,
}

impl MemoryGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, GraphInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, GraphInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GraphInner {
    fn by_reference(&self, name: &str) -> Option<&Image> {
        let (repo, tag) = parse_repository_tag(name);
        let id = self
            .repositories
            .get(repo)?
            .get(tag.unwrap_or(DEFAULT_TAG))?;
        self.images.get(id)
    }

    fn by_prefix(&self, prefix: &str) -> Result<Option<&Image>> {
        let mut matches = self
            .images
            .values()
            .filter(|image| image.id.as_str().starts_with(prefix));
        let first = matches.next();
        if matches.next().is_some() {
            return Err(BerthError::invalid_parameter(format!(
                "image id prefix {prefix} is ambiguous"
            )));
        }
        Ok(first)
    }
}

impl ImageGraph for MemoryGraph {
    fn lookup(&self, name: &str) -> Result<Image> {
        let inner = self.read();
        if let Some(image) = inner.images.get(&ImageId::new(name)) {
            return Ok(image.clone());
        }
        if let Some(image) = inner.by_reference(name) {
            return Ok(image.clone());
        }
        if !name.is_empty() {
            if let Some(image) = inner.by_prefix(name)? {
                return Ok(image.clone());
            }
        }
        Err(BerthError::image_not_found(name))
    }

    fn list(&self) -> Vec<Image> {
        self.read().images.values().cloned().collect()
    }

    fn register(&self, image: Image) -> Result<()> {
        let mut inner = self.write();
        if inner.images.contains_key(&image.id) {
            return Err(BerthError::conflict(format!("image {} already exists", image.id)));
        }
        if let Some(parent) = &image.parent {
            if !inner.images.contains_key(parent) {
                return Err(BerthError::image_not_found(parent.as_str()));
            }
        }
        tracing::debug!(id = %image.id, parent = ?image.parent, "image registered");
        let _ = inner.images.insert(image.id.clone(), image);
        Ok(())
    }

    fn tag(&self, id: &ImageId, repository: &str, tag: &str, force: bool) -> Result<()> {
        if repository.is_empty() {
            return Err(BerthError::invalid_parameter("repository name is empty"));
        }
        if tag.contains('/') {
            return Err(BerthError::invalid_parameter(format!("illegal tag name: {tag}")));
        }
        let tag = if tag.is_empty() { DEFAULT_TAG } else { tag };

        let mut inner = self.write();
        if !inner.images.contains_key(id) {
            return Err(BerthError::image_not_found(id.as_str()));
        }
        let tags = inner.repositories.entry(repository.to_string()).or_default();
        if let Some(existing) = tags.get(tag) {
            if existing != id && !force {
                return Err(BerthError::conflict(format!(
                    "tag {tag} is already set to image {}, use force to replace it",
                    existing.short()
                )));
            }
        }
        let _ = tags.insert(tag.to_string(), id.clone());
        tracing::debug!(id = %id, repository, tag, "image tagged");
        Ok(())
    }

    fn untag(&self, repository: &str, tag: &str) -> Option<ImageId> {
        let mut inner = self.write();
        let tags = inner.repositories.get_mut(repository)?;
        let removed = tags.remove(tag);
        if tags.is_empty() {
            let _ = inner.repositories.remove(repository);
        }
        removed
    }

    fn references(&self, id: &ImageId) -> Vec<RepoTag> {
        self.read()
            .repositories
            .iter()
            .flat_map(|(repository, tags)| {
                tags.iter()
                    .filter(|(_, target)| *target == id)
                    .map(|(tag, _)| RepoTag {
                        repository: repository.clone(),
                        tag: tag.clone(),
                    })
            })
            .collect()
    }

    fn delete(&self, id: &ImageId) -> Result<()> {
        let mut inner = self.write();
        if !inner.images.contains_key(id) {
            return Err(BerthError::image_not_found(id.as_str()));
        }
        if inner.images.values().any(|image| image.parent.as_ref() == Some(id)) {
            return Err(BerthError::conflict(format!(
                "cannot delete image {} because it has children",
                id.short()
            )));
        }
        let _ = inner.images.remove(id);
        for tags in inner.repositories.values_mut() {
            tags.retain(|_, target| target != id);
        }
        inner.repositories.retain(|_, tags| !tags.is_empty());
        tracing::debug!(id = %id, "image deleted");
        Ok(())
    }

    fn children(&self, id: &ImageId) -> Vec<Image> {
        self.read()
            .images
            .values()
            .filter(|image| image.parent.as_ref() == Some(id))
            .cloned()
            .collect()
    }

    fn history(&self, id: &ImageId) -> Result<Vec<Image>> {
        let inner = self.read();
        let mut chain = Vec::new();
        let mut next = Some(id.clone());
        while let Some(current) = next.take() {
            let image = inner
                .images
                .get(&current)
                .ok_or_else(|| BerthError::image_not_found(current.as_str()))?;
            next.clone_from(&image.parent);
            chain.push(image.clone());
        }
        Ok(chain)
    }
}

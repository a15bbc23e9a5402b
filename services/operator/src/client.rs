//! Access to declared resources.
//!
//! The operator lists `DatabaseDeployment`s, writes their status and keeps
//! the last-achieved-spec annotation current.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::resource::{DatabaseDeployment, DeploymentStatus, ResourceKey};
use crate::store::write_atomic;

#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn list(&self) -> Result<Vec<DatabaseDeployment>>;

    async fn update_status(&self, key: &ResourceKey, status: &DeploymentStatus) -> Result<()>;

    async fn set_annotation(&self, key: &ResourceKey, name: &str, value: &str) -> Result<()>;
}

/// In-memory resource client for tests.
#[derive(Default)]
pub struct InMemoryResourceClient {
    resources: RwLock<BTreeMap<ResourceKey, DatabaseDeployment>>,
}

impl InMemoryResourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a resource, keeping its current status and
    /// annotations when `resource` carries none.
    pub async fn apply(&self, mut resource: DatabaseDeployment) {
        let mut resources = self.resources.write().await;
        if let Some(existing) = resources.get(&resource.key()) {
            if resource.status.is_none() {
                resource.status = existing.status.clone();
            }
            if resource.annotations.is_empty() {
                resource.annotations = existing.annotations.clone();
            }
        }
        resources.insert(resource.key(), resource);
    }

    pub async fn get(&self, key: &ResourceKey) -> Option<DatabaseDeployment> {
        self.resources.read().await.get(key).cloned()
    }
}

#[async_trait]
impl ResourceClient for InMemoryResourceClient {
    async fn list(&self) -> Result<Vec<DatabaseDeployment>> {
        Ok(self.resources.read().await.values().cloned().collect())
    }

    async fn update_status(&self, key: &ResourceKey, status: &DeploymentStatus) -> Result<()> {
        let mut resources = self.resources.write().await;
        let resource = resources
            .get_mut(key)
            .with_context(|| format!("resource {key} not found"))?;
        resource.status = Some(status.clone());
        Ok(())
    }

    async fn set_annotation(&self, key: &ResourceKey, name: &str, value: &str) -> Result<()> {
        let mut resources = self.resources.write().await;
        let resource = resources
            .get_mut(key)
            .with_context(|| format!("resource {key} not found"))?;
        resource
            .annotations
            .insert(name.to_string(), value.to_string());
        Ok(())
    }
}

const STATUS_SUFFIX: &str = ".status.json";
const ANNOTATIONS_SUFFIX: &str = ".annotations.json";

/// Resources read from a directory of JSON manifests.
///
/// Status and annotations written by the operator go to sidecar files
/// (`<namespace>.<name>.status.json`, `<namespace>.<name>.annotations.json`)
/// so the manifests themselves stay untouched.
pub struct ManifestResourceClient {
    dir: PathBuf,
}

impl ManifestResourceClient {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn sidecar(&self, key: &ResourceKey, suffix: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}{}", key.namespace, key.name, suffix))
    }

    async fn read_annotations(&self, key: &ResourceKey) -> Result<BTreeMap<String, String>> {
        let path = self.sidecar(key, ANNOTATIONS_SUFFIX);
        match fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("failed to parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn read_status(&self, key: &ResourceKey) -> Result<Option<DeploymentStatus>> {
        let path = self.sidecar(key, STATUS_SUFFIX);
        match fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .with_context(|| format!("failed to parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn read_manifest(&self, path: &Path) -> Result<DatabaseDeployment> {
        let raw = fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut resource: DatabaseDeployment = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        let key = resource.key();
        resource.annotations.extend(self.read_annotations(&key).await?);
        if let Some(status) = self.read_status(&key).await? {
            resource.status = Some(status);
        }
        Ok(resource)
    }
}

#[async_trait]
impl ResourceClient for ManifestResourceClient {
    async fn list(&self) -> Result<Vec<DatabaseDeployment>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.dir.display(), "Manifest directory does not exist");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to list {}", self.dir.display()))
            }
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed to list {}", self.dir.display()))?
        {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(".json")
                && !name.ends_with(STATUS_SUFFIX)
                && !name.ends_with(ANNOTATIONS_SUFFIX)
            {
                paths.push(path);
            }
        }
        paths.sort();

        let mut resources = Vec::with_capacity(paths.len());
        for path in paths {
            match self.read_manifest(&path).await {
                Ok(resource) => resources.push(resource),
                Err(e) => warn!(path = %path.display(), error = %format!("{e:#}"), "Skipping unreadable manifest"),
            }
        }
        Ok(resources)
    }

    async fn update_status(&self, key: &ResourceKey, status: &DeploymentStatus) -> Result<()> {
        let path = self.sidecar(key, STATUS_SUFFIX);
        let content = serde_json::to_vec_pretty(status).context("failed to encode status")?;
        write_atomic(&path, &content)
            .await
            .with_context(|| format!("failed to write status for {key}"))
    }

    async fn set_annotation(&self, key: &ResourceKey, name: &str, value: &str) -> Result<()> {
        let mut annotations = self.read_annotations(key).await?;
        annotations.insert(name.to_string(), value.to_string());

        let path = self.sidecar(key, ANNOTATIONS_SUFFIX);
        let content =
            serde_json::to_vec_pretty(&annotations).context("failed to encode annotations")?;
        write_atomic(&path, &content)
            .await
            .with_context(|| format!("failed to write annotations for {key}"))
    }
}

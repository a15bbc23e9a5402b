//! Management service interface and in-memory implementation.
//!
//! The management service supervises the per-process agents. The operator
//! asks it whether the agents have reached the published configuration
//! version and aligns the backup stores it tracks for a deployment.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use dbop_reconcile::Identifiable;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;

use crate::journal::Journal;
use crate::resource::{ResourceKey, StoreSpec};

/// Backup store category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StoreCategory {
    Oplog,
    Block,
    S3,
    FileSystem,
}

impl StoreCategory {
    pub const ALL: [StoreCategory; 4] = [Self::Oplog, Self::Block, Self::S3, Self::FileSystem];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oplog => "oplog",
            Self::Block => "block",
            Self::S3 => "s3",
            Self::FileSystem => "filesystem",
        }
    }
}

impl fmt::Display for StoreCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backup store as the management service reports it.
///
/// Only `uri`, `path`, `bucket` and `assignment_enabled` belong to the
/// operator; everything else the service tracks rides along in `external`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    #[serde(default)]
    pub assignment_enabled: bool,

    #[serde(flatten)]
    pub external: BTreeMap<String, Value>,
}

impl StoreConfig {
    /// Operator-owned fields from `desired` over everything else in `existing`.
    pub fn merge_owned(desired: &StoreConfig, existing: &StoreConfig) -> StoreConfig {
        StoreConfig {
            id: existing.id.clone(),
            uri: desired.uri.clone(),
            path: desired.path.clone(),
            bucket: desired.bucket.clone(),
            assignment_enabled: desired.assignment_enabled,
            external: existing.external.clone(),
        }
    }
}

impl From<&StoreSpec> for StoreConfig {
    fn from(spec: &StoreSpec) -> Self {
        Self {
            id: spec.id.clone(),
            uri: spec.uri.clone(),
            path: spec.path.clone(),
            bucket: spec.bucket.clone(),
            assignment_enabled: spec.assignment_enabled,
            external: BTreeMap::new(),
        }
    }
}

impl Identifiable for StoreConfig {
    type Id = String;

    fn identifier(&self) -> String {
        self.id.clone()
    }
}

/// Management service interface.
#[async_trait]
pub trait ManagementService: Send + Sync {
    /// Whether a backup daemon is registered to serve the deployment.
    async fn backup_daemon_registered(&self, resource: &ResourceKey) -> Result<bool>;

    /// Whether every agent reports the configuration `version` as applied.
    async fn goal_version_reached(&self, resource: &ResourceKey, version: i64) -> Result<bool>;

    async fn list_stores(
        &self,
        resource: &ResourceKey,
        category: StoreCategory,
    ) -> Result<Vec<StoreConfig>>;

    async fn create_store(
        &self,
        resource: &ResourceKey,
        category: StoreCategory,
        store: &StoreConfig,
    ) -> Result<()>;

    async fn update_store(
        &self,
        resource: &ResourceKey,
        category: StoreCategory,
        store: &StoreConfig,
    ) -> Result<()>;

    async fn delete_store(
        &self,
        resource: &ResourceKey,
        category: StoreCategory,
        id: &str,
    ) -> Result<()>;
}

type StoreTable = BTreeMap<(ResourceKey, StoreCategory), BTreeMap<String, StoreConfig>>;

/// In-memory management service for testing and local runs.
pub struct InMemoryManagementService {
    stores: RwLock<StoreTable>,
    reached_versions: RwLock<BTreeMap<ResourceKey, i64>>,
    failing_stores: RwLock<BTreeSet<String>>,

    /// Whether a backup daemon is registered for every deployment.
    daemon_registered: AtomicBool,

    /// Whether agents reach any published version immediately.
    auto_goal_state: AtomicBool,

    journal: Option<Journal>,
}

impl InMemoryManagementService {
    pub fn new() -> Self {
        Self {
            stores: RwLock::new(BTreeMap::new()),
            reached_versions: RwLock::new(BTreeMap::new()),
            failing_stores: RwLock::new(BTreeSet::new()),
            daemon_registered: AtomicBool::new(true),
            auto_goal_state: AtomicBool::new(true),
            journal: None,
        }
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new()
        }
    }

    pub fn set_daemon_registered(&self, registered: bool) {
        self.daemon_registered.store(registered, Ordering::SeqCst);
    }

    pub fn set_auto_goal_state(&self, auto: bool) {
        self.auto_goal_state.store(auto, Ordering::SeqCst);
    }

    /// Report `version` as reached by the agents of `resource`.
    pub async fn set_reached_version(&self, resource: &ResourceKey, version: i64) {
        self.reached_versions
            .write()
            .await
            .insert(resource.clone(), version);
    }

    /// Make every operation on store `id` fail.
    pub async fn fail_store(&self, id: &str) {
        self.failing_stores.write().await.insert(id.to_string());
    }

    /// Seed a store, as if created through the service's own interface.
    pub async fn insert_store(
        &self,
        resource: &ResourceKey,
        category: StoreCategory,
        store: StoreConfig,
    ) {
        self.stores
            .write()
            .await
            .entry((resource.clone(), category))
            .or_default()
            .insert(store.id.clone(), store);
    }

    pub async fn store(
        &self,
        resource: &ResourceKey,
        category: StoreCategory,
        id: &str,
    ) -> Option<StoreConfig> {
        self.stores
            .read()
            .await
            .get(&(resource.clone(), category))
            .and_then(|stores| stores.get(id).cloned())
    }

    async fn check_store(&self, operation: &str, category: StoreCategory, id: &str) -> Result<()> {
        if self.failing_stores.read().await.contains(id) {
            anyhow::bail!("[MOCK] {operation} of {category} store {id} rejected");
        }
        Ok(())
    }

    async fn journal(&self, entry: String) {
        if let Some(journal) = &self.journal {
            journal.record(entry).await;
        }
    }
}

impl Default for InMemoryManagementService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ManagementService for InMemoryManagementService {
    async fn backup_daemon_registered(&self, _resource: &ResourceKey) -> Result<bool> {
        Ok(self.daemon_registered.load(Ordering::SeqCst))
    }

    async fn goal_version_reached(&self, resource: &ResourceKey, version: i64) -> Result<bool> {
        if self.auto_goal_state.load(Ordering::SeqCst) {
            return Ok(true);
        }
        Ok(self
            .reached_versions
            .read()
            .await
            .get(resource)
            .is_some_and(|reached| *reached >= version))
    }

    async fn list_stores(
        &self,
        resource: &ResourceKey,
        category: StoreCategory,
    ) -> Result<Vec<StoreConfig>> {
        Ok(self
            .stores
            .read()
            .await
            .get(&(resource.clone(), category))
            .map(|stores| stores.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_store(
        &self,
        resource: &ResourceKey,
        category: StoreCategory,
        store: &StoreConfig,
    ) -> Result<()> {
        self.check_store("create", category, &store.id).await?;
        let mut stores = self.stores.write().await;
        let table = stores.entry((resource.clone(), category)).or_default();
        if table.contains_key(&store.id) {
            anyhow::bail!("{category} store {} already exists", store.id);
        }
        table.insert(store.id.clone(), store.clone());
        drop(stores);

        info!(resource = %resource, category = %category, store = %store.id, "[MOCK] Created store");
        self.journal(format!("create {category} {}", store.id)).await;
        Ok(())
    }

    async fn update_store(
        &self,
        resource: &ResourceKey,
        category: StoreCategory,
        store: &StoreConfig,
    ) -> Result<()> {
        self.check_store("update", category, &store.id).await?;
        let mut stores = self.stores.write().await;
        let Some(existing) = stores
            .get_mut(&(resource.clone(), category))
            .and_then(|table| table.get_mut(&store.id))
        else {
            anyhow::bail!("{category} store {} does not exist", store.id);
        };
        *existing = store.clone();
        drop(stores);

        self.journal(format!("update {category} {}", store.id)).await;
        Ok(())
    }

    async fn delete_store(
        &self,
        resource: &ResourceKey,
        category: StoreCategory,
        id: &str,
    ) -> Result<()> {
        self.check_store("delete", category, id).await?;
        let removed = self
            .stores
            .write()
            .await
            .get_mut(&(resource.clone(), category))
            .and_then(|table| table.remove(id));
        if removed.is_none() {
            anyhow::bail!("{category} store {id} does not exist");
        }

        info!(resource = %resource, category = %category, store = %id, "[MOCK] Deleted store");
        self.journal(format!("delete {category} {id}")).await;
        Ok(())
    }
}

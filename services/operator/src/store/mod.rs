//! Namespaced key/value records.
//!
//! A record is a small string map addressed by kind, namespace and name, the
//! shape of a config map or secret. Deployment state and the published
//! automation config both live in records.

mod file;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::journal::Journal;

pub use file::FileRecordStore;
pub(crate) use file::write_atomic;

/// Errors from record store operations.
#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// Kind of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordKind {
    /// Plain configuration.
    Config,
    /// Values that carry credentials.
    Secret,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "configs",
            Self::Secret => "secrets",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub kind: RecordKind,
    pub namespace: String,
    pub name: String,
}

impl RecordKey {
    pub fn config(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: RecordKind::Config,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn secret(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: RecordKind::Secret,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind.as_str(), self.namespace, self.name)
    }
}

pub type RecordData = BTreeMap<String, String>;

/// Record persistence.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Read a record; `None` if it does not exist.
    async fn read(&self, key: &RecordKey) -> Result<Option<RecordData>, RecordStoreError>;

    /// Create or replace a record.
    async fn write(&self, key: &RecordKey, data: RecordData) -> Result<(), RecordStoreError>;
}

/// In-memory record store for tests and local runs.
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: RwLock<BTreeMap<RecordKey, RecordData>>,
    fail_writes: AtomicBool,
    journal: Option<Journal>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every write in `journal`.
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::default()
        }
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Seed a record without journaling.
    pub async fn insert(&self, key: RecordKey, data: RecordData) {
        self.records.write().await.insert(key, data);
    }

    pub async fn get(&self, key: &RecordKey) -> Option<RecordData> {
        self.records.read().await.get(key).cloned()
    }

    pub async fn remove(&self, key: &RecordKey) -> Option<RecordData> {
        self.records.write().await.remove(key)
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn read(&self, key: &RecordKey) -> Result<Option<RecordData>, RecordStoreError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn write(&self, key: &RecordKey, data: RecordData) -> Result<(), RecordStoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RecordStoreError::Unavailable(format!(
                "[MOCK] write to {key} rejected"
            )));
        }

        debug!(record = %key, keys = data.len(), "[MOCK] Writing record");
        self.records.write().await.insert(key.clone(), data);
        if let Some(journal) = &self.journal {
            journal.record(format!("write {key}")).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(value: &str) -> RecordData {
        [("state".to_string(), value.to_string())].into_iter().collect()
    }

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let store = InMemoryRecordStore::new();
        let key = RecordKey::config("ops", "app-db-state");

        assert!(store.read(&key).await.unwrap().is_none());
        store.write(&key, data("{}")).await.unwrap();
        assert_eq!(store.read(&key).await.unwrap(), Some(data("{}")));

        let other = RecordKey::secret("ops", "app-db-state");
        assert!(store.read(&other).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = InMemoryRecordStore::new();
        let key = RecordKey::config("ops", "app-db-state");

        store.set_fail_writes(true);
        let err = store.write(&key, data("{}")).await.unwrap_err();
        assert!(matches!(err, RecordStoreError::Unavailable(_)));
        assert!(store.get(&key).await.is_none());

        store.set_fail_writes(false);
        store.write(&key, data("{}")).await.unwrap();
    }

    #[tokio::test]
    async fn test_writes_are_journaled() {
        let journal = Journal::new();
        let store = InMemoryRecordStore::with_journal(journal.clone());
        store
            .write(&RecordKey::secret("ops", "app-db-config"), data("{}"))
            .await
            .unwrap();
        assert_eq!(journal.entries().await, vec!["write secrets/ops/app-db-config"]);
    }

    #[test]
    fn test_record_key_display() {
        assert_eq!(
            RecordKey::config("ops", "app-db-state").to_string(),
            "configs/ops/app-db-state"
        );
    }
}

//! File-backed record store.
//!
//! Each record is a JSON object at `<root>/<kind>/<namespace>/<name>.json`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{RecordData, RecordKey, RecordStore, RecordStoreError};

pub struct FileRecordStore {
    root: PathBuf,
}

impl FileRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: &RecordKey) -> PathBuf {
        self.root
            .join(key.kind.as_str())
            .join(&key.namespace)
            .join(format!("{}.json", key.name))
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn read(&self, key: &RecordKey) -> Result<Option<RecordData>, RecordStoreError> {
        let path = self.path_for(key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(RecordStoreError::Io { path, source }),
        };

        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| RecordStoreError::Corrupt { path, source })
    }

    async fn write(&self, key: &RecordKey, data: RecordData) -> Result<(), RecordStoreError> {
        let path = self.path_for(key);
        let content = serde_json::to_vec_pretty(&data).map_err(|source| {
            RecordStoreError::Corrupt {
                path: path.clone(),
                source,
            }
        })?;

        write_atomic(&path, &content).await?;
        debug!(record = %key, path = %path.display(), "Wrote record");
        Ok(())
    }
}

/// Write via a temp file and rename so readers never see a partial file.
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), RecordStoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|source| RecordStoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)
        .await
        .map_err(|source| RecordStoreError::Io {
            path: tmp.clone(),
            source,
        })?;
    fs::rename(&tmp, path)
        .await
        .map_err(|source| RecordStoreError::Io {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::new(dir.path());
        let key = RecordKey::secret("ops", "app-db-config");

        assert!(store.read(&key).await.unwrap().is_none());

        let data: RecordData = [("cluster-config.json".to_string(), "{\"version\":1}".to_string())]
            .into_iter()
            .collect();
        store.write(&key, data.clone()).await.unwrap();

        let path = dir.path().join("secrets/ops/app-db-config.json");
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
        assert_eq!(store.read(&key).await.unwrap(), Some(data));
    }

    #[tokio::test]
    async fn test_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRecordStore::new(dir.path());
        let key = RecordKey::config("ops", "app-db-state");

        let path = store.path_for(&key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();

        let err = store.read(&key).await.unwrap_err();
        assert!(matches!(err, RecordStoreError::Corrupt { .. }));
    }
}

//! Persisted per-resource deployment state.
//!
//! State lives in the `<name>-state` config record under the `state` key as
//! one JSON blob. Two older sources are consulted when the blob lacks a
//! field: a `<name>-cluster-mapping` record for the cluster mapping, and the
//! last-achieved-spec annotation on the resource.

use std::sync::Arc;

use dbop_reconcile::ClusterMapping;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::resource::{
    DatabaseDeployment, DeploymentSpec, DeploymentStatus, ResourceKey,
    LAST_ACHIEVED_SPEC_ANNOTATION,
};
use crate::store::{RecordData, RecordKey, RecordStore, RecordStoreError};

/// Key of the state blob inside the state record.
pub const STATE_KEY: &str = "state";

/// Errors from state persistence.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("state store error: {0}")]
    Store(#[from] RecordStoreError),

    #[error("corrupt state in {record}: {source}")]
    Corrupt {
        record: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid cluster index {value:?} for cluster {cluster} in {record}")]
    InvalidMapping {
        record: String,
        cluster: String,
        value: String,
    },

    #[error("failed to encode state: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentState {
    #[serde(default)]
    pub cluster_mapping: ClusterMapping,

    /// Spec of the last pass that ended Ok.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_achieved_spec: Option<DeploymentSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeploymentStatus>,
}

pub struct DeploymentStateStore {
    store: Arc<dyn RecordStore>,
}

impl DeploymentStateStore {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn state_record(key: &ResourceKey) -> RecordKey {
        RecordKey::config(&key.namespace, format!("{}-state", key.name))
    }

    pub fn legacy_mapping_record(key: &ResourceKey) -> RecordKey {
        RecordKey::config(&key.namespace, format!("{}-cluster-mapping", key.name))
    }

    /// Load state for `resource`, filling gaps from the legacy sources.
    pub async fn load(
        &self,
        resource: &DatabaseDeployment,
    ) -> Result<DeploymentState, StateStoreError> {
        let key = resource.key();
        let record = Self::state_record(&key);

        let mut state = match self.store.read(&record).await? {
            Some(data) => match data.get(STATE_KEY) {
                Some(raw) => serde_json::from_str(raw).map_err(|source| {
                    StateStoreError::Corrupt {
                        record: record.to_string(),
                        source,
                    }
                })?,
                None => DeploymentState::default(),
            },
            None => DeploymentState::default(),
        };

        if state.cluster_mapping.is_empty() {
            if let Some(mapping) = self.read_legacy_mapping(&key).await? {
                info!(
                    resource = %key,
                    clusters = mapping.len(),
                    "Adopted legacy cluster mapping"
                );
                state.cluster_mapping = mapping;
            }
        }

        if state.last_achieved_spec.is_none() {
            if let Some(raw) = resource.annotation(LAST_ACHIEVED_SPEC_ANNOTATION) {
                match serde_json::from_str::<DeploymentSpec>(raw) {
                    Ok(spec) => {
                        debug!(resource = %key, "Using last achieved spec from annotation");
                        state.last_achieved_spec = Some(spec);
                    }
                    Err(e) => {
                        warn!(resource = %key, error = %e, "Ignoring unparsable last achieved spec annotation");
                    }
                }
            }
        }

        Ok(state)
    }

    async fn read_legacy_mapping(
        &self,
        key: &ResourceKey,
    ) -> Result<Option<ClusterMapping>, StateStoreError> {
        let record = Self::legacy_mapping_record(key);
        let Some(data) = self.store.read(&record).await? else {
            return Ok(None);
        };
        if data.is_empty() {
            return Ok(None);
        }

        data.into_iter()
            .map(|(cluster, value)| match value.trim().parse::<u32>() {
                Ok(index) => Ok((cluster, index)),
                Err(_) => Err(StateStoreError::InvalidMapping {
                    record: record.to_string(),
                    cluster,
                    value,
                }),
            })
            .collect::<Result<ClusterMapping, _>>()
            .map(Some)
    }

    pub async fn save(
        &self,
        key: &ResourceKey,
        state: &DeploymentState,
    ) -> Result<(), StateStoreError> {
        let raw = serde_json::to_string(state).map_err(StateStoreError::Encode)?;
        let data: RecordData = [(STATE_KEY.to_string(), raw)].into_iter().collect();
        self.store.write(&Self::state_record(key), data).await?;
        debug!(resource = %key, clusters = state.cluster_mapping.len(), "Saved deployment state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryRecordStore;
    use serde_json::json;

    fn resource() -> DatabaseDeployment {
        serde_json::from_value(json!({
            "namespace": "ops",
            "name": "app-db",
            "spec": {"topology": {"resourceType": "ReplicaSet", "version": "6.0.5", "members": 3}}
        }))
        .unwrap()
    }

    fn mapping(entries: &[(&str, u32)]) -> ClusterMapping {
        entries
            .iter()
            .map(|(name, index)| (name.to_string(), *index))
            .collect()
    }

    #[tokio::test]
    async fn test_missing_state_is_default() {
        let store = DeploymentStateStore::new(Arc::new(InMemoryRecordStore::new()));
        let state = store.load(&resource()).await.unwrap();
        assert_eq!(state, DeploymentState::default());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = DeploymentStateStore::new(Arc::new(InMemoryRecordStore::new()));
        let resource = resource();
        let state = DeploymentState {
            cluster_mapping: mapping(&[("east", 0), ("west", 1)]),
            last_achieved_spec: Some(resource.spec.clone()),
            status: None,
        };

        store.save(&resource.key(), &state).await.unwrap();
        assert_eq!(store.load(&resource).await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_adopts_legacy_cluster_mapping() {
        let records = Arc::new(InMemoryRecordStore::new());
        let key = resource().key();
        records
            .insert(
                DeploymentStateStore::legacy_mapping_record(&key),
                [("east".to_string(), "0".to_string()), ("west".to_string(), "3".to_string())]
                    .into_iter()
                    .collect(),
            )
            .await;

        let store = DeploymentStateStore::new(records);
        let state = store.load(&resource()).await.unwrap();
        assert_eq!(state.cluster_mapping, mapping(&[("east", 0), ("west", 3)]));
        assert_eq!(state.cluster_mapping.next_free_index(), 4);
    }

    #[tokio::test]
    async fn test_state_mapping_wins_over_legacy() {
        let records = Arc::new(InMemoryRecordStore::new());
        let key = resource().key();
        records
            .insert(
                DeploymentStateStore::legacy_mapping_record(&key),
                [("east".to_string(), "7".to_string())].into_iter().collect(),
            )
            .await;

        let store = DeploymentStateStore::new(records);
        let state = DeploymentState {
            cluster_mapping: mapping(&[("east", 0)]),
            ..Default::default()
        };
        store.save(&key, &state).await.unwrap();

        let loaded = store.load(&resource()).await.unwrap();
        assert_eq!(loaded.cluster_mapping.get("east"), Some(0));
    }

    #[tokio::test]
    async fn test_invalid_legacy_mapping() {
        let records = Arc::new(InMemoryRecordStore::new());
        records
            .insert(
                DeploymentStateStore::legacy_mapping_record(&resource().key()),
                [("east".to_string(), "first".to_string())].into_iter().collect(),
            )
            .await;

        let err = DeploymentStateStore::new(records)
            .load(&resource())
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::InvalidMapping { .. }));
    }

    #[tokio::test]
    async fn test_falls_back_to_annotation() {
        let store = DeploymentStateStore::new(Arc::new(InMemoryRecordStore::new()));
        let mut resource = resource();
        let mut achieved = resource.spec.clone();
        achieved.topology.version = "5.0.14".to_string();
        resource.annotations.insert(
            LAST_ACHIEVED_SPEC_ANNOTATION.to_string(),
            serde_json::to_string(&achieved).unwrap(),
        );

        let state = store.load(&resource).await.unwrap();
        assert_eq!(state.last_achieved_spec, Some(achieved));
    }

    #[tokio::test]
    async fn test_corrupt_state() {
        let records = Arc::new(InMemoryRecordStore::new());
        records
            .insert(
                DeploymentStateStore::state_record(&resource().key()),
                [(STATE_KEY.to_string(), "{".to_string())].into_iter().collect(),
            )
            .await;

        let err = DeploymentStateStore::new(records)
            .load(&resource())
            .await
            .unwrap_err();
        assert!(matches!(err, StateStoreError::Corrupt { .. }));
    }
}

//! Publishing the automation configuration document.
//!
//! The document lives in the `<name>-config` secret record under
//! [`AUTOMATION_CONFIG_KEY`]. A publish builds the desired document on top of
//! the current one and writes it only if it differs semantically, bumping
//! `version` by exactly one. There is no concurrency token on the write: one
//! reconciler per resource is assumed.

use std::sync::Arc;

use dbop_automation::{build_automation_config, AutomationConfigDocument, BuildError, BuildRequest};
use dbop_reconcile::ReconcileOutcome;
use thiserror::Error;
use tracing::{debug, info};

use crate::resource::ResourceKey;
use crate::store::{RecordData, RecordKey, RecordStore, RecordStoreError};

/// Key of the document inside the config record.
pub const AUTOMATION_CONFIG_KEY: &str = "cluster-config.json";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to build automation config: {0}")]
    Build(#[from] BuildError),

    #[error("automation config store error: {0}")]
    Store(#[from] RecordStoreError),

    #[error("corrupt automation config in {record}: {source}")]
    Corrupt {
        record: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode automation config: {0}")]
    Encode(#[source] serde_json::Error),
}

impl PublishError {
    /// Build errors describe the spec and are `Invalid`; the rest are
    /// transient and `Failed`.
    pub fn to_outcome(&self) -> ReconcileOutcome {
        match self {
            Self::Build(_) => ReconcileOutcome::invalid(self.to_string()),
            _ => ReconcileOutcome::failed(self.to_string()),
        }
    }
}

/// Result of a publish.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    /// Nothing changed; the current document is kept.
    Unchanged(AutomationConfigDocument),
    /// A new version was written.
    Published(AutomationConfigDocument),
}

impl PublishOutcome {
    pub fn document(&self) -> &AutomationConfigDocument {
        match self {
            Self::Unchanged(doc) | Self::Published(doc) => doc,
        }
    }

    pub fn version(&self) -> i64 {
        self.document().version
    }

    pub fn is_published(&self) -> bool {
        matches!(self, Self::Published(_))
    }
}

/// Decide what to publish: `None` when `desired` matches `previous`,
/// otherwise `desired` stamped with the next version.
pub fn next_version(
    previous: &AutomationConfigDocument,
    mut desired: AutomationConfigDocument,
) -> Option<AutomationConfigDocument> {
    if previous.semantically_equals(&desired) {
        return None;
    }
    desired.version = previous.version + 1;
    Some(desired)
}

pub struct ConfigPublisher {
    store: Arc<dyn RecordStore>,
}

impl ConfigPublisher {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn config_record(key: &ResourceKey) -> RecordKey {
        RecordKey::secret(&key.namespace, format!("{}-config", key.name))
    }

    /// Current document, or an empty one if none was ever published.
    pub async fn read_current(
        &self,
        key: &ResourceKey,
    ) -> Result<AutomationConfigDocument, PublishError> {
        let record = Self::config_record(key);
        let Some(data) = self.store.read(&record).await? else {
            return Ok(AutomationConfigDocument::default());
        };
        let Some(raw) = data.get(AUTOMATION_CONFIG_KEY) else {
            return Ok(AutomationConfigDocument::default());
        };
        serde_json::from_str(raw).map_err(|source| PublishError::Corrupt {
            record: record.to_string(),
            source,
        })
    }

    /// Build on top of `previous` and write the result if it changed.
    pub async fn publish(
        &self,
        key: &ResourceKey,
        previous: &AutomationConfigDocument,
        request: &BuildRequest<'_>,
    ) -> Result<PublishOutcome, PublishError> {
        let desired = build_automation_config(previous, request)?;

        let Some(next) = next_version(previous, desired) else {
            debug!(resource = %key, version = previous.version, "Automation config unchanged");
            return Ok(PublishOutcome::Unchanged(previous.clone()));
        };

        let raw = serde_json::to_string(&next).map_err(PublishError::Encode)?;
        let mut data = RecordData::new();
        data.insert(AUTOMATION_CONFIG_KEY.to_string(), raw);
        self.store.write(&Self::config_record(key), data).await?;

        info!(
            resource = %key,
            version = next.version,
            processes = next.processes.len(),
            "Published automation config"
        );
        Ok(PublishOutcome::Published(next))
    }
}

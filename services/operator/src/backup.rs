//! Backup store alignment.
//!
//! Each store category is synced on its own against the stores the
//! management service reports. Changes go out one store at a time and the
//! pass stops at the first failure; nothing already applied is rolled back.

use std::time::Duration;

use anyhow::{Context, Result};
use dbop_reconcile::{sync, ReconcileOutcome};
use tracing::{debug, info, instrument, warn};

use crate::management::{ManagementService, StoreCategory, StoreConfig};
use crate::resource::{BackupSpec, ResourceKey, StoreSpec};

fn desired_stores(spec: &BackupSpec, category: StoreCategory) -> Vec<StoreConfig> {
    let stores: &[StoreSpec] = match category {
        StoreCategory::Oplog => &spec.oplog_stores,
        StoreCategory::Block => &spec.block_stores,
        StoreCategory::S3 => &spec.s3_stores,
        StoreCategory::FileSystem => &spec.file_system_stores,
    };
    stores.iter().map(StoreConfig::from).collect()
}

/// Bring the management service's backup stores in line with `spec`.
///
/// No spec, or a disabled one, leaves the stores alone.
#[instrument(skip(management, spec), fields(resource = %resource))]
pub async fn reconcile_backup(
    management: &dyn ManagementService,
    resource: &ResourceKey,
    spec: Option<&BackupSpec>,
    retry_after: Duration,
) -> ReconcileOutcome {
    let Some(spec) = spec.filter(|s| s.enabled) else {
        return ReconcileOutcome::Ok;
    };

    if let Err(reason) = spec.validate() {
        warn!(reason = %reason, "Invalid backup configuration");
        return ReconcileOutcome::invalid(reason);
    }

    match management.backup_daemon_registered(resource).await {
        Ok(true) => {}
        Ok(false) => {
            return ReconcileOutcome::pending("waiting for the backup daemon to register")
                .with_retry_after(retry_after);
        }
        Err(e) => {
            return ReconcileOutcome::failed(format!(
                "failed to check backup daemon for {resource}: {e:#}"
            ));
        }
    }

    for category in StoreCategory::ALL {
        if let Err(e) = sync_category(management, resource, category, desired_stores(spec, category)).await {
            warn!(category = %category, error = %format!("{e:#}"), "Backup store sync failed");
            return ReconcileOutcome::failed(format!("{e:#}"));
        }
    }

    ReconcileOutcome::Ok
}

async fn sync_category(
    management: &dyn ManagementService,
    resource: &ResourceKey,
    category: StoreCategory,
    desired: Vec<StoreConfig>,
) -> Result<()> {
    let existing = management
        .list_stores(resource, category)
        .await
        .with_context(|| format!("failed to list {category} stores"))?;

    let plan = sync(&desired, &existing, StoreConfig::merge_owned);
    if plan.is_empty() {
        debug!(category = %category, stores = existing.len(), "Backup stores in sync");
        return Ok(());
    }

    for store in &plan.to_create {
        management
            .create_store(resource, category, store)
            .await
            .with_context(|| format!("failed to create {category} store {}", store.id))?;
        info!(category = %category, store = %store.id, "Created backup store");
    }
    for store in &plan.to_update {
        management
            .update_store(resource, category, store)
            .await
            .with_context(|| format!("failed to update {category} store {}", store.id))?;
        info!(category = %category, store = %store.id, "Updated backup store");
    }
    for store in &plan.to_delete {
        management
            .delete_store(resource, category, &store.id)
            .await
            .with_context(|| format!("failed to delete {category} store {}", store.id))?;
        info!(category = %category, store = %store.id, "Deleted backup store");
    }

    Ok(())
}

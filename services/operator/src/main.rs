//! dbop operator
//!
//! Reconciles the deployments declared in the manifests directory, keeping
//! per-resource state and published automation configs under the data
//! directory.

use std::sync::Arc;

use anyhow::Result;
use dbop_operator::{
    client::ManifestResourceClient,
    config::OperatorConfig,
    controller::{Collaborators, Reconciler, ReconcilerConfig},
    management::InMemoryManagementService,
    store::FileRecordStore,
    worker::{ReconcileWorker, WorkerConfig},
    workload::MockWorkloadScheduler,
};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("DBOP_CONFIG").ok();
    let config = OperatorConfig::load(config_path.as_deref())?;

    // Prefer RUST_LOG, fall back to the configured level
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting dbop operator");
    info!(
        data_dir = %config.data_dir.display(),
        manifests_dir = %config.manifests_dir.display(),
        "Configuration loaded"
    );

    // Workload scheduler and management service are mocks for now
    let collaborators = Collaborators {
        records: Arc::new(FileRecordStore::new(config.data_dir.clone())),
        resources: Arc::new(ManifestResourceClient::new(config.manifests_dir.clone())),
        workloads: Arc::new(MockWorkloadScheduler::new()),
        management: Arc::new(InMemoryManagementService::new()),
    };
    let reconciler = Arc::new(Reconciler::new(
        collaborators,
        ReconcilerConfig::from(&config),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = ReconcileWorker::new(reconciler, WorkerConfig::from(&config));
    let worker_handle = tokio::spawn(async move {
        worker.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Reconcile worker did not shut down in time");
    }

    info!("Operator shutdown complete");
    Ok(())
}

//! End-to-end run of the worker over file-backed collaborators: manifests
//! from a directory, records under a data directory.

use std::path::Path;
use std::sync::Arc;

use dbop_operator::client::ManifestResourceClient;
use dbop_operator::controller::{Collaborators, Reconciler, ReconcilerConfig};
use dbop_operator::management::InMemoryManagementService;
use dbop_operator::resource::{DeploymentStatus, Phase, LAST_ACHIEVED_SPEC_ANNOTATION};
use dbop_operator::store::FileRecordStore;
use dbop_operator::worker::{ReconcileWorker, WorkerConfig};
use dbop_operator::workload::MockWorkloadScheduler;
use serde_json::{json, Value};
use tempfile::TempDir;

fn write_manifest(dir: &Path, name: &str, members: u32) {
    let manifest = json!({
        "namespace": "ops",
        "name": name,
        "spec": {"topology": {"resourceType": "ReplicaSet", "version": "6.0.5", "members": members}}
    });
    std::fs::write(
        dir.join(format!("{name}.json")),
        serde_json::to_vec_pretty(&manifest).unwrap(),
    )
    .unwrap();
}

fn worker(manifests: &Path, data: &Path) -> ReconcileWorker {
    let reconciler = Reconciler::new(
        Collaborators {
            records: Arc::new(FileRecordStore::new(data)),
            resources: Arc::new(ManifestResourceClient::new(manifests)),
            workloads: Arc::new(MockWorkloadScheduler::new()),
            management: Arc::new(InMemoryManagementService::new()),
        },
        ReconcilerConfig::default(),
    );
    ReconcileWorker::new(Arc::new(reconciler), WorkerConfig::default())
}

fn read_json(path: &Path) -> Value {
    serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_worker_reconciles_manifests_into_files() {
    let manifests = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    write_manifest(manifests.path(), "app-db", 1);
    write_manifest(manifests.path(), "cache-db", 2);

    let worker = worker(manifests.path(), data.path());
    let stats = worker.run_once().await.unwrap();
    assert_eq!(stats.listed, 2);
    assert_eq!(stats.ok, 1);
    assert_eq!(stats.pending, 1);

    let status: DeploymentStatus =
        serde_json::from_value(read_json(&manifests.path().join("ops.app-db.status.json")))
            .unwrap();
    assert_eq!(status.phase, Phase::Running);
    assert_eq!(status.automation_config_version, Some(1));

    let annotations = read_json(&manifests.path().join("ops.app-db.annotations.json"));
    assert!(annotations[LAST_ACHIEVED_SPEC_ANNOTATION].is_string());

    let config = read_json(&data.path().join("secrets/ops/app-db-config.json"));
    let document: Value =
        serde_json::from_str(config["cluster-config.json"].as_str().unwrap()).unwrap();
    assert_eq!(document["version"], json!(1));
    assert!(data.path().join("configs/ops/app-db-state.json").exists());

    let cache: DeploymentStatus =
        serde_json::from_value(read_json(&manifests.path().join("ops.cache-db.status.json")))
            .unwrap();
    assert_eq!(cache.phase, Phase::Pending);
}

#[tokio::test]
async fn test_sidecars_are_not_listed_as_manifests() {
    let manifests = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    write_manifest(manifests.path(), "app-db", 1);

    let first = worker(manifests.path(), data.path());
    first.run_once().await.unwrap();

    let restarted = worker(manifests.path(), data.path());
    let stats = restarted.run_once().await.unwrap();
    assert_eq!(stats.listed, 1);
    assert_eq!(stats.ok, 1);
}

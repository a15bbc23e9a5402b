//! Integration tests for the reconciliation pass.
//!
//! Every collaborator is in-memory and shares one journal, so tests can
//! check which side effects happened and in what order:
//! - `write secrets/...` is a publish of the automation config
//! - `write configs/...` is a state save
//! - `apply ...` is a workload apply

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dbop_operator::client::InMemoryResourceClient;
use dbop_operator::controller::{Collaborators, Reconciler, ReconcilerConfig};
use dbop_operator::journal::Journal;
use dbop_operator::management::{InMemoryManagementService, StoreCategory};
use dbop_operator::publisher::{ConfigPublisher, AUTOMATION_CONFIG_KEY};
use dbop_operator::resource::{
    DatabaseDeployment, Phase, ResourceKey, LAST_ACHIEVED_SPEC_ANNOTATION,
};
use dbop_operator::state::DeploymentStateStore;
use dbop_operator::store::InMemoryRecordStore;
use dbop_operator::workload::MockWorkloadScheduler;
use dbop_automation::LEGACY_KEYFILE_PATH;
use dbop_reconcile::ReconcileOutcome;
use serde_json::{json, Value};

const PUBLISH: &str = "write secrets/";
const APPLY: &str = "apply ";

struct Harness {
    journal: Journal,
    records: Arc<InMemoryRecordStore>,
    resources: Arc<InMemoryResourceClient>,
    workloads: Arc<MockWorkloadScheduler>,
    management: Arc<InMemoryManagementService>,
    reconciler: Reconciler,
}

impl Harness {
    fn new() -> Self {
        let journal = Journal::new();
        let records = Arc::new(InMemoryRecordStore::with_journal(journal.clone()));
        let resources = Arc::new(InMemoryResourceClient::new());
        let workloads = Arc::new(MockWorkloadScheduler::with_journal(journal.clone()));
        let management = Arc::new(InMemoryManagementService::with_journal(journal.clone()));
        let reconciler = Reconciler::new(
            Collaborators {
                records: records.clone(),
                resources: resources.clone(),
                workloads: workloads.clone(),
                management: management.clone(),
            },
            ReconcilerConfig::default(),
        );
        Self {
            journal,
            records,
            resources,
            workloads,
            management,
            reconciler,
        }
    }

    async fn apply(&self, spec: Value) {
        let resource: DatabaseDeployment = serde_json::from_value(json!({
            "namespace": "ops",
            "name": "app-db",
            "spec": spec
        }))
        .unwrap();
        self.resources.apply(resource).await;
    }

    async fn resource(&self) -> DatabaseDeployment {
        self.resources.get(&key()).await.unwrap()
    }

    async fn reconcile(&self) -> ReconcileOutcome {
        let resource = self.resource().await;
        self.reconciler.reconcile(&resource).await
    }

    async fn reconcile_until_ok(&self, max_passes: usize) {
        for _ in 0..max_passes {
            if self.reconcile().await.is_ok() {
                return;
            }
        }
        panic!("not converged after {max_passes} passes");
    }

    async fn config_version(&self) -> i64 {
        ConfigPublisher::new(self.records.clone())
            .read_current(&key())
            .await
            .unwrap()
            .version
    }

    async fn replica_set_hosts(&self) -> BTreeSet<String> {
        ConfigPublisher::new(self.records.clone())
            .read_current(&key())
            .await
            .unwrap()
            .replica_sets
            .iter()
            .flat_map(|rs| rs.members.iter().map(|m| m.host.clone()))
            .collect()
    }

    async fn members(&self, cluster: Option<&str>, workload: &str) -> u32 {
        self.workloads
            .workload(&key(), cluster, workload)
            .await
            .map_or(0, |w| w.members)
    }

    async fn publish_before_apply(&self) -> bool {
        let publish = self.journal.position(PUBLISH).await.unwrap();
        let apply = self.journal.position(APPLY).await.unwrap();
        publish < apply
    }
}

fn key() -> ResourceKey {
    ResourceKey::new("ops", "app-db")
}

fn replica_set(members: u32) -> Value {
    json!({"topology": {"resourceType": "ReplicaSet", "version": "6.0.5", "members": members}})
}

fn with_tls(mut spec: Value) -> Value {
    spec["topology"]["tls"] = json!({
        "enabled": true,
        "mode": "requireTLS",
        "certificateKeyFile": "/tls/server.pem",
        "caFile": "/tls/ca.pem"
    });
    spec
}

#[tokio::test]
async fn test_scale_up_adds_one_member_per_pass() {
    let h = Harness::new();
    h.apply(replica_set(5)).await;

    for pass in 1..=4u32 {
        let outcome = h.reconcile().await;
        assert!(outcome.is_pending(), "pass {pass}: {outcome}");
        assert_eq!(outcome.retry_after(), Some(Duration::from_secs(10)));
        assert_eq!(h.workloads.total_members(&key()).await, pass);
        assert_eq!(h.config_version().await, i64::from(pass));

        let status = h.resource().await.status.unwrap();
        assert_eq!(status.phase, Phase::Pending);
        assert_eq!(status.members["app-db"], pass);
    }

    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);
    assert_eq!(h.workloads.total_members(&key()).await, 5);

    let status = h.resource().await.status.unwrap();
    assert_eq!(status.phase, Phase::Running);
    assert_eq!(status.automation_config_version, Some(5));
}

#[tokio::test]
async fn test_scale_down_removes_one_member_per_pass() {
    let h = Harness::new();
    h.apply(replica_set(3)).await;
    h.reconcile_until_ok(5).await;

    h.apply(replica_set(1)).await;
    assert!(h.reconcile().await.is_pending());
    assert_eq!(h.workloads.total_members(&key()).await, 2);
    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);
    assert_eq!(h.workloads.total_members(&key()).await, 1);
}

#[tokio::test]
async fn test_repeated_pass_keeps_config_version() {
    let h = Harness::new();
    h.apply(replica_set(1)).await;
    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);
    assert_eq!(h.config_version().await, 1);

    h.journal.clear().await;
    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);
    assert_eq!(h.config_version().await, 1);
    assert_eq!(h.journal.position(PUBLISH).await, None);

    let mut spec = replica_set(1);
    spec["topology"]["version"] = json!("6.0.6");
    h.apply(spec).await;
    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);
    assert_eq!(h.config_version().await, 2);
}

#[tokio::test]
async fn test_fresh_secure_deployment_publishes_first() {
    let h = Harness::new();
    let mut spec = with_tls(replica_set(1));
    spec["topology"]["auth"] = json!({"enabled": true, "modes": ["SCRAM"]});
    h.apply(spec).await;

    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);
    assert!(h.publish_before_apply().await);
}

#[tokio::test]
async fn test_enabling_tls_on_running_members_applies_infrastructure_first() {
    let h = Harness::new();
    h.apply(replica_set(1)).await;
    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);

    h.journal.clear().await;
    h.apply(with_tls(replica_set(1))).await;
    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);

    assert!(!h.publish_before_apply().await);
    let workload = h
        .workloads
        .workload(&key(), None, "app-db")
        .await
        .unwrap();
    assert!(workload.tls_enabled);
}

#[tokio::test]
async fn test_legacy_keyfile_forces_configuration_first() {
    let h = Harness::new();
    h.apply(replica_set(1)).await;
    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);

    let publisher = ConfigPublisher::new(h.records.clone());
    let mut doc = publisher.read_current(&key()).await.unwrap();
    doc.auth.keyfile = Some(LEGACY_KEYFILE_PATH.to_string());
    h.records
        .insert(
            ConfigPublisher::config_record(&key()),
            [(AUTOMATION_CONFIG_KEY.to_string(), serde_json::to_string(&doc).unwrap())]
                .into_iter()
                .collect(),
        )
        .await;

    h.journal.clear().await;
    h.apply(with_tls(replica_set(1))).await;
    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);
    assert!(h.publish_before_apply().await);
}

#[tokio::test]
async fn test_version_upgrade_applies_infrastructure_first() {
    let h = Harness::new();
    h.apply(replica_set(1)).await;
    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);

    h.journal.clear().await;
    let mut spec = replica_set(1);
    spec["topology"]["version"] = json!("7.0.2");
    h.apply(spec).await;
    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);
    assert!(!h.publish_before_apply().await);
}

#[tokio::test]
async fn test_version_downgrade_publishes_first() {
    let h = Harness::new();
    let mut spec = replica_set(1);
    spec["topology"]["version"] = json!("7.0.2");
    h.apply(spec).await;
    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);

    h.journal.clear().await;
    h.apply(replica_set(1)).await;
    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);
    assert!(h.publish_before_apply().await);
}

#[tokio::test]
async fn test_inconsistent_auth_is_invalid_without_side_effects() {
    let h = Harness::new();
    let mut spec = replica_set(3);
    spec["topology"]["auth"] = json!({"enabled": true, "modes": ["X509"]});
    h.apply(spec).await;

    let outcome = h.reconcile().await;
    assert!(outcome.is_invalid(), "{outcome}");
    assert_eq!(h.journal.position(PUBLISH).await, None);
    assert_eq!(h.journal.position(APPLY).await, None);

    let status = h.resource().await.status.unwrap();
    assert_eq!(status.phase, Phase::Failed);
    assert!(status.message.unwrap().contains("X.509"));
}

#[tokio::test]
async fn test_cluster_indices_are_never_reused() {
    let h = Harness::new();
    let mut spec = replica_set(1);
    spec["clusterSpecList"] = json!([
        {"clusterName": "A", "members": 1},
        {"clusterName": "B", "members": 1}
    ]);
    h.apply(spec.clone()).await;
    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);

    spec["clusterSpecList"] = json!([
        {"clusterName": "A", "members": 1},
        {"clusterName": "C", "members": 1}
    ]);
    h.apply(spec).await;
    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);

    let state = DeploymentStateStore::new(h.records.clone())
        .load(&h.resource().await)
        .await
        .unwrap();
    assert_eq!(state.cluster_mapping.get("A"), Some(0));
    assert_eq!(state.cluster_mapping.get("B"), Some(1));
    assert_eq!(state.cluster_mapping.get("C"), Some(2));

    let c = h.workloads.workload(&key(), Some("C"), "app-db-2").await.unwrap();
    assert_eq!(c.members, 1);
    let b = h.workloads.workload(&key(), Some("B"), "app-db-1").await.unwrap();
    assert_eq!(b.members, 0);
}

fn hosts(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn test_emptied_cluster_list_moves_one_member_per_group() {
    let h = Harness::new();
    let mut spec = replica_set(3);
    spec["clusterSpecList"] = json!([
        {"clusterName": "A", "members": 2},
        {"clusterName": "B", "members": 1}
    ]);
    h.apply(spec).await;
    h.reconcile_until_ok(5).await;
    assert_eq!(
        h.replica_set_hosts().await,
        hosts(&["app-db-0-0", "app-db-0-1", "app-db-1-0"])
    );

    h.apply(replica_set(3)).await;
    assert!(h.reconcile().await.is_pending());
    assert_eq!(h.members(Some("A"), "app-db-0").await, 1);
    assert_eq!(h.members(Some("B"), "app-db-1").await, 0);
    assert_eq!(h.members(None, "app-db").await, 1);
    assert_eq!(h.replica_set_hosts().await, hosts(&["app-db-0-0", "app-db-0"]));

    h.reconcile_until_ok(5).await;
    assert_eq!(h.members(Some("A"), "app-db-0").await, 0);
    assert_eq!(h.members(None, "app-db").await, 3);
    assert_eq!(
        h.replica_set_hosts().await,
        hosts(&["app-db-0", "app-db-1", "app-db-2"])
    );

    let state = DeploymentStateStore::new(h.records.clone())
        .load(&h.resource().await)
        .await
        .unwrap();
    assert_eq!(state.cluster_mapping.get("A"), Some(0));
    assert_eq!(state.cluster_mapping.get("B"), Some(1));
}

#[tokio::test]
async fn test_new_cluster_list_drains_single_cluster_members() {
    let h = Harness::new();
    h.apply(replica_set(2)).await;
    h.reconcile_until_ok(5).await;

    let mut spec = replica_set(2);
    spec["clusterSpecList"] = json!([{"clusterName": "A", "members": 2}]);
    h.apply(spec).await;

    assert!(h.reconcile().await.is_pending());
    assert_eq!(h.members(None, "app-db").await, 1);
    assert_eq!(h.members(Some("A"), "app-db-0").await, 1);
    assert_eq!(h.replica_set_hosts().await, hosts(&["app-db-0", "app-db-0-0"]));

    h.reconcile_until_ok(5).await;
    assert_eq!(h.members(None, "app-db").await, 0);
    assert_eq!(h.members(Some("A"), "app-db-0").await, 2);
    assert_eq!(h.replica_set_hosts().await, hosts(&["app-db-0-0", "app-db-0-1"]));
}

#[tokio::test]
async fn test_waits_for_workload_readiness() {
    let h = Harness::new();
    h.workloads.set_auto_ready(false);
    h.apply(replica_set(1)).await;

    let outcome = h.reconcile().await;
    assert!(outcome.is_pending());
    assert!(outcome.reason().unwrap().contains("0/1 members ready"));

    h.workloads.make_all_ready().await;
    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);
}

#[tokio::test]
async fn test_waits_for_agent_goal_state() {
    let h = Harness::new();
    h.management.set_auto_goal_state(false);
    h.apply(replica_set(1)).await;

    let outcome = h.reconcile().await;
    assert!(outcome.is_pending());
    assert!(outcome.reason().unwrap().contains("goal state"));
    assert!(h
        .resource()
        .await
        .annotation(LAST_ACHIEVED_SPEC_ANNOTATION)
        .is_none());

    h.management.set_reached_version(&key(), 1).await;
    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);
}

#[tokio::test]
async fn test_ok_pass_records_last_achieved_spec() {
    let h = Harness::new();
    h.apply(replica_set(1)).await;
    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);

    let resource = h.resource().await;
    let raw = resource.annotation(LAST_ACHIEVED_SPEC_ANNOTATION).unwrap();
    let achieved: Value = serde_json::from_str(raw).unwrap();
    assert_eq!(achieved["topology"]["version"], json!("6.0.5"));

    let state = DeploymentStateStore::new(h.records.clone())
        .load(&resource)
        .await
        .unwrap();
    assert_eq!(state.last_achieved_spec, Some(resource.spec));
}

#[tokio::test]
async fn test_backup_stores_follow_spec_after_scaling() {
    let h = Harness::new();
    let mut spec = replica_set(2);
    spec["backup"] = json!({
        "enabled": true,
        "oplogStores": [{"id": "oplog-1", "uri": "mongodb://oplog"}],
        "s3Stores": [{"id": "snapshots", "bucket": "db-snapshots"}]
    });
    h.apply(spec).await;

    assert!(h.reconcile().await.is_pending());
    assert!(h
        .management
        .store(&key(), StoreCategory::Oplog, "oplog-1")
        .await
        .is_none());

    assert_eq!(h.reconcile().await, ReconcileOutcome::Ok);
    assert!(h
        .management
        .store(&key(), StoreCategory::Oplog, "oplog-1")
        .await
        .is_some());
    let s3 = h
        .management
        .store(&key(), StoreCategory::S3, "snapshots")
        .await
        .unwrap();
    assert_eq!(s3.bucket.as_deref(), Some("db-snapshots"));
}

#[tokio::test]
async fn test_backup_waits_for_daemon() {
    let h = Harness::new();
    h.management.set_daemon_registered(false);
    let mut spec = replica_set(1);
    spec["backup"] = json!({
        "enabled": true,
        "oplogStores": [{"id": "oplog-1", "uri": "mongodb://oplog"}],
        "blockStores": [{"id": "blocks", "uri": "mongodb://blocks"}]
    });
    h.apply(spec).await;

    let outcome = h.reconcile().await;
    assert!(outcome.is_pending());
    assert!(outcome.reason().unwrap().contains("backup daemon"));
}

#[tokio::test]
async fn test_failed_apply_reports_failed() {
    let h = Harness::new();
    h.workloads.set_fail_applies(true);
    h.apply(replica_set(1)).await;

    let outcome = h.reconcile().await;
    assert!(outcome.is_failed());
    assert!(outcome.reason().unwrap().contains("failed to apply workload app-db"));
    assert_eq!(h.resource().await.status.unwrap().phase, Phase::Failed);
}

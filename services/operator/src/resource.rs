//! The declared `DatabaseDeployment` resource and its status.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use dbop_automation::{DesiredTopology, ProcessRole, ResourceType, MAX_GROUP_MEMBERS};
use dbop_reconcile::ReconcileOutcome;
use serde::{Deserialize, Serialize};

/// Annotation holding a copy of the last achieved spec.
pub const LAST_ACHIEVED_SPEC_ANNOTATION: &str = "dbop.io/last-achieved-spec";

/// Namespaced name of a resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseDeployment {
    pub namespace: String,
    pub name: String,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    pub spec: DeploymentSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DeploymentStatus>,
}

impl DatabaseDeployment {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.namespace, &self.name)
    }

    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.annotations.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    pub topology: DesiredTopology,

    /// Per-cluster member counts. Empty for a single-cluster deployment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_spec_list: Vec<ClusterSpecItem>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpec>,
}

impl DeploymentSpec {
    pub fn is_multi_cluster(&self) -> bool {
        !self.cluster_spec_list.is_empty()
    }

    pub fn cluster_names(&self) -> Vec<String> {
        self.cluster_spec_list
            .iter()
            .map(|item| item.cluster_name.clone())
            .collect()
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterSpecItem> {
        self.cluster_spec_list
            .iter()
            .find(|item| item.cluster_name == name)
    }

    /// Desired members for a group with `role`, in `cluster` if the
    /// deployment spans several. Clusters absent from the list get 0.
    pub fn desired_members(&self, role: ProcessRole, cluster: Option<&str>) -> u32 {
        let topology = &self.topology;
        match cluster {
            None => match role {
                ProcessRole::Standalone => 1,
                ProcessRole::ReplicaSetMember | ProcessRole::ShardMember => topology.members,
                ProcessRole::ConfigServer => topology.config_server_count,
                ProcessRole::Router => topology.mongos_count,
            },
            Some(name) => match self.cluster(name) {
                None => 0,
                Some(item) => match role {
                    ProcessRole::Standalone => item.members.min(1),
                    ProcessRole::ReplicaSetMember | ProcessRole::ShardMember => item.members,
                    ProcessRole::ConfigServer => {
                        item.config_server_members.unwrap_or(item.members)
                    }
                    ProcessRole::Router => item.mongos_count.unwrap_or(topology.mongos_count),
                },
            },
        }
    }

    /// Problems that make the spec unrealizable beyond those the topology
    /// itself reports.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = BTreeSet::new();
        for item in &self.cluster_spec_list {
            if item.cluster_name.is_empty() {
                return Err("cluster name must not be empty".to_string());
            }
            if !seen.insert(item.cluster_name.as_str()) {
                return Err(format!("cluster {} is listed twice", item.cluster_name));
            }
        }
        if self.topology.resource_type == ResourceType::Standalone && self.cluster_spec_list.len() > 1
        {
            return Err("a standalone deployment cannot span several clusters".to_string());
        }

        let topology = &self.topology;
        let mut group_sizes = vec![
            ("members".to_string(), topology.members),
            ("configServerCount".to_string(), topology.config_server_count),
        ];
        for item in &self.cluster_spec_list {
            group_sizes.push((format!("cluster {} members", item.cluster_name), item.members));
            if let Some(config_servers) = item.config_server_members {
                group_sizes.push((
                    format!("cluster {} configServerMembers", item.cluster_name),
                    config_servers,
                ));
            }
        }
        if let Some((field, size)) = group_sizes
            .into_iter()
            .find(|(_, size)| *size > MAX_GROUP_MEMBERS)
        {
            return Err(format!(
                "{field} is {size}, more than the {MAX_GROUP_MEMBERS} members a group may have"
            ));
        }

        if let Some(backup) = &self.backup {
            backup.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpecItem {
    pub cluster_name: String,

    /// Members of each replica set (or shard) hosted in this cluster.
    pub members: u32,

    /// Config server members in this cluster; defaults to `members`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_server_members: Option<u32>,

    /// Routers in this cluster; defaults to the topology's `mongosCount`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mongos_count: Option<u32>,
}

/// Backup stores the management service should have for this deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub oplog_stores: Vec<StoreSpec>,

    #[serde(default)]
    pub block_stores: Vec<StoreSpec>,

    #[serde(default)]
    pub s3_stores: Vec<StoreSpec>,

    #[serde(default)]
    pub file_system_stores: Vec<StoreSpec>,
}

impl BackupSpec {
    /// Enabled backup needs an oplog store and at least one head store.
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        if self.oplog_stores.is_empty() {
            return Err("backup requires at least one oplog store".to_string());
        }
        if self.block_stores.is_empty()
            && self.s3_stores.is_empty()
            && self.file_system_stores.is_empty()
        {
            return Err(
                "backup requires at least one block, S3 or file system store".to_string(),
            );
        }
        for (category, stores) in [
            ("oplog", &self.oplog_stores),
            ("block", &self.block_stores),
            ("s3", &self.s3_stores),
            ("file system", &self.file_system_stores),
        ] {
            let mut ids = BTreeSet::new();
            for store in stores {
                if store.id.is_empty() {
                    return Err(format!("{category} store id must not be empty"));
                }
                if !ids.insert(store.id.as_str()) {
                    return Err(format!("{category} store {} is listed twice", store.id));
                }
            }
        }
        Ok(())
    }
}

/// Operator-owned fields of one backup store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSpec {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    #[serde(default = "default_assignment_enabled")]
    pub assignment_enabled: bool,
}

fn default_assignment_enabled() -> bool {
    true
}

/// Coarse state reported on the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Running,
    Pending,
    Failed,
}

impl Phase {
    pub fn from_outcome(outcome: &ReconcileOutcome) -> Self {
        match outcome {
            ReconcileOutcome::Ok => Self::Running,
            ReconcileOutcome::Pending { .. } => Self::Pending,
            ReconcileOutcome::Failed { .. } | ReconcileOutcome::Invalid { .. } => Self::Failed,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "Running",
            Self::Pending => "Pending",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    pub phase: Phase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Version of the automation config the pass ended with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automation_config_version: Option<i64>,

    /// Members applied per workload this pass.
    #[serde(default)]
    pub members: BTreeMap<String, u32>,

    pub last_transition: DateTime<Utc>,
}

impl DeploymentStatus {
    /// Status for `outcome`. The transition time only moves when the phase
    /// changes.
    pub fn from_outcome(
        outcome: &ReconcileOutcome,
        previous: Option<&DeploymentStatus>,
        automation_config_version: Option<i64>,
        members: BTreeMap<String, u32>,
        now: DateTime<Utc>,
    ) -> Self {
        let phase = Phase::from_outcome(outcome);
        let last_transition = match previous {
            Some(prev) if prev.phase == phase => prev.last_transition,
            _ => now,
        };
        Self {
            phase,
            message: outcome.reason().map(str::to_string),
            automation_config_version: automation_config_version
                .or_else(|| previous.and_then(|p| p.automation_config_version)),
            members,
            last_transition,
        }
    }
}

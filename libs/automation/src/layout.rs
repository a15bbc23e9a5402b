//! Member groups and the processes derived from them.
//!
//! A member group is the set of identical processes that the workload
//! scheduler runs as one unit in one compute cluster: a replica set, one
//! cluster's share of a replica set or shard, a config server set, or the
//! routers. Group names, hostnames and replica-set member ids derive from
//! the stable cluster index, so they never change when clusters are added or
//! removed.

use std::collections::BTreeSet;

use crate::{DesiredTopology, ResourceType};

/// Member ids are `pod` in a single-cluster group and
/// `(cluster_index + 1) * MEMBER_ID_CLUSTER_STRIDE + pod` in a cluster's
/// group, so single-cluster members and every cluster's members never share
/// an id while a deployment moves between the two layouts. Groups are capped
/// at `MAX_GROUP_MEMBERS` so a group never spills into the next range.
pub const MEMBER_ID_CLUSTER_STRIDE: u32 = 1000;

/// Largest member count a single group may have.
pub const MAX_GROUP_MEMBERS: u32 = MEMBER_ID_CLUSTER_STRIDE - 1;

/// What a process does in the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProcessRole {
    Standalone,
    ReplicaSetMember,
    ShardMember,
    ConfigServer,
    Router,
}

impl ProcessRole {
    /// Voting replica-set members are scaled one at a time.
    pub fn is_stepped(&self) -> bool {
        matches!(
            self,
            Self::ReplicaSetMember | Self::ShardMember | Self::ConfigServer
        )
    }

    pub fn is_router(&self) -> bool {
        matches!(self, Self::Router)
    }
}

/// A compute cluster and its stable index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterPlacement {
    pub name: String,
    pub index: u32,
}

/// Processes run as one workload in one compute cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberGroup {
    /// Name of the workload and prefix of every process name in the group.
    pub workload_name: String,
    /// Replica set the members join, if any.
    pub replica_set: Option<String>,
    pub role: ProcessRole,
    /// `None` for a deployment confined to a single cluster.
    pub cluster: Option<ClusterPlacement>,
}

impl MemberGroup {
    pub fn cluster_name(&self) -> Option<&str> {
        self.cluster.as_ref().map(|c| c.name.as_str())
    }

    pub fn process_name(&self, pod: u32) -> String {
        format!("{}-{}", self.workload_name, pod)
    }

    pub fn hostname(&self, pod: u32, deployment: &str, namespace: &str) -> String {
        format!(
            "{}.{}-svc.{}.svc.cluster.local",
            self.process_name(pod),
            deployment,
            namespace
        )
    }

    pub fn member_id(&self, pod: u32) -> u32 {
        match &self.cluster {
            Some(cluster) => (cluster.index + 1) * MEMBER_ID_CLUSTER_STRIDE + pod,
            None => pod,
        }
    }
}

/// Member groups for a deployment.
///
/// With no `clusters` the deployment is confined to one cluster and names
/// carry no cluster index.
pub fn member_groups(
    deployment: &str,
    topology: &DesiredTopology,
    clusters: &[ClusterPlacement],
) -> Vec<MemberGroup> {
    let placements: Vec<Option<&ClusterPlacement>> = if clusters.is_empty() {
        vec![None]
    } else {
        clusters.iter().map(Some).collect()
    };

    let mut groups = Vec::new();
    for placement in placements {
        let workload = |base: String| match placement {
            Some(cluster) => format!("{}-{}", base, cluster.index),
            None => base,
        };
        let group = |base: String, replica_set: Option<String>, role: ProcessRole| MemberGroup {
            workload_name: workload(base),
            replica_set,
            role,
            cluster: placement.cloned(),
        };

        match topology.resource_type {
            ResourceType::Standalone => {
                groups.push(group(deployment.to_string(), None, ProcessRole::Standalone));
            }
            ResourceType::ReplicaSet => {
                groups.push(group(
                    deployment.to_string(),
                    Some(deployment.to_string()),
                    ProcessRole::ReplicaSetMember,
                ));
            }
            ResourceType::ShardedCluster => {
                for shard in 0..topology.shard_count {
                    let name = format!("{deployment}-{shard}");
                    groups.push(group(name.clone(), Some(name), ProcessRole::ShardMember));
                }
                let config = format!("{deployment}-config");
                groups.push(group(config.clone(), Some(config), ProcessRole::ConfigServer));
                groups.push(group(
                    format!("{deployment}-mongos"),
                    None,
                    ProcessRole::Router,
                ));
            }
        }
    }
    groups
}

/// One concrete process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLayout {
    pub name: String,
    pub hostname: String,
    pub role: ProcessRole,
    pub replica_set: Option<String>,
    pub member_id: u32,
}

/// Every process the document should describe this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentLayout {
    pub deployment: String,
    pub namespace: String,
    pub processes: Vec<ProcessLayout>,
}

impl DeploymentLayout {
    /// Expand groups into processes, `members` per group.
    pub fn new<'a, I>(deployment: &str, namespace: &str, groups: I) -> Self
    where
        I: IntoIterator<Item = (&'a MemberGroup, u32)>,
    {
        let mut processes = Vec::new();
        for (group, members) in groups {
            for pod in 0..members {
                processes.push(ProcessLayout {
                    name: group.process_name(pod),
                    hostname: group.hostname(pod, deployment, namespace),
                    role: group.role,
                    replica_set: group.replica_set.clone(),
                    member_id: group.member_id(pod),
                });
            }
        }
        Self {
            deployment: deployment.to_string(),
            namespace: namespace.to_string(),
            processes,
        }
    }

    /// Replica sets with at least one member.
    pub fn replica_sets(&self) -> BTreeSet<&str> {
        self.processes
            .iter()
            .filter_map(|p| p.replica_set.as_deref())
            .collect()
    }

    pub fn members_of<'a>(&'a self, replica_set: &'a str) -> impl Iterator<Item = &'a ProcessLayout> {
        self.processes
            .iter()
            .filter(move |p| p.replica_set.as_deref() == Some(replica_set))
    }

    pub fn hostnames(&self) -> BTreeSet<&str> {
        self.processes.iter().map(|p| p.hostname.as_str()).collect()
    }

    pub fn routers(&self) -> impl Iterator<Item = &ProcessLayout> {
        self.processes.iter().filter(|p| p.role.is_router())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuthSettings, ProcessOptions, TlsSettings};

    fn topology(resource_type: ResourceType) -> DesiredTopology {
        DesiredTopology {
            resource_type,
            version: "6.0.5".to_string(),
            feature_compatibility_version: None,
            members: 3,
            shard_count: 2,
            config_server_count: 3,
            mongos_count: 2,
            process: ProcessOptions::default(),
            tls: TlsSettings::default(),
            auth: AuthSettings::default(),
            monitoring_agent_version: None,
        }
    }

    fn cluster(name: &str, index: u32) -> ClusterPlacement {
        ClusterPlacement {
            name: name.to_string(),
            index,
        }
    }

    #[test]
    fn test_single_cluster_replica_set() {
        let groups = member_groups("app-db", &topology(ResourceType::ReplicaSet), &[]);
        assert_eq!(groups.len(), 1);

        let layout = DeploymentLayout::new("app-db", "ops", groups.iter().map(|g| (g, 2)));
        let names: Vec<_> = layout.processes.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["app-db-0", "app-db-1"]);
        assert_eq!(
            layout.processes[1].hostname,
            "app-db-1.app-db-svc.ops.svc.cluster.local"
        );
        assert_eq!(layout.processes[1].member_id, 1);
    }

    #[test]
    fn test_multi_cluster_names_follow_cluster_index() {
        let clusters = [cluster("east", 0), cluster("west", 2)];
        let groups = member_groups("app-db", &topology(ResourceType::ReplicaSet), &clusters);

        let workloads: Vec<_> = groups.iter().map(|g| g.workload_name.as_str()).collect();
        assert_eq!(workloads, vec!["app-db-0", "app-db-2"]);
        assert_eq!(groups[1].cluster_name(), Some("west"));

        let layout = DeploymentLayout::new("app-db", "ops", groups.iter().map(|g| (g, 1)));
        let ids: Vec<_> = layout.processes.iter().map(|p| p.member_id).collect();
        assert_eq!(ids, vec![1000, 3000]);
        assert_eq!(layout.replica_sets().into_iter().collect::<Vec<_>>(), vec!["app-db"]);
        assert_eq!(layout.members_of("app-db").count(), 2);
    }

    #[test]
    fn test_member_ids_do_not_overlap_across_layouts() {
        let topology = topology(ResourceType::ReplicaSet);
        let single = member_groups("app-db", &topology, &[]);
        let clustered = member_groups("app-db", &topology, &[cluster("east", 0), cluster("west", 1)]);

        let layout = DeploymentLayout::new(
            "app-db",
            "ops",
            single
                .iter()
                .chain(clustered.iter())
                .map(|g| (g, MAX_GROUP_MEMBERS)),
        );
        let ids: BTreeSet<u32> = layout.processes.iter().map(|p| p.member_id).collect();
        assert_eq!(ids.len(), layout.processes.len());
    }

    #[test]
    fn test_sharded_cluster_groups() {
        let groups = member_groups("sh", &topology(ResourceType::ShardedCluster), &[]);
        let summary: Vec<_> = groups
            .iter()
            .map(|g| (g.workload_name.as_str(), g.role))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("sh-0", ProcessRole::ShardMember),
                ("sh-1", ProcessRole::ShardMember),
                ("sh-config", ProcessRole::ConfigServer),
                ("sh-mongos", ProcessRole::Router),
            ]
        );
        assert!(!groups[3].role.is_stepped());
        assert!(groups[0].role.is_stepped());
    }

    #[test]
    fn test_standalone_has_no_replica_set() {
        let groups = member_groups("single", &topology(ResourceType::Standalone), &[]);
        let layout = DeploymentLayout::new("single", "ops", groups.iter().map(|g| (g, 1)));
        assert!(layout.replica_sets().is_empty());
        assert_eq!(layout.processes.len(), 1);
    }
}

//! Member groups with their observed and planned member counts.

use anyhow::{Context, Result};
use dbop_automation::{member_groups, ClusterPlacement, MemberGroup};
use dbop_reconcile::{ClusterMapping, Resolution, ScalingPlan};
use tracing::debug;

use crate::resource::DatabaseDeployment;
use crate::workload::{WorkloadScheduler, WorkloadStatus};

/// One member group and what this pass does with it.
#[derive(Debug, Clone)]
pub struct PlannedGroup {
    pub group: MemberGroup,
    pub observed: WorkloadStatus,
    pub plan: ScalingPlan,
}

impl PlannedGroup {
    pub fn workload_name(&self) -> &str {
        &self.group.workload_name
    }
}

fn placement(name: &str, index: u32) -> ClusterPlacement {
    ClusterPlacement {
        name: name.to_string(),
        index,
    }
}

/// Every group that should exist or may still run members, with its
/// desired member count.
///
/// Besides the groups the spec declares, this covers clusters that are in
/// the mapping but no longer declared (including all of them once the
/// cluster list is emptied) and the unindexed single-cluster groups of a
/// deployment that has since gained a cluster list. Those are all wanted at
/// zero.
fn candidate_groups(
    resource: &DatabaseDeployment,
    resolution: &Resolution,
    mapping: &ClusterMapping,
) -> Vec<(MemberGroup, u32)> {
    let spec = &resource.spec;
    let topology = &spec.topology;
    let name = resource.name.as_str();

    let mut candidates: Vec<(MemberGroup, u32)> = Vec::new();
    if spec.is_multi_cluster() {
        let declared: Vec<ClusterPlacement> = resolution
            .indices
            .iter()
            .map(|(cluster, index)| placement(cluster, *index))
            .collect();
        candidates.extend(member_groups(name, topology, &declared).into_iter().map(|group| {
            let desired = spec.desired_members(group.role, group.cluster_name());
            (group, desired)
        }));
        candidates.extend(member_groups(name, topology, &[]).into_iter().map(|group| (group, 0)));
    } else {
        candidates.extend(member_groups(name, topology, &[]).into_iter().map(|group| {
            let desired = spec.desired_members(group.role, None);
            (group, desired)
        }));
    }

    let declared_names: Vec<String> = resolution
        .indices
        .iter()
        .map(|(cluster, _)| cluster.clone())
        .collect();
    let retired: Vec<ClusterPlacement> = mapping
        .retired(&declared_names)
        .map(|(cluster, index)| placement(cluster, index))
        .collect();
    if !retired.is_empty() {
        candidates.extend(member_groups(name, topology, &retired).into_iter().map(|group| (group, 0)));
    }

    candidates
}

/// Observe every member group of `resource` and plan this pass's step.
///
/// Voting groups move one member per pass; routers and standalones jump to
/// their target. Groups no longer declared are scaled toward zero and
/// dropped once empty.
pub async fn plan_member_groups(
    workloads: &dyn WorkloadScheduler,
    resource: &DatabaseDeployment,
    resolution: &Resolution,
    mapping: &ClusterMapping,
) -> Result<Vec<PlannedGroup>> {
    let key = resource.key();

    let mut planned = Vec::new();
    for (group, desired) in candidate_groups(resource, resolution, mapping) {
        let observed = workloads
            .status(&key, group.cluster_name(), &group.workload_name)
            .await
            .with_context(|| format!("failed to read workload {}", group.workload_name))?;

        if desired == 0 && observed.members == 0 {
            debug!(workload = %group.workload_name, "Skipping empty group");
            continue;
        }

        let plan = if group.role.is_stepped() {
            ScalingPlan::stepped(observed.members, desired)
        } else {
            ScalingPlan::direct(observed.members, desired)
        };
        planned.push(PlannedGroup {
            group,
            observed,
            plan,
        });
    }

    Ok(planned)
}

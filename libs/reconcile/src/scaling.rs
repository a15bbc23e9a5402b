//! Incremental scaling of member groups.
//!
//! A member group (a replica set, or one compute cluster's share of it) moves
//! by at most one member per pass. Groups are stepped independently, so a pass
//! may advance several groups at once.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;

use crate::ReconcileOutcome;

/// Member count to apply this pass for a group currently at `current`.
pub fn next_step_members(current: u32, desired: u32) -> u32 {
    if current == desired {
        desired
    } else if desired > current {
        current + 1
    } else {
        current - 1
    }
}

/// Scaling decision for one member group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingPlan {
    pub current: u32,
    pub desired: u32,
    pub step: u32,
}

impl ScalingPlan {
    /// Plan a one-member step toward `desired`.
    pub fn stepped(current: u32, desired: u32) -> Self {
        Self {
            current,
            desired,
            step: next_step_members(current, desired),
        }
    }

    /// Plan that jumps straight to `desired` (non-voting groups such as routers).
    pub fn direct(current: u32, desired: u32) -> Self {
        Self {
            current,
            desired,
            step: desired,
        }
    }

    /// True once the step applied this pass reaches the target.
    pub fn reaches_target(&self) -> bool {
        self.step == self.desired
    }
}

/// Step every group independently.
pub fn plan_groups<K, I>(groups: I) -> BTreeMap<K, ScalingPlan>
where
    K: Ord,
    I: IntoIterator<Item = (K, u32, u32)>,
{
    groups
        .into_iter()
        .map(|(key, current, desired)| (key, ScalingPlan::stepped(current, desired)))
        .collect()
}

/// `Pending` with `retry_after` while any group has not reached its target,
/// otherwise `Ok`.
pub fn scaling_outcome<K: Display>(
    plans: &BTreeMap<K, ScalingPlan>,
    retry_after: Duration,
) -> ReconcileOutcome {
    let still_scaling: Vec<String> = plans
        .iter()
        .filter(|(_, plan)| !plan.reaches_target())
        .map(|(key, plan)| format!("{key} {}->{} of {}", plan.current, plan.step, plan.desired))
        .collect();

    if still_scaling.is_empty() {
        ReconcileOutcome::Ok
    } else {
        ReconcileOutcome::pending(format!(
            "scaling one member at a time: {}",
            still_scaling.join(", ")
        ))
        .with_retry_after(retry_after)
    }
}

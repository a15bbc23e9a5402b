//! Per-resource reconciliation.
//!
//! One pass, in order:
//! 1. validate the spec (`Invalid` on failure)
//! 2. load state and resolve cluster indices, persisting new assignments
//! 3. observe member groups and plan a one-member step per voting group
//! 4. decide the apply order and run publish + workload apply in it
//! 5. wait for workload readiness and agent goal state
//! 6. report `Pending` while any group is still stepping
//! 7. align backup stores
//!
//! Whatever the outcome, status is written to the resource and the state
//! record. An `Ok` pass also records the spec as last achieved.

mod groups;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use dbop_automation::{
    is_major_minor_upgrade, AutomationConfigDocument, BuildRequest, DeploymentLayout, TlsMode,
};
use dbop_reconcile::{
    resolve_cluster_indices, run_in_order, scaling_outcome, ApplyOrder, OrderingInputs,
    ReconcileOutcome, ScalingPlan, DEFAULT_SCALING_RETRY,
};
use tracing::{debug, info, instrument, warn};

use crate::backup::reconcile_backup;
use crate::client::ResourceClient;
use crate::config::OperatorConfig;
use crate::management::ManagementService;
use crate::publisher::{ConfigPublisher, PublishOutcome};
use crate::resource::{
    DatabaseDeployment, DeploymentStatus, ResourceKey, LAST_ACHIEVED_SPEC_ANNOTATION,
};
use crate::state::{DeploymentState, DeploymentStateStore};
use crate::store::RecordStore;
use crate::workload::{WorkloadRequest, WorkloadScheduler};

pub use groups::{plan_member_groups, PlannedGroup};

/// Retry delays used by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Pending delay between single-member scaling steps.
    pub scaling_retry: Duration,
    /// Pending delay while waiting on workloads, agents or the backup daemon.
    pub readiness_retry: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            scaling_retry: DEFAULT_SCALING_RETRY,
            readiness_retry: Duration::from_secs(10),
        }
    }
}

impl From<&OperatorConfig> for ReconcilerConfig {
    fn from(config: &OperatorConfig) -> Self {
        Self {
            scaling_retry: config.scaling_retry(),
            readiness_retry: config.readiness_retry(),
        }
    }
}

/// External systems the reconciler works through.
#[derive(Clone)]
pub struct Collaborators {
    pub records: Arc<dyn RecordStore>,
    pub resources: Arc<dyn ResourceClient>,
    pub workloads: Arc<dyn WorkloadScheduler>,
    pub management: Arc<dyn ManagementService>,
}

/// What a pass observed and did, for the status.
#[derive(Debug, Default)]
struct PassReport {
    version: Option<i64>,
    members: BTreeMap<String, u32>,
}

pub struct Reconciler {
    states: DeploymentStateStore,
    publisher: ConfigPublisher,
    resources: Arc<dyn ResourceClient>,
    workloads: Arc<dyn WorkloadScheduler>,
    management: Arc<dyn ManagementService>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(collaborators: Collaborators, config: ReconcilerConfig) -> Self {
        Self {
            states: DeploymentStateStore::new(collaborators.records.clone()),
            publisher: ConfigPublisher::new(collaborators.records),
            resources: collaborators.resources,
            workloads: collaborators.workloads,
            management: collaborators.management,
            config,
        }
    }

    pub fn resources(&self) -> &Arc<dyn ResourceClient> {
        &self.resources
    }

    /// Run one pass for `resource` and record its outcome.
    #[instrument(skip(self, resource), fields(resource = %resource.key()))]
    pub async fn reconcile(&self, resource: &DatabaseDeployment) -> ReconcileOutcome {
        let key = resource.key();

        let mut state = match self.states.load(resource).await {
            Ok(state) => state,
            Err(e) => {
                let outcome =
                    ReconcileOutcome::failed(format!("failed to load deployment state: {e}"));
                let status = DeploymentStatus::from_outcome(
                    &outcome,
                    resource.status.as_ref(),
                    None,
                    BTreeMap::new(),
                    Utc::now(),
                );
                self.write_status(&key, &status).await;
                log_outcome(&outcome);
                return outcome;
            }
        };

        let mut report = PassReport::default();
        let mut outcome = self.run_pass(resource, &mut state, &mut report).await;

        if outcome.is_ok() {
            state.last_achieved_spec = Some(resource.spec.clone());
            if let Err(e) = self.record_achieved_spec(resource).await {
                outcome = ReconcileOutcome::failed(format!("{e:#}"));
            }
        }

        let previous_status = state.status.clone().or_else(|| resource.status.clone());
        let now = Utc::now();
        let mut status = DeploymentStatus::from_outcome(
            &outcome,
            previous_status.as_ref(),
            report.version,
            report.members.clone(),
            now,
        );
        state.status = Some(status.clone());

        if let Err(e) = self.states.save(&key, &state).await {
            outcome = ReconcileOutcome::failed(format!("failed to save deployment state: {e}"));
            status = DeploymentStatus::from_outcome(
                &outcome,
                previous_status.as_ref(),
                report.version,
                report.members,
                now,
            );
        }

        self.write_status(&key, &status).await;
        log_outcome(&outcome);
        outcome
    }

    async fn run_pass(
        &self,
        resource: &DatabaseDeployment,
        state: &mut DeploymentState,
        report: &mut PassReport,
    ) -> ReconcileOutcome {
        let key = resource.key();
        let spec = &resource.spec;
        let topology = &spec.topology;

        if let Err(e) = topology.validate() {
            return ReconcileOutcome::invalid(e.to_string());
        }
        if let Err(reason) = spec.validate() {
            return ReconcileOutcome::invalid(reason);
        }

        let resolution = resolve_cluster_indices(&state.cluster_mapping, &spec.cluster_names());
        if resolution.changed {
            state.cluster_mapping = resolution.mapping.clone();
            if let Err(e) = self.states.save(&key, state).await {
                return ReconcileOutcome::failed(format!("failed to persist cluster mapping: {e}"));
            }
        }

        let planned = match plan_member_groups(
            self.workloads.as_ref(),
            resource,
            &resolution,
            &state.cluster_mapping,
        )
        .await
        {
            Ok(planned) => planned,
            Err(e) => return ReconcileOutcome::failed(format!("{e:#}")),
        };
        report.members = planned
            .iter()
            .map(|g| (g.workload_name().to_string(), g.observed.members))
            .collect();

        let previous = match self.publisher.read_current(&key).await {
            Ok(doc) => doc,
            Err(e) => return e.to_outcome(),
        };
        if previous.version > 0 {
            report.version = Some(previous.version);
        }

        let inputs = OrderingInputs {
            current_members: planned.iter().map(|g| g.observed.members).sum(),
            tls_enabling: topology.tls.effective_mode() != TlsMode::Disabled
                && !previous.processes.is_empty()
                && !previous.tls_enabled(),
            version_upgrade: state
                .last_achieved_spec
                .as_ref()
                .is_some_and(|achieved| {
                    is_major_minor_upgrade(&achieved.topology.version, &topology.version)
                }),
            legacy_keyfile: previous.uses_legacy_keyfile(),
        };
        let (order, reason) = ApplyOrder::decide(&inputs);
        if order == ApplyOrder::InfrastructureFirst {
            info!(reason = %reason, "Applying infrastructure before configuration");
        } else {
            debug!(reason = %reason, "Applying configuration before infrastructure");
        }

        let layout = DeploymentLayout::new(
            &key.name,
            &key.namespace,
            planned.iter().map(|g| (&g.group, g.plan.step)),
        );
        let request = BuildRequest {
            topology,
            layout: &layout,
        };

        let mut published_version = None;
        let outcome = run_in_order(
            order,
            || self.publish_configuration(&key, &previous, &request, &mut published_version),
            || self.apply_infrastructure(&key, resource, &planned),
        )
        .await;
        if let Some(version) = published_version {
            report.version = Some(version);
        }
        if !outcome.is_ok() {
            return outcome;
        }
        report.members = planned
            .iter()
            .map(|g| (g.workload_name().to_string(), g.plan.step))
            .collect();

        let waiting = self.wait_for_workloads(&key, &planned).await;
        if !waiting.is_ok() {
            return waiting;
        }

        let goal_version = report.version.unwrap_or(previous.version);
        match self.management.goal_version_reached(&key, goal_version).await {
            Ok(true) => {}
            Ok(false) => {
                return ReconcileOutcome::pending(format!(
                    "waiting for agents to reach goal state (version {goal_version})"
                ))
                .with_retry_after(self.config.readiness_retry);
            }
            Err(e) => {
                return ReconcileOutcome::failed(format!(
                    "failed to read agent goal state for {key}: {e:#}"
                ));
            }
        }

        let plans: BTreeMap<String, ScalingPlan> = planned
            .iter()
            .map(|g| (g.workload_name().to_string(), g.plan))
            .collect();
        let scaling = scaling_outcome(&plans, self.config.scaling_retry);
        if !scaling.is_ok() {
            return scaling;
        }

        reconcile_backup(
            self.management.as_ref(),
            &key,
            spec.backup.as_ref(),
            self.config.readiness_retry,
        )
        .await
    }

    async fn publish_configuration(
        &self,
        key: &ResourceKey,
        previous: &AutomationConfigDocument,
        request: &BuildRequest<'_>,
        published_version: &mut Option<i64>,
    ) -> ReconcileOutcome {
        match self.publisher.publish(key, previous, request).await {
            Ok(PublishOutcome::Published(doc)) => {
                *published_version = Some(doc.version);
                ReconcileOutcome::Ok
            }
            Ok(PublishOutcome::Unchanged(_)) => ReconcileOutcome::Ok,
            Err(e) => e.to_outcome(),
        }
    }

    async fn apply_infrastructure(
        &self,
        key: &ResourceKey,
        resource: &DatabaseDeployment,
        planned: &[PlannedGroup],
    ) -> ReconcileOutcome {
        let topology = &resource.spec.topology;
        for group in planned {
            let request = WorkloadRequest {
                resource: key.clone(),
                workload_name: group.workload_name().to_string(),
                cluster: group.group.cluster_name().map(str::to_string),
                role: group.group.role,
                members: group.plan.step,
                version: topology.version.clone(),
                tls_enabled: topology.tls.effective_mode() != TlsMode::Disabled,
            };
            if let Err(e) = self.workloads.apply(&request).await {
                return ReconcileOutcome::failed(format!(
                    "failed to apply workload {}: {e:#}",
                    request.workload_name
                ));
            }
        }
        ReconcileOutcome::Ok
    }

    async fn wait_for_workloads(
        &self,
        key: &ResourceKey,
        planned: &[PlannedGroup],
    ) -> ReconcileOutcome {
        for group in planned.iter().filter(|g| g.plan.step > 0) {
            let status = match self
                .workloads
                .status(key, group.group.cluster_name(), group.workload_name())
                .await
            {
                Ok(status) => status,
                Err(e) => {
                    return ReconcileOutcome::failed(format!(
                        "failed to read workload {}: {e:#}",
                        group.workload_name()
                    ));
                }
            };
            if status.ready_members < group.plan.step {
                return ReconcileOutcome::pending(format!(
                    "waiting for workload {}: {}/{} members ready",
                    group.workload_name(),
                    status.ready_members,
                    group.plan.step
                ))
                .with_retry_after(self.config.readiness_retry);
            }
        }
        ReconcileOutcome::Ok
    }

    /// Copy the spec into the last-achieved annotation, unless already there.
    async fn record_achieved_spec(&self, resource: &DatabaseDeployment) -> Result<()> {
        let raw = serde_json::to_string(&resource.spec).context("failed to encode spec")?;
        if resource.annotation(LAST_ACHIEVED_SPEC_ANNOTATION) == Some(raw.as_str()) {
            return Ok(());
        }
        self.resources
            .set_annotation(&resource.key(), LAST_ACHIEVED_SPEC_ANNOTATION, &raw)
            .await
            .with_context(|| format!("failed to annotate {} with last achieved spec", resource.key()))
    }

    async fn write_status(&self, key: &ResourceKey, status: &DeploymentStatus) {
        if let Err(e) = self.resources.update_status(key, status).await {
            warn!(error = %format!("{e:#}"), "Failed to update resource status");
        }
    }
}

fn log_outcome(outcome: &ReconcileOutcome) {
    match outcome {
        ReconcileOutcome::Ok => debug!("Reconciliation complete"),
        ReconcileOutcome::Pending {
            reason,
            retry_after,
        } => info!(
            reason = %reason,
            retry_after_secs = retry_after.map(|d| d.as_secs()),
            "Reconciliation pending"
        ),
        ReconcileOutcome::Failed { reason, .. } => {
            warn!(reason = %reason, "Reconciliation failed")
        }
        ReconcileOutcome::Invalid { reason } => {
            warn!(reason = %reason, "Deployment spec is invalid")
        }
    }
}

//! Reconcile background worker.
//!
//! Wakes every tick, lists resources and runs a pass for each one that is
//! due: never reconciled, spec changed since its last pass, or past its
//! requeue time. Independent resources are reconciled concurrently. Each
//! outcome sets the next due time: its retry delay if it carries one,
//! otherwise the resync interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dbop_reconcile::{ReconcileOutcome, SpecHash};
use futures_util::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument};

use crate::config::OperatorConfig;
use crate::controller::Reconciler;
use crate::resource::{DatabaseDeployment, ResourceKey};

/// Worker timing.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub tick_interval: Duration,
    pub resync_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            resync_interval: Duration::from_secs(30),
        }
    }
}

impl From<&OperatorConfig> for WorkerConfig {
    fn from(config: &OperatorConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            resync_interval: config.resync_interval(),
        }
    }
}

#[derive(Debug, Clone)]
struct Schedule {
    due: Instant,
    spec_hash: Option<SpecHash>,
}

/// Counts from one worker pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub listed: usize,
    pub reconciled: usize,
    pub ok: usize,
    pub pending: usize,
    pub failed: usize,
    pub invalid: usize,
}

pub struct ReconcileWorker {
    reconciler: Arc<Reconciler>,
    config: WorkerConfig,
    schedule: Mutex<HashMap<ResourceKey, Schedule>>,
}

impl ReconcileWorker {
    pub fn new(reconciler: Arc<Reconciler>, config: WorkerConfig) -> Self {
        Self {
            reconciler,
            config,
            schedule: Mutex::new(HashMap::new()),
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_interval_secs = self.config.tick_interval.as_secs(),
            resync_interval_secs = self.config.resync_interval.as_secs(),
            "Starting reconcile worker"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %format!("{e:#}"), "Reconcile pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconcile worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Reconcile every resource that is due now.
    pub async fn run_once(&self) -> anyhow::Result<PassStats> {
        let resources = self.reconciler.resources().list().await?;
        let now = Instant::now();

        let due: Vec<(DatabaseDeployment, Option<SpecHash>)> = {
            let mut schedule = self.schedule.lock().await;
            schedule.retain(|key, _| resources.iter().any(|r| &r.key() == key));

            resources
                .iter()
                .filter_map(|resource| {
                    let hash = SpecHash::of(&resource.spec).ok();
                    let is_due = match schedule.get(&resource.key()) {
                        None => true,
                        Some(entry) => {
                            entry.due <= now || hash.is_none() || entry.spec_hash != hash
                        }
                    };
                    is_due.then(|| (resource.clone(), hash))
                })
                .collect()
        };

        let mut stats = PassStats {
            listed: resources.len(),
            reconciled: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(stats);
        }

        let outcomes = join_all(
            due.iter()
                .map(|(resource, _)| self.reconciler.reconcile(resource)),
        )
        .await;

        let mut schedule = self.schedule.lock().await;
        for ((resource, hash), outcome) in due.into_iter().zip(outcomes) {
            match &outcome {
                ReconcileOutcome::Ok => stats.ok += 1,
                ReconcileOutcome::Pending { .. } => stats.pending += 1,
                ReconcileOutcome::Failed { .. } => stats.failed += 1,
                ReconcileOutcome::Invalid { .. } => stats.invalid += 1,
            }
            let delay = self.requeue_after(&outcome);
            debug!(resource = %resource.key(), delay_secs = delay.as_secs(), "Requeued");
            schedule.insert(
                resource.key(),
                Schedule {
                    due: Instant::now() + delay,
                    spec_hash: hash,
                },
            );
        }

        if stats.pending + stats.failed + stats.invalid > 0 {
            info!(
                reconciled = stats.reconciled,
                pending = stats.pending,
                failed = stats.failed,
                invalid = stats.invalid,
                "Reconcile pass complete"
            );
        }

        Ok(stats)
    }

    fn requeue_after(&self, outcome: &ReconcileOutcome) -> Duration {
        outcome.retry_after().unwrap_or(self.config.resync_interval)
    }
}

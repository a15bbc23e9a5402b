//! Workload scheduler interface and mock implementation.
//!
//! The workload scheduler runs one workload per member group: it owns the
//! processes, their volumes and certificates. The operator only asks for a
//! member count, version and TLS flag, and reads back how many members exist
//! and how many are ready.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use dbop_automation::ProcessRole;
use tokio::sync::RwLock;
use tracing::info;

use crate::journal::Journal;
use crate::resource::ResourceKey;

/// Desired shape of one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRequest {
    pub resource: ResourceKey,
    pub workload_name: String,
    /// Compute cluster the workload runs in; `None` for single-cluster.
    pub cluster: Option<String>,
    pub role: ProcessRole,
    pub members: u32,
    pub version: String,
    pub tls_enabled: bool,
}

/// Observed state of one workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkloadStatus {
    pub exists: bool,
    pub members: u32,
    pub ready_members: u32,
}

/// Workload scheduler interface.
#[async_trait]
pub trait WorkloadScheduler: Send + Sync {
    /// Observed state; a missing workload reports `exists == false`.
    async fn status(
        &self,
        resource: &ResourceKey,
        cluster: Option<&str>,
        workload_name: &str,
    ) -> Result<WorkloadStatus>;

    /// Create or update a workload.
    async fn apply(&self, request: &WorkloadRequest) -> Result<()>;
}

type WorkloadId = (ResourceKey, Option<String>, String);

#[derive(Debug, Clone)]
struct MockWorkload {
    request: WorkloadRequest,
    ready_members: u32,
}

/// Mock workload scheduler for testing and local runs.
pub struct MockWorkloadScheduler {
    workloads: RwLock<BTreeMap<WorkloadId, MockWorkload>>,

    /// Whether applied members become ready immediately.
    auto_ready: AtomicBool,

    /// Whether applies should "fail".
    fail_applies: AtomicBool,

    journal: Option<Journal>,
}

impl MockWorkloadScheduler {
    pub fn new() -> Self {
        Self {
            workloads: RwLock::new(BTreeMap::new()),
            auto_ready: AtomicBool::new(true),
            fail_applies: AtomicBool::new(false),
            journal: None,
        }
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::new()
        }
    }

    pub fn set_auto_ready(&self, auto_ready: bool) {
        self.auto_ready.store(auto_ready, Ordering::SeqCst);
    }

    pub fn set_fail_applies(&self, fail: bool) {
        self.fail_applies.store(fail, Ordering::SeqCst);
    }

    /// Mark every member of every workload ready.
    pub async fn make_all_ready(&self) {
        for workload in self.workloads.write().await.values_mut() {
            workload.ready_members = workload.request.members;
        }
    }

    /// Last request applied for a workload.
    pub async fn workload(
        &self,
        resource: &ResourceKey,
        cluster: Option<&str>,
        workload_name: &str,
    ) -> Option<WorkloadRequest> {
        let id = (
            resource.clone(),
            cluster.map(str::to_string),
            workload_name.to_string(),
        );
        self.workloads
            .read()
            .await
            .get(&id)
            .map(|w| w.request.clone())
    }

    /// Total members across the resource's workloads.
    pub async fn total_members(&self, resource: &ResourceKey) -> u32 {
        self.workloads
            .read()
            .await
            .iter()
            .filter(|((key, _, _), _)| key == resource)
            .map(|(_, w)| w.request.members)
            .sum()
    }
}

impl Default for MockWorkloadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkloadScheduler for MockWorkloadScheduler {
    async fn status(
        &self,
        resource: &ResourceKey,
        cluster: Option<&str>,
        workload_name: &str,
    ) -> Result<WorkloadStatus> {
        let id = (
            resource.clone(),
            cluster.map(str::to_string),
            workload_name.to_string(),
        );
        Ok(match self.workloads.read().await.get(&id) {
            Some(w) => WorkloadStatus {
                exists: true,
                members: w.request.members,
                ready_members: w.ready_members,
            },
            None => WorkloadStatus::default(),
        })
    }

    async fn apply(&self, request: &WorkloadRequest) -> Result<()> {
        if self.fail_applies.load(Ordering::SeqCst) {
            anyhow::bail!("Mock workload scheduler configured to fail");
        }

        info!(
            resource = %request.resource,
            workload = %request.workload_name,
            cluster = request.cluster.as_deref().unwrap_or("-"),
            members = request.members,
            version = %request.version,
            tls = request.tls_enabled,
            "[MOCK] Applying workload"
        );

        let id = (
            request.resource.clone(),
            request.cluster.clone(),
            request.workload_name.clone(),
        );
        let auto_ready = self.auto_ready.load(Ordering::SeqCst);
        let mut workloads = self.workloads.write().await;
        let ready_members = match workloads.get(&id) {
            _ if auto_ready => request.members,
            Some(existing) => existing.ready_members.min(request.members),
            None => 0,
        };
        workloads.insert(
            id,
            MockWorkload {
                request: request.clone(),
                ready_members,
            },
        );
        drop(workloads);

        if let Some(journal) = &self.journal {
            journal
                .record(format!(
                    "apply {} {} members={}",
                    request.resource, request.workload_name, request.members
                ))
                .await;
        }
        Ok(())
    }
}

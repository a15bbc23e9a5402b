//! dbop operator library.
//!
//! The operator drives each declared database deployment toward its spec by
//! coordinating two collaborators: the workload scheduler, which runs the
//! database processes, and the management service, whose agents apply the
//! published automation configuration.
//!
//! ## Architecture
//!
//! ```text
//! ReconcileWorker              (periodic loop, one pass per due resource)
//! └── Reconciler               (one pass: validate, index, scale, publish, apply, wait)
//!     ├── DeploymentStateStore (cluster mapping, last achieved spec, status)
//!     ├── ConfigPublisher      (versioned automation config document)
//!     ├── WorkloadScheduler    (infrastructure)
//!     └── ManagementService    (agent goal state, backup stores)
//! ```
//!
//! ## Modules
//!
//! - `controller`: The per-resource reconciliation pass
//! - `publisher`: Build and conditionally publish the automation config
//! - `state`: Persisted per-resource state
//! - `store`: Namespaced key/value records (in-memory and file-backed)
//! - `backup`: Backup store alignment with the management service

pub mod backup;
pub mod client;
pub mod config;
pub mod controller;
pub mod journal;
pub mod management;
pub mod publisher;
pub mod resource;
pub mod state;
pub mod store;
pub mod worker;
pub mod workload;

//! # dbop-automation
//!
//! The declarative automation configuration consumed by per-process agents.
//!
//! ## Design Principles
//!
//! - The document is rebuilt from the declared topology every pass, on top of
//!   the previously published document so that key material, users and
//!   fields this crate does not model are carried over verbatim
//! - Two documents are compared with `version` excluded and after
//!   normalizing incidental ordering (processes, members, users, agents)
//! - Nothing here performs I/O; publishing lives with the caller
//!
//! ## Modules
//!
//! - `topology`: the declared shape of a deployment
//! - `layout`: member groups and the concrete processes derived from them
//! - `document`: the published document schema
//! - `builder`: projection of a topology onto a previous document

mod builder;
mod document;
mod error;
mod layout;
mod topology;

pub use builder::{build_automation_config, BuildRequest};
pub use document::*;
pub use error::BuildError;
pub use layout::{
    member_groups, ClusterPlacement, DeploymentLayout, MemberGroup, ProcessLayout, ProcessRole,
    MAX_GROUP_MEMBERS, MEMBER_ID_CLUSTER_STRIDE,
};
pub use topology::{
    is_major_minor_upgrade, parse_version, AuthMode, AuthSettings, DesiredTopology,
    ProcessOptions, ResourceType, TlsMode, TlsSettings,
};

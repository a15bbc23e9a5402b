//! Automation configuration document schema.
//!
//! Every struct keeps unknown fields in a flattened `extra` map so that
//! fields written by the management service (or by hand) survive a rebuild.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use dbop_reconcile::{canonical_json, SpecHash};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key-file location used by the older container layout.
pub const LEGACY_KEYFILE_PATH: &str = "/var/lib/mongodb-mms-automation/authentication/keyfile";

/// Key-file location for the current container layout.
pub const KEYFILE_PATH: &str = "/var/lib/automation/config/keyfile";

pub const DEFAULT_DOWNLOAD_BASE: &str = "/var/lib/mongodb-mms-automation";

/// User the automation agent authenticates as.
pub const AUTOMATION_AGENT_USER: &str = "mms-automation-agent";

/// Fields not modeled by this crate.
pub type Extra = BTreeMap<String, Value>;

/// The published automation configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationConfigDocument {
    /// Incremented by exactly one on every semantic change.
    #[serde(default)]
    pub version: i64,

    #[serde(default)]
    pub processes: Vec<Process>,

    #[serde(default)]
    pub replica_sets: Vec<ReplicaSet>,

    #[serde(default)]
    pub sharding: Vec<ShardedCluster>,

    #[serde(default)]
    pub auth: Auth,

    #[serde(default)]
    pub tls: TlsOptions,

    #[serde(default)]
    pub monitoring_versions: Vec<AgentRegistration>,

    #[serde(default)]
    pub backup_versions: Vec<AgentRegistration>,

    #[serde(default)]
    pub options: Options,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessType {
    Mongod,
    Mongos,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub name: String,
    pub hostname: String,
    pub process_type: ProcessType,
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_compatibility_version: Option<String>,

    /// Sharded cluster a router belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,

    /// Server options, nested the way the server's config file nests them.
    #[serde(default, rename = "args2_6")]
    pub args: Map<String, Value>,

    #[serde(default)]
    pub disabled: bool,

    #[serde(flatten)]
    pub extra: Extra,
}

impl Process {
    /// Value at a dotted path in `args`.
    pub fn arg(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        parts.try_fold(self.args.get(first)?, |value, part| value.get(part))
    }

    pub fn tls_enabled(&self) -> bool {
        self.arg("net.tls.mode")
            .and_then(Value::as_str)
            .is_some_and(|mode| mode != "disabled")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSet {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(default)]
    pub members: Vec<ReplicaSetMember>,

    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    #[serde(flatten)]
    pub extra: Extra,
}

fn default_protocol_version() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSetMember {
    #[serde(rename = "_id")]
    pub id: u32,

    /// Name of the process backing this member.
    pub host: String,

    #[serde(default = "default_one")]
    pub priority: u32,

    #[serde(default = "default_one")]
    pub votes: u32,

    #[serde(default)]
    pub arbiter_only: bool,

    #[serde(default)]
    pub hidden: bool,

    #[serde(flatten)]
    pub extra: Extra,
}

fn default_one() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardedCluster {
    pub name: String,
    pub config_server_replica: String,

    #[serde(default)]
    pub shards: Vec<Shard>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shard {
    #[serde(rename = "_id")]
    pub id: String,
    pub rs: String,

    #[serde(flatten)]
    pub extra: Extra,
}

/// Deployment authentication, including agent credentials.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Auth {
    #[serde(default = "default_true")]
    pub disabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_pwd: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_auth_mechanism: Option<String>,

    #[serde(default)]
    pub auto_auth_mechanisms: Vec<String>,

    #[serde(default)]
    pub deployment_auth_mechanisms: Vec<String>,

    /// Shared key-file contents for intra-cluster authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<String>,

    /// Database users; carried over verbatim.
    #[serde(default, rename = "usersWanted")]
    pub users: Vec<Value>,

    #[serde(flatten)]
    pub extra: Extra,
}

fn default_true() -> bool {
    true
}

impl Default for Auth {
    fn default() -> Self {
        Self {
            disabled: true,
            auto_user: None,
            auto_pwd: None,
            auto_auth_mechanism: None,
            auto_auth_mechanisms: Vec::new(),
            deployment_auth_mechanisms: Vec::new(),
            key: None,
            keyfile: None,
            users: Vec::new(),
            extra: Extra::new(),
        }
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Auth")
            .field("disabled", &self.disabled)
            .field("auto_user", &self.auto_user)
            .field("auto_pwd", &self.auto_pwd.as_ref().map(|_| "<redacted>"))
            .field("auto_auth_mechanism", &self.auto_auth_mechanism)
            .field("auto_auth_mechanisms", &self.auto_auth_mechanisms)
            .field("deployment_auth_mechanisms", &self.deployment_auth_mechanisms)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("keyfile", &self.keyfile)
            .field("users", &self.users.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsOptions {
    #[serde(default, rename = "CAFilePath", skip_serializing_if = "Option::is_none")]
    pub ca_file_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate_mode: Option<String>,

    #[serde(flatten)]
    pub extra: Extra,
}

/// A monitoring or backup agent registered for one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub hostname: String,
    pub name: String,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    #[serde(default)]
    pub download_base: String,

    #[serde(flatten)]
    pub extra: Extra,
}

impl AutomationConfigDocument {
    /// Copy with incidental ordering removed.
    pub fn normalized(&self) -> Self {
        let mut doc = self.clone();

        doc.processes.sort_by(|a, b| a.name.cmp(&b.name));
        doc.replica_sets.sort_by(|a, b| a.id.cmp(&b.id));
        for rs in &mut doc.replica_sets {
            rs.members.sort_by_key(|m| m.id);
        }
        doc.sharding.sort_by(|a, b| a.name.cmp(&b.name));
        for cluster in &mut doc.sharding {
            cluster.shards.sort_by(|a, b| a.id.cmp(&b.id));
        }
        doc.monitoring_versions
            .sort_by(|a, b| a.hostname.cmp(&b.hostname));
        doc.backup_versions.sort_by(|a, b| a.hostname.cmp(&b.hostname));

        for mechanisms in [
            &mut doc.auth.auto_auth_mechanisms,
            &mut doc.auth.deployment_auth_mechanisms,
        ] {
            mechanisms.sort();
            mechanisms.dedup();
        }
        doc.auth.users.sort_by_cached_key(|user| {
            let field = |name: &str| {
                user.get(name)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            (field("db"), field("user"), canonical_json(user))
        });

        doc
    }

    /// Field-for-field equality with `version` excluded and ordering normalized.
    pub fn semantically_equals(&self, other: &Self) -> bool {
        let mut left = self.normalized();
        let mut right = other.normalized();
        left.version = 0;
        right.version = 0;
        left == right
    }

    /// Hash of the semantic content, for logs and status.
    pub fn content_hash(&self) -> Result<SpecHash, serde_json::Error> {
        let mut doc = self.normalized();
        doc.version = 0;
        SpecHash::of(&doc)
    }

    /// True if any process has TLS turned on.
    pub fn tls_enabled(&self) -> bool {
        self.processes.iter().any(Process::tls_enabled)
    }

    pub fn uses_legacy_keyfile(&self) -> bool {
        self.auth.keyfile.as_deref() == Some(LEGACY_KEYFILE_PATH)
    }

    pub fn process_versions(&self) -> BTreeSet<&str> {
        self.processes.iter().map(|p| p.version.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty() && self.replica_sets.is_empty()
    }
}

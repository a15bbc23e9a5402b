//! Declared topology of a deployment.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::BuildError;

/// Kind of deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    Standalone,
    ReplicaSet,
    ShardedCluster,
}

/// Declared shape of a deployment. Read-only to the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DesiredTopology {
    pub resource_type: ResourceType,

    /// Database server version, e.g. `6.0.5` or `7.0.2-ent`.
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_compatibility_version: Option<String>,

    /// Members per replica set when the deployment spans a single cluster.
    #[serde(default = "default_members")]
    pub members: u32,

    #[serde(default)]
    pub shard_count: u32,

    #[serde(default)]
    pub config_server_count: u32,

    #[serde(default)]
    pub mongos_count: u32,

    #[serde(default)]
    pub process: ProcessOptions,

    #[serde(default)]
    pub tls: TlsSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    /// When set, every host is registered with a monitoring agent of this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitoring_agent_version: Option<String>,
}

fn default_members() -> u32 {
    1
}

/// Per-process options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOptions {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,

    /// Extra server options keyed by dotted path, e.g. `net.maxIncomingConnections`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_args: BTreeMap<String, serde_json::Value>,
}

fn default_port() -> u16 {
    27017
}

fn default_db_path() -> String {
    "/data".to_string()
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
            log_path: None,
            additional_args: BTreeMap::new(),
        }
    }
}

/// Server TLS mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsMode {
    #[serde(rename = "disabled")]
    Disabled,
    #[serde(rename = "allowTLS")]
    Allow,
    #[serde(rename = "preferTLS")]
    Prefer,
    #[default]
    #[serde(rename = "requireTLS")]
    Require,
}

impl TlsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Allow => "allowTLS",
            Self::Prefer => "preferTLS",
            Self::Require => "requireTLS",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub mode: TlsMode,

    /// Path of the mounted server certificate and key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_key_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
}

impl TlsSettings {
    /// Mode applied to processes; `Disabled` whenever TLS is off.
    pub fn effective_mode(&self) -> TlsMode {
        if self.enabled {
            self.mode
        } else {
            TlsMode::Disabled
        }
    }

    pub fn has_certificate_material(&self) -> bool {
        self.enabled
            && self.effective_mode() != TlsMode::Disabled
            && self
                .certificate_key_file
                .as_deref()
                .is_some_and(|path| !path.is_empty())
    }
}

/// Authentication mechanism families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AuthMode {
    #[serde(rename = "SCRAM")]
    Scram,
    #[serde(rename = "X509")]
    X509,
    #[serde(rename = "LDAP")]
    Ldap,
}

impl AuthMode {
    /// Mechanism name as it appears in the automation document.
    pub fn mechanism(&self) -> &'static str {
        match self {
            Self::Scram => "SCRAM-SHA-256",
            Self::X509 => "MONGODB-X509",
            Self::Ldap => "PLAIN",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub modes: BTreeSet<AuthMode>,

    /// Mechanism the automation agent itself uses; defaults to SCRAM when
    /// enabled, otherwise the first declared mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_mechanism: Option<AuthMode>,
}

impl AuthSettings {
    pub fn agent_mode(&self) -> Option<AuthMode> {
        self.agent_mechanism.or_else(|| {
            if self.modes.contains(&AuthMode::Scram) {
                Some(AuthMode::Scram)
            } else {
                self.modes.iter().next().copied()
            }
        })
    }

    pub fn requires_x509(&self) -> bool {
        self.enabled
            && (self.modes.contains(&AuthMode::X509) || self.agent_mode() == Some(AuthMode::X509))
    }
}

impl DesiredTopology {
    /// Check the topology can produce a coherent document.
    pub fn validate(&self) -> Result<semver::Version, BuildError> {
        let version = parse_version(&self.version)?;

        if self.resource_type == ResourceType::ShardedCluster {
            if self.shard_count == 0 {
                return Err(BuildError::InvalidTopology(
                    "a sharded cluster needs at least one shard".to_string(),
                ));
            }
            if self.config_server_count == 0 {
                return Err(BuildError::InvalidTopology(
                    "a sharded cluster needs at least one config server".to_string(),
                ));
            }
        }

        if self.auth.enabled {
            if self.auth.modes.is_empty() {
                return Err(BuildError::InconsistentAuth(
                    "authentication is enabled but no modes are declared".to_string(),
                ));
            }
            if let Some(agent) = self.auth.agent_mechanism {
                if !self.auth.modes.contains(&agent) {
                    return Err(BuildError::InconsistentAuth(format!(
                        "agent mechanism {} is not among the enabled modes",
                        agent.mechanism()
                    )));
                }
            }
            if self.auth.requires_x509() && !self.tls.has_certificate_material() {
                return Err(BuildError::InconsistentAuth(
                    "X.509 authentication requires TLS with certificate material".to_string(),
                ));
            }
        }

        Ok(version)
    }
}

/// Parse a server version string.
pub fn parse_version(version: &str) -> Result<semver::Version, BuildError> {
    semver::Version::parse(version.trim()).map_err(|source| BuildError::InvalidVersion {
        version: version.to_string(),
        source,
    })
}

/// True if `to` is a newer major or minor release than `from`. Patch
/// changes, downgrades and unparsable input are not upgrades.
pub fn is_major_minor_upgrade(from: &str, to: &str) -> bool {
    match (parse_version(from), parse_version(to)) {
        (Ok(from), Ok(to)) => (to.major, to.minor) > (from.major, from.minor),
        _ => false,
    }
}

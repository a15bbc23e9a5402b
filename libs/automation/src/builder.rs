//! Projection of a declared topology onto the previously published document.
//!
//! The previous document is the starting point: key material, users, agent
//! registrations and every unmodeled field are carried over, and only what
//! the topology owns (processes, replica sets, sharding, auth mode, TLS) is
//! rewritten. The returned document keeps the previous `version`; deciding
//! whether to bump it is the publisher's job.

use std::collections::BTreeSet;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::document::{
    AgentRegistration, Auth, AutomationConfigDocument, Extra, Process, ProcessType, ReplicaSet,
    ReplicaSetMember, Shard, ShardedCluster, TlsOptions, AUTOMATION_AGENT_USER,
    DEFAULT_DOWNLOAD_BASE, KEYFILE_PATH,
};
use crate::layout::{DeploymentLayout, ProcessLayout, ProcessRole};
use crate::{AuthSettings, BuildError, DesiredTopology, ResourceType, TlsMode};

const KEY_BYTES: usize = 48;
const AGENT_PASSWORD_BYTES: usize = 24;

/// Inputs for one build.
#[derive(Debug, Clone, Copy)]
pub struct BuildRequest<'a> {
    pub topology: &'a DesiredTopology,
    /// Processes to describe, already sized for this pass.
    pub layout: &'a DeploymentLayout,
}

/// Build the desired document on top of `previous`.
pub fn build_automation_config(
    previous: &AutomationConfigDocument,
    request: &BuildRequest<'_>,
) -> Result<AutomationConfigDocument, BuildError> {
    let topology = request.topology;
    let layout = request.layout;
    topology.validate()?;

    let mut doc = previous.clone();

    doc.processes = layout
        .processes
        .iter()
        .map(|p| build_process(previous, topology, layout, p))
        .collect();
    doc.replica_sets = build_replica_sets(previous, layout);
    doc.sharding = build_sharding(previous, topology, layout);
    doc.auth = build_auth(&previous.auth, &topology.auth);
    doc.tls = build_tls(&previous.tls, topology);

    let hostnames = layout.hostnames();
    doc.monitoring_versions = carry_registrations(
        &previous.monitoring_versions,
        &hostnames,
        topology.monitoring_agent_version.as_deref(),
    );
    doc.backup_versions = carry_registrations(&previous.backup_versions, &hostnames, None);

    if doc.options.download_base.is_empty() {
        doc.options.download_base = DEFAULT_DOWNLOAD_BASE.to_string();
    }

    debug!(
        deployment = %layout.deployment,
        processes = doc.processes.len(),
        replica_sets = doc.replica_sets.len(),
        "Built automation config"
    );

    Ok(doc)
}

fn build_process(
    previous: &AutomationConfigDocument,
    topology: &DesiredTopology,
    layout: &DeploymentLayout,
    process: &ProcessLayout,
) -> Process {
    let existing = previous.processes.iter().find(|p| p.name == process.name);
    let is_router = process.role.is_router();

    Process {
        name: process.name.clone(),
        hostname: process.hostname.clone(),
        process_type: if is_router {
            ProcessType::Mongos
        } else {
            ProcessType::Mongod
        },
        version: topology.version.clone(),
        feature_compatibility_version: topology.feature_compatibility_version.clone(),
        cluster: is_router.then(|| layout.deployment.clone()),
        args: process_args(topology, process),
        disabled: existing.is_some_and(|p| p.disabled),
        extra: existing.map(|p| p.extra.clone()).unwrap_or_default(),
    }
}

fn process_args(topology: &DesiredTopology, process: &ProcessLayout) -> Map<String, Value> {
    let options = &topology.process;
    let mut args = Map::new();

    set_path(&mut args, "net.port", json!(options.port));

    if !process.role.is_router() {
        set_path(&mut args, "storage.dbPath", json!(options.db_path));
    }
    if let Some(replica_set) = &process.replica_set {
        set_path(&mut args, "replication.replSetName", json!(replica_set));
    }
    match process.role {
        ProcessRole::ShardMember => set_path(&mut args, "sharding.clusterRole", json!("shardsvr")),
        ProcessRole::ConfigServer => {
            set_path(&mut args, "sharding.clusterRole", json!("configsvr"))
        }
        _ => {}
    }
    if let Some(log_path) = &options.log_path {
        set_path(&mut args, "systemLog.destination", json!("file"));
        set_path(&mut args, "systemLog.path", json!(log_path));
    }

    let mode = topology.tls.effective_mode();
    set_path(&mut args, "net.tls.mode", json!(mode.as_str()));
    if mode != TlsMode::Disabled {
        if let Some(pem) = &topology.tls.certificate_key_file {
            set_path(&mut args, "net.tls.certificateKeyFile", json!(pem));
        }
        if let Some(ca) = &topology.tls.ca_file {
            set_path(&mut args, "net.tls.CAFile", json!(ca));
        }
    }

    for (path, value) in &options.additional_args {
        set_path(&mut args, path, value.clone());
    }

    args
}

/// Set `value` at a dotted path, creating (or replacing non-object)
/// intermediate levels.
fn set_path(args: &mut Map<String, Value>, path: &str, value: Value) {
    let mut parts: Vec<&str> = path.split('.').filter(|p| !p.is_empty()).collect();
    let Some(last) = parts.pop() else {
        return;
    };

    let mut current = args;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(map) => map,
            _ => return,
        };
    }
    current.insert(last.to_string(), value);
}

fn build_replica_sets(
    previous: &AutomationConfigDocument,
    layout: &DeploymentLayout,
) -> Vec<ReplicaSet> {
    layout
        .replica_sets()
        .into_iter()
        .map(|id| {
            let existing = previous.replica_sets.iter().find(|rs| rs.id == id);
            let members = layout
                .members_of(id)
                .map(|process| {
                    let existing_member = existing
                        .and_then(|rs| rs.members.iter().find(|m| m.id == process.member_id));
                    ReplicaSetMember {
                        id: process.member_id,
                        host: process.name.clone(),
                        priority: existing_member.map_or(1, |m| m.priority),
                        votes: existing_member.map_or(1, |m| m.votes),
                        arbiter_only: false,
                        hidden: existing_member.is_some_and(|m| m.hidden),
                        extra: existing_member.map(|m| m.extra.clone()).unwrap_or_default(),
                    }
                })
                .collect();

            ReplicaSet {
                id: id.to_string(),
                members,
                protocol_version: existing
                    .map(|rs| rs.protocol_version.clone())
                    .unwrap_or_else(|| "1".to_string()),
                extra: existing.map(|rs| rs.extra.clone()).unwrap_or_default(),
            }
        })
        .collect()
}

fn build_sharding(
    previous: &AutomationConfigDocument,
    topology: &DesiredTopology,
    layout: &DeploymentLayout,
) -> Vec<ShardedCluster> {
    if topology.resource_type != ResourceType::ShardedCluster {
        return Vec::new();
    }

    let name = &layout.deployment;
    let existing = previous.sharding.iter().find(|c| &c.name == name);
    let shards = (0..topology.shard_count)
        .map(|index| format!("{name}-{index}"))
        .map(|rs| Shard {
            id: rs.clone(),
            extra: existing
                .and_then(|c| c.shards.iter().find(|s| s.id == rs))
                .map(|s| s.extra.clone())
                .unwrap_or_default(),
            rs,
        })
        .collect();

    vec![ShardedCluster {
        name: name.clone(),
        config_server_replica: format!("{name}-config"),
        shards,
        extra: existing.map(|c| c.extra.clone()).unwrap_or_default(),
    }]
}

fn build_auth(previous: &Auth, settings: &AuthSettings) -> Auth {
    let mut auth = previous.clone();

    if !settings.enabled {
        auth.disabled = true;
        auth.auto_auth_mechanism = None;
        auth.auto_auth_mechanisms.clear();
        auth.deployment_auth_mechanisms.clear();
        return auth;
    }

    auth.disabled = false;
    if auth.auto_user.is_none() {
        auth.auto_user = Some(AUTOMATION_AGENT_USER.to_string());
    }
    if auth.auto_pwd.is_none() {
        auth.auto_pwd = Some(generate_secret(AGENT_PASSWORD_BYTES));
    }
    if auth.key.is_none() {
        auth.key = Some(generate_secret(KEY_BYTES));
    }
    auth.keyfile = Some(KEYFILE_PATH.to_string());

    let agent = settings.agent_mode().map(|mode| mode.mechanism().to_string());
    auth.auto_auth_mechanisms = agent.iter().cloned().collect();
    auth.auto_auth_mechanism = agent;
    auth.deployment_auth_mechanisms = settings
        .modes
        .iter()
        .map(|mode| mode.mechanism().to_string())
        .collect();

    auth
}

fn build_tls(previous: &TlsOptions, topology: &DesiredTopology) -> TlsOptions {
    let enabled = topology.tls.effective_mode() != TlsMode::Disabled;
    TlsOptions {
        ca_file_path: if enabled {
            topology.tls.ca_file.clone()
        } else {
            None
        },
        client_certificate_mode: enabled.then(|| {
            if topology.auth.requires_x509() {
                "REQUIRE".to_string()
            } else {
                "OPTIONAL".to_string()
            }
        }),
        extra: previous.extra.clone(),
    }
}

/// Keep registrations for hosts still in the layout; when `ensure` is set,
/// register the remaining hosts with that agent version.
fn carry_registrations(
    previous: &[AgentRegistration],
    hostnames: &BTreeSet<&str>,
    ensure: Option<&str>,
) -> Vec<AgentRegistration> {
    let mut registrations: Vec<AgentRegistration> = previous
        .iter()
        .filter(|r| hostnames.contains(r.hostname.as_str()))
        .cloned()
        .collect();

    if let Some(version) = ensure {
        for hostname in hostnames {
            if !registrations.iter().any(|r| r.hostname == *hostname) {
                registrations.push(AgentRegistration {
                    hostname: hostname.to_string(),
                    name: version.to_string(),
                    extra: Extra::new(),
                });
            }
        }
    }

    registrations
}

fn generate_secret(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

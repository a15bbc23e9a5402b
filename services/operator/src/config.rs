//! Operator configuration.
//!
//! Sources, lowest precedence first: built-in defaults, an optional config
//! file, then `DBOP_*` environment variables (e.g. `DBOP_LOG_LEVEL`).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Root of the file-backed record store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory of JSON deployment manifests.
    #[serde(default = "default_manifests_dir")]
    pub manifests_dir: PathBuf,

    /// Requeue delay after Ok, Failed or Invalid.
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,

    /// Pending delay between single-member scaling steps.
    #[serde(default = "default_retry_secs")]
    pub scaling_retry_secs: u64,

    /// Pending delay while waiting on workloads, agents or the backup daemon.
    #[serde(default = "default_retry_secs")]
    pub readiness_retry_secs: u64,

    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/dbop")
}

fn default_manifests_dir() -> PathBuf {
    PathBuf::from("/etc/dbop/deployments")
}

fn default_resync_interval_secs() -> u64 {
    30
}

fn default_retry_secs() -> u64 {
    10
}

fn default_tick_interval_secs() -> u64 {
    1
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            manifests_dir: default_manifests_dir(),
            resync_interval_secs: default_resync_interval_secs(),
            scaling_retry_secs: default_retry_secs(),
            readiness_retry_secs: default_retry_secs(),
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration, layering `path` (if any) and the environment over
    /// the defaults.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(config::Environment::with_prefix("DBOP").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn scaling_retry(&self) -> Duration {
        Duration::from_secs(self.scaling_retry_secs)
    }

    pub fn readiness_retry(&self) -> Duration {
        Duration::from_secs(self.readiness_retry_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

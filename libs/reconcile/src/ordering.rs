//! Ordering of the configuration publish and the infrastructure update.
//!
//! Each pass runs two steps: publishing the automation configuration and
//! applying infrastructure (workload) changes. Configuration goes first by
//! default so agents see new membership and auth settings before processes
//! restart. Infrastructure goes first when TLS is being turned on for running
//! members, or during a major/minor version upgrade. A previously published
//! configuration that still points at the legacy key-file path forces
//! configuration first over both of those.

use std::fmt;
use std::future::Future;

use tracing::debug;

use crate::ReconcileOutcome;

/// Which step runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOrder {
    ConfigurationFirst,
    InfrastructureFirst,
}

/// Why an order was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderReason {
    Default,
    TlsEnabling,
    VersionUpgrade,
    LegacyKeyfileMigration,
}

impl fmt::Display for OrderReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Default => "default",
            Self::TlsEnabling => "tls being enabled on running members",
            Self::VersionUpgrade => "version upgrade in progress",
            Self::LegacyKeyfileMigration => "published config uses legacy keyfile path",
        };
        f.write_str(s)
    }
}

/// Facts about the deployment the order decision depends on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrderingInputs {
    /// Members currently running across all groups.
    pub current_members: u32,
    /// Desired spec enables TLS and the published configuration does not have it.
    pub tls_enabling: bool,
    /// Desired version differs from the last achieved one in major or minor.
    pub version_upgrade: bool,
    /// Previously published configuration references the legacy key-file path.
    pub legacy_keyfile: bool,
}

impl ApplyOrder {
    pub fn decide(inputs: &OrderingInputs) -> (Self, OrderReason) {
        if inputs.legacy_keyfile {
            return (Self::ConfigurationFirst, OrderReason::LegacyKeyfileMigration);
        }
        if inputs.tls_enabling && inputs.current_members > 0 {
            return (Self::InfrastructureFirst, OrderReason::TlsEnabling);
        }
        if inputs.version_upgrade {
            return (Self::InfrastructureFirst, OrderReason::VersionUpgrade);
        }
        (Self::ConfigurationFirst, OrderReason::Default)
    }
}

/// Run both steps in `order`, stopping at the first non-`Ok` outcome.
///
/// The second step never starts unless the first returned `Ok`; the outcome
/// of the pass is the first non-`Ok` outcome or the second step's outcome.
pub async fn run_in_order<C, CF, I, IF>(
    order: ApplyOrder,
    publish_configuration: C,
    apply_infrastructure: I,
) -> ReconcileOutcome
where
    C: FnOnce() -> CF,
    CF: Future<Output = ReconcileOutcome>,
    I: FnOnce() -> IF,
    IF: Future<Output = ReconcileOutcome>,
{
    match order {
        ApplyOrder::ConfigurationFirst => {
            let first = publish_configuration().await;
            if !first.is_ok() {
                debug!(outcome = %first, "Configuration step did not complete, skipping infrastructure");
                return first;
            }
            apply_infrastructure().await
        }
        ApplyOrder::InfrastructureFirst => {
            let first = apply_infrastructure().await;
            if !first.is_ok() {
                debug!(outcome = %first, "Infrastructure step did not complete, skipping configuration");
                return first;
            }
            publish_configuration().await
        }
    }
}

//! Outcome of a reconciliation pass or of one of its steps.

use std::fmt;
use std::time::Duration;

/// Delay between single-member scaling steps.
pub const DEFAULT_SCALING_RETRY: Duration = Duration::from_secs(10);

/// What a pass (or a step within it) reports back to the control loop.
///
/// - `Ok`: nothing further to do this pass.
/// - `Pending`: convergence is legitimately incomplete; re-enter after the delay.
/// - `Failed`: a transient error; retried on the normal resync cadence.
/// - `Invalid`: the declared spec cannot be realized; terminal until it changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Ok,
    Pending {
        reason: String,
        retry_after: Option<Duration>,
    },
    Failed {
        reason: String,
        retry_after: Option<Duration>,
    },
    Invalid {
        reason: String,
    },
}

impl ReconcileOutcome {
    pub fn pending(reason: impl Into<String>) -> Self {
        Self::Pending {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }

    /// Attach a fixed retry delay. `Ok` and `Invalid` carry no delay and are
    /// returned unchanged.
    pub fn with_retry_after(self, delay: Duration) -> Self {
        match self {
            Self::Pending { reason, .. } => Self::Pending {
                reason,
                retry_after: Some(delay),
            },
            Self::Failed { reason, .. } => Self::Failed {
                reason,
                retry_after: Some(delay),
            },
            other => other,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid { .. })
    }

    /// Delay requested before the next pass, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Pending { retry_after, .. } | Self::Failed { retry_after, .. } => *retry_after,
            Self::Ok | Self::Invalid { .. } => None,
        }
    }

    /// Human-readable reason, absent for `Ok`.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Ok => None,
            Self::Pending { reason, .. }
            | Self::Failed { reason, .. }
            | Self::Invalid { reason } => Some(reason),
        }
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Pending { reason, .. } => write!(f, "pending: {reason}"),
            Self::Failed { reason, .. } => write!(f, "failed: {reason}"),
            Self::Invalid { reason } => write!(f, "invalid: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_only_attaches_to_retryable_outcomes() {
        let delay = Duration::from_secs(10);

        assert_eq!(
            ReconcileOutcome::pending("scaling").with_retry_after(delay).retry_after(),
            Some(delay)
        );
        assert_eq!(
            ReconcileOutcome::failed("write failed").with_retry_after(delay).retry_after(),
            Some(delay)
        );
        assert_eq!(ReconcileOutcome::Ok.with_retry_after(delay), ReconcileOutcome::Ok);
        assert_eq!(
            ReconcileOutcome::invalid("bad auth").with_retry_after(delay).retry_after(),
            None
        );
    }

    #[test]
    fn test_reason_and_display() {
        let outcome = ReconcileOutcome::invalid("x509 requires TLS");
        assert_eq!(outcome.reason(), Some("x509 requires TLS"));
        assert_eq!(outcome.to_string(), "invalid: x509 requires TLS");
        assert_eq!(ReconcileOutcome::Ok.reason(), None);
    }
}

//! Error types for building automation configuration.

use thiserror::Error;

/// Errors that prevent a coherent document from being built.
///
/// Every variant describes a problem with the declared spec; retrying
/// without a spec change produces the same error.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The declared version string cannot be parsed.
    #[error("invalid version '{version}': {source}")]
    InvalidVersion {
        version: String,
        #[source]
        source: semver::Error,
    },

    /// Authentication settings contradict each other or the TLS settings.
    #[error("inconsistent authentication settings: {0}")]
    InconsistentAuth(String),

    /// The topology cannot be laid out.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),
}

impl BuildError {
    /// Returns true if this error is about authentication.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, BuildError::InconsistentAuth(_))
    }
}

//! Convergence primitives for the deployment reconciler.
//!
//! This library holds the decision logic that every reconciliation pass
//! leans on, kept free of I/O so it can be tested exhaustively:
//!
//! - **Outcomes**: what a pass reports back to the control loop.
//! - **Scaling**: how far a member group may move in one pass.
//! - **Cluster indices**: stable small integers per compute cluster.
//! - **Set sync**: three-way alignment of externally registered resources.
//! - **Ordering**: whether configuration or infrastructure changes go first.
//!
//! # Invariants
//!
//! - All decisions are deterministic given the same inputs
//! - A member group never moves by more than one member per pass
//! - A cluster index, once assigned, is never given to another name

mod cluster_index;
mod ordering;
mod outcome;
mod scaling;
mod sync;

pub use cluster_index::{resolve_cluster_indices, ClusterMapping, Resolution};
pub use ordering::{run_in_order, ApplyOrder, OrderReason, OrderingInputs};
pub use outcome::{ReconcileOutcome, DEFAULT_SCALING_RETRY};
pub use scaling::{next_step_members, plan_groups, scaling_outcome, ScalingPlan};
pub use sync::{sync, Identifiable, SyncPlan};

use sha2::{Digest, Sha256};

/// A spec hash for deterministic comparison.
///
/// Used to detect when a declared spec has changed between passes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Compute a spec hash from any serializable value.
    pub fn of<T: serde::Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::from_json(&serde_json::to_value(value)?))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_hash_deterministic() {
        let json1 = serde_json::json!({"members": 3, "version": "6.0.5"});
        let json2 = serde_json::json!({"version": "6.0.5", "members": 3});

        let hash1 = SpecHash::from_json(&json1);
        let hash2 = SpecHash::from_json(&json2);

        assert_eq!(hash1, hash2);
        assert!(hash1.as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_spec_hash_detects_change() {
        let before = SpecHash::from_json(&serde_json::json!({"members": 3}));
        let after = SpecHash::from_json(&serde_json::json!({"members": 5}));

        assert_ne!(before, after);
    }

    #[test]
    fn test_canonical_json_escapes() {
        let value = serde_json::json!({"b": "line\nbreak", "a": [1, true, null]});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":[1,true,null],"b":"line\nbreak"}"#
        );
    }
}

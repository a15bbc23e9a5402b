//! Shared operation log for the in-memory collaborators.
//!
//! Mocks append one line per externally visible operation so tests can
//! assert on cross-collaborator ordering (e.g. config written before the
//! workload was applied).

use std::sync::Arc;

use tokio::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, entry: impl Into<String>) {
        self.0.lock().await.push(entry.into());
    }

    pub async fn entries(&self) -> Vec<String> {
        self.0.lock().await.clone()
    }

    /// Position of the first entry starting with `prefix`.
    pub async fn position(&self, prefix: &str) -> Option<usize> {
        self.0
            .lock()
            .await
            .iter()
            .position(|entry| entry.starts_with(prefix))
    }

    pub async fn clear(&self) {
        self.0.lock().await.clear();
    }
}

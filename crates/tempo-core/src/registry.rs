//! In-memory registry of active runs (§5).
use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::engine::supervisor::RunHandle;

/// Reader-writer-mutex-protected map of opaque run id to its cancellation
/// handle, live only for the run's duration.
pub struct ActiveRunRegistry {
    runs: RwLock<HashMap<Uuid, RunHandle>>,
}

impl ActiveRunRegistry {
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, id: Uuid, handle: RunHandle) {
        self.runs.write().await.insert(id, handle);
    }

    pub async fn remove(&self, id: Uuid) {
        self.runs.write().await.remove(&id);
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.runs.read().await.contains_key(&id)
    }

    /// Returns a cheap clone of the live handles for `id`, if live.
    pub async fn get(&self, id: Uuid) -> Option<RunHandleRef> {
        self.runs.read().await.get(&id).map(|h| RunHandleRef {
            cancel: h.cancel.clone(),
            aggregator: std::sync::Arc::clone(&h.aggregator),
            circuit_flag: std::sync::Arc::clone(&h.circuit_flag),
        })
    }

    /// Cancels every currently registered run, used by graceful shutdown
    /// (§5) to unblock every `drive_run` task's deadline/cancellation race
    /// at once rather than waiting out each run's own deadline.
    pub async fn cancel_all(&self) {
        let runs = self.runs.read().await;
        for handle in runs.values() {
            handle.cancel.cancel();
        }
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Count of active runs belonging to `ids`, used for per-caller cap
    /// enforcement (§4.8) when paired with a caller → run-id index kept by
    /// the admission controller.
    pub async fn count_matching(&self, ids: &[Uuid]) -> usize {
        let runs = self.runs.read().await;
        ids.iter().filter(|id| runs.contains_key(id)).count()
    }
}

impl Default for ActiveRunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A cheap, cloneable handle to a registered run's live state.
pub struct RunHandleRef {
    pub cancel: tokio_util::sync::CancellationToken,
    pub aggregator: std::sync::Arc<crate::engine::aggregator::Aggregator>,
    pub circuit_flag: std::sync::Arc<crate::engine::circuit::CircuitFlag>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> RunHandle {
        RunHandle {
            cancel: tokio_util::sync::CancellationToken::new(),
            aggregator: crate::engine::aggregator::Aggregator::new(),
            circuit_flag: crate::engine::circuit::CircuitFlag::new(),
        }
    }

    #[tokio::test]
    async fn insert_and_contains() {
        let registry = ActiveRunRegistry::new();
        let id = Uuid::new_v4();
        assert!(!registry.contains(id).await);
        registry.insert(id, handle()).await;
        assert!(registry.contains(id).await);
    }

    #[tokio::test]
    async fn remove_clears_entry() {
        let registry = ActiveRunRegistry::new();
        let id = Uuid::new_v4();
        registry.insert(id, handle()).await;
        registry.remove(id).await;
        assert!(!registry.contains(id).await);
    }

    #[tokio::test]
    async fn len_reflects_active_count() {
        let registry = ActiveRunRegistry::new();
        assert_eq!(registry.len().await, 0);
        registry.insert(Uuid::new_v4(), handle()).await;
        registry.insert(Uuid::new_v4(), handle()).await;
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let registry = ActiveRunRegistry::new();
        assert!(registry.get(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn cancel_all_cancels_every_registered_handle() {
        let registry = ActiveRunRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        registry.insert(a, handle()).await;
        registry.insert(b, handle()).await;

        registry.cancel_all().await;

        assert!(registry.get(a).await.unwrap().cancel.is_cancelled());
        assert!(registry.get(b).await.unwrap().cancel.is_cancelled());
    }
}

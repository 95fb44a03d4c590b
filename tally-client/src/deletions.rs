use std::collections::BTreeSet;
use tokio::sync::Mutex;

/// Local deletions that no successful reconciliation has covered yet.
/// While any are outstanding the scheduler runs at its urgent cadence.
pub struct DeletionTracker {
    pending: Mutex<BTreeSet<i64>>,
}

impl DeletionTracker {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    /// Seed from deletions persisted in the sync queue by an earlier session.
    pub fn with_pending(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            pending: Mutex::new(ids.into_iter().collect()),
        }
    }

    /// Returns true when this mark turned `has_pending_deletions` on.
    pub async fn mark_deleted(&self, id: i64) -> bool {
        let mut pending = self.pending.lock().await;
        let was_empty = pending.is_empty();
        pending.insert(id);
        was_empty
    }

    /// Returns the number of markers dropped.
    pub async fn clear_all(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let cleared = pending.len();
        pending.clear();
        cleared
    }

    pub async fn has_pending_deletions(&self) -> bool {
        !self.pending.lock().await.is_empty()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn pending_ids(&self) -> Vec<i64> {
        self.pending.lock().await.iter().copied().collect()
    }
}

impl Default for DeletionTracker {
    fn default() -> Self {
        Self::new()
    }
}

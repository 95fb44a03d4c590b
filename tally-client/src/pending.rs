//! Staging area for records that have been created but never saved.
//!
//! Staged records live only in memory under a temporary id. Saving promotes
//! them into the record store; the temp id is remembered afterwards so that a
//! second save through the same id updates the stored row instead of
//! inserting a duplicate.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tally_core::{
    errors::{TallyError, TallyResult},
    models::{Record, RecordId, RecordPatch},
};
use tokio::sync::Mutex;

/// What `promote` found for a temporary id.
#[derive(Debug, Clone, PartialEq)]
pub enum Promotion {
    /// The staged record, now removed from the buffer and marked in flight.
    Staged(Record),
    /// Already persisted under this permanent id.
    AlreadySaved(i64),
    /// Another save of the same id has not finished yet.
    InProgress,
    /// Never staged, or discarded.
    Unknown,
}

#[derive(Default)]
struct PendingState {
    staged: BTreeMap<u64, Record>,
    promoting: HashSet<u64>,
    promoted: HashMap<u64, i64>,
}

pub struct PendingBuffer {
    next_id: AtomicU64,
    state: Mutex<PendingState>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(PendingState::default()),
        }
    }

    /// Allocate a fresh temporary id. Ids start at 1 and are never reused
    /// within one buffer.
    pub fn next_temp_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn stage(&self, record: Record) -> TallyResult<()> {
        let RecordId::Temp(temp_id) = record.id else {
            return Err(TallyError::InvalidId(format!(
                "{} is not a temporary id",
                record.id
            )));
        };

        let mut state = self.state.lock().await;
        if state.staged.contains_key(&temp_id)
            || state.promoting.contains(&temp_id)
            || state.promoted.contains_key(&temp_id)
        {
            return Err(TallyError::DuplicateTempId(temp_id));
        }
        state.staged.insert(temp_id, record);
        Ok(())
    }

    /// Merge `patch` into a staged record. Returns false when nothing is
    /// staged under `temp_id`.
    pub async fn amend(&self, temp_id: u64, patch: &RecordPatch) -> bool {
        let mut state = self.state.lock().await;
        match state.staged.get_mut(&temp_id) {
            Some(record) => {
                record.apply(patch);
                true
            }
            None => false,
        }
    }

    /// Take a staged record out of the buffer for insertion. The caller must
    /// follow up with `finish_promotion` or `restage`.
    pub async fn promote(&self, temp_id: u64) -> Promotion {
        let mut state = self.state.lock().await;
        if let Some(record) = state.staged.remove(&temp_id) {
            state.promoting.insert(temp_id);
            return Promotion::Staged(record);
        }
        if let Some(permanent) = state.promoted.get(&temp_id) {
            return Promotion::AlreadySaved(*permanent);
        }
        if state.promoting.contains(&temp_id) {
            return Promotion::InProgress;
        }
        Promotion::Unknown
    }

    pub async fn finish_promotion(&self, temp_id: u64, permanent_id: i64) {
        let mut state = self.state.lock().await;
        state.promoting.remove(&temp_id);
        state.promoted.insert(temp_id, permanent_id);
    }

    /// Put a record back after its insert failed.
    pub async fn restage(&self, record: Record) {
        let mut state = self.state.lock().await;
        if let RecordId::Temp(temp_id) = record.id {
            state.promoting.remove(&temp_id);
            state.staged.insert(temp_id, record);
        }
    }

    pub async fn discard(&self, temp_id: u64) -> bool {
        let mut state = self.state.lock().await;
        state.staged.remove(&temp_id).is_some()
    }

    /// Permanent id a temporary id was saved under, if any.
    pub async fn resolve(&self, temp_id: u64) -> Option<i64> {
        self.state.lock().await.promoted.get(&temp_id).copied()
    }

    /// Follow a saved record that the store moved to a new permanent id.
    pub async fn repoint(&self, old_id: i64, new_id: i64) {
        let mut state = self.state.lock().await;
        for permanent in state.promoted.values_mut() {
            if *permanent == old_id {
                *permanent = new_id;
            }
        }
    }

    pub async fn get(&self, temp_id: u64) -> Option<Record> {
        self.state.lock().await.staged.get(&temp_id).cloned()
    }

    pub async fn contains(&self, temp_id: u64) -> bool {
        self.state.lock().await.staged.contains_key(&temp_id)
    }

    /// Staged records in creation order.
    pub async fn values(&self) -> Vec<Record> {
        self.state.lock().await.staged.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.staged.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.staged.is_empty()
    }
}

impl Default for PendingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

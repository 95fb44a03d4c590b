use crate::database::RecordStore;
use crate::deletions::DeletionTracker;
use crate::edit_guard::EditModeGuard;
use crate::events::{EngineEvent, EventDispatcher};
use crate::pending::{PendingBuffer, Promotion};
use crate::remote::{RemoteSync, SqliteReplica, SyncReport};
use crate::scheduler::{SchedulerState, SyncScheduler};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tally_core::{
    config::{EngineConfig, ReplicaConfig},
    errors::{TallyError, TallyResult},
    models::{Record, RecordId, RecordPatch},
};
use tokio::sync::RwLock;

type TickFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Why a reconciliation cycle did not contact the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    EditMode,
    InFlight,
    NothingPending,
}

/// Result of one reconciliation attempt. Sync failures never escape the
/// engine as errors; they are reported here and through `SyncFailed`.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed(SyncReport),
    Skipped(SkipReason),
    Failed(String),
}

impl CycleOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, CycleOutcome::Completed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleKind {
    /// Timer tick, deferred follow-up or deletion retry.
    Scheduled,
    /// Manual pull: sync, then reload the visible list.
    Pull,
    /// Manual push: sync without touching the visible list.
    Push,
}

/// Held while a cycle is talking to the remote.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct EngineInner {
    store: RecordStore,
    remote: Arc<dyn RemoteSync>,
    config: EngineConfig,
    pending: PendingBuffer,
    guard: EditModeGuard,
    deletions: DeletionTracker,
    scheduler: SyncScheduler,
    snapshot: RwLock<Vec<Record>>,
    in_flight: AtomicBool,
    disposed: AtomicBool,
    events: EventDispatcher,
}

/// Local-first coordinator for the record list.
///
/// New records are staged in memory under a temporary id until their first
/// save. Edits to persisted records only touch the visible snapshot until
/// `save_record`. A background scheduler reconciles the store with the
/// remote while sync is enabled, faster while local deletions are waiting
/// to be confirmed.
///
/// Dropping the engine cancels the timer. Operations that schedule follow-up
/// work must be called from within a tokio runtime.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub async fn new(
        store: RecordStore,
        remote: Arc<dyn RemoteSync>,
        config: EngineConfig,
    ) -> TallyResult<Self> {
        config.validate()?;

        let records = store.load_all().await?;
        let queued_deletions = store.queued_deletions().await?;
        if !queued_deletions.is_empty() {
            tracing::info!(
                "ENGINE: {} deletions from a previous session still pending",
                queued_deletions.len()
            );
        }

        tracing::info!("ENGINE: Loaded {} records", records.len());

        Ok(Self {
            inner: Arc::new(EngineInner {
                scheduler: SyncScheduler::new(&config),
                store,
                remote,
                config,
                pending: PendingBuffer::new(),
                guard: EditModeGuard::new(),
                deletions: DeletionTracker::with_pending(queued_deletions),
                snapshot: RwLock::new(records),
                in_flight: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                events: EventDispatcher::new(),
            }),
        })
    }

    /// Open the local database and connect the replica named by `replica`.
    pub async fn open(
        database_url: &str,
        replica: &ReplicaConfig,
        config: EngineConfig,
    ) -> TallyResult<Self> {
        let store = RecordStore::open(database_url).await?;
        let remote = SqliteReplica::connect(replica)
            .await
            .map_err(|e| TallyError::Config(format!("replica {}: {}", replica.url, e)))?;

        Self::new(store, Arc::new(remote), config).await
    }

    pub fn store(&self) -> &RecordStore {
        &self.inner.store
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.inner.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Stage a blank record under a fresh temporary id.
    pub async fn create_record(&self) -> TallyResult<Record> {
        let temp_id = self.inner.pending.next_temp_id();
        let record = Record::pending(temp_id);
        self.inner.pending.stage(record.clone()).await?;

        tracing::debug!("ENGINE: Staged {}", record.id);
        self.inner.emit_records_changed().await;
        Ok(record)
    }

    /// Apply keystroke-level edits. Staged records are amended in the
    /// buffer; persisted records only change in the visible snapshot.
    /// Returns false when no record matched.
    pub async fn update_record(&self, id: RecordId, patch: &RecordPatch) -> bool {
        let permanent = match id {
            RecordId::Temp(temp_id) => {
                if self.inner.pending.amend(temp_id, patch).await {
                    return true;
                }
                match self.inner.pending.resolve(temp_id).await {
                    Some(permanent) => permanent,
                    None => return false,
                }
            }
            RecordId::Permanent(permanent) => permanent,
        };

        let mut snapshot = self.inner.snapshot.write().await;
        match snapshot
            .iter_mut()
            .find(|r| r.id == RecordId::Permanent(permanent))
        {
            Some(record) => {
                record.apply(patch);
                true
            }
            None => false,
        }
    }

    /// Persist a record and return its permanent id. A staged record is
    /// inserted with `patch` laid over its staged fields; a persisted one is
    /// updated with the fields present in `patch`.
    pub async fn save_record(&self, id: RecordId, patch: &RecordPatch) -> TallyResult<i64> {
        let inner = &self.inner;
        let temp_id = match id {
            RecordId::Permanent(permanent) => return inner.save_persisted(permanent, patch).await,
            RecordId::Temp(temp_id) => temp_id,
        };

        let (staged, was_staged) = match inner.pending.promote(temp_id).await {
            Promotion::Staged(record) => (record, true),
            Promotion::AlreadySaved(permanent) => {
                return inner.save_persisted(permanent, patch).await;
            }
            Promotion::InProgress => {
                return Err(TallyError::InvalidState(format!(
                    "{} is already being saved",
                    id
                )));
            }
            Promotion::Unknown => {
                tracing::warn!("ENGINE: Saving {} which was never staged", id);
                (Record::pending(temp_id), false)
            }
        };

        let fields = staged.fields.clone().merged(patch);
        let permanent = match inner.store.insert(&fields).await {
            Ok(permanent) => permanent,
            Err(e) => {
                tracing::error!("ENGINE: Failed to insert {}: {}", id, e);
                if was_staged {
                    inner.pending.restage(staged).await;
                }
                return Err(e.into());
            }
        };
        inner.pending.finish_promotion(temp_id, permanent).await;

        if let Some(record) = inner.store.get(permanent).await? {
            inner.snapshot.write().await.insert(0, record);
        }

        tracing::info!("ENGINE: Saved {} as p-{}", id, permanent);
        inner.events.emit(EngineEvent::RecordSaved {
            id: RecordId::Permanent(permanent),
        });
        inner.emit_records_changed().await;
        Ok(permanent)
    }

    /// Remove a record. Staged records are simply discarded. Deleting a
    /// persisted record marks it for the next reconciliation; deleting it
    /// again is a no-op.
    pub async fn delete_record(&self, id: RecordId) -> TallyResult<()> {
        let inner = &self.inner;
        let permanent = match id {
            RecordId::Temp(temp_id) => {
                if inner.pending.discard(temp_id).await {
                    tracing::debug!("ENGINE: Discarded {}", id);
                    inner.events.emit(EngineEvent::RecordDeleted { id });
                    inner.emit_records_changed().await;
                    return Ok(());
                }
                match inner.pending.resolve(temp_id).await {
                    Some(permanent) => permanent,
                    None => return Ok(()),
                }
            }
            RecordId::Permanent(permanent) => permanent,
        };

        let removed = inner.store.delete(permanent).await.map_err(|e| {
            tracing::error!("ENGINE: Failed to delete p-{}: {}", permanent, e);
            e
        })?;

        inner
            .snapshot
            .write()
            .await
            .retain(|r| r.id != RecordId::Permanent(permanent));

        if !removed {
            tracing::debug!("ENGINE: p-{} was already deleted", permanent);
            return Ok(());
        }

        tracing::info!("ENGINE: Deleted p-{}", permanent);
        inner.events.emit(EngineEvent::RecordDeleted {
            id: RecordId::Permanent(permanent),
        });
        inner.emit_records_changed().await;

        if inner.deletions.mark_deleted(permanent).await {
            inner
                .events
                .emit(EngineEvent::PendingDeletionsChanged { pending: true });
            inner.rearm_cadence(true);
        }
        if inner.scheduler.is_enabled() {
            inner.schedule_deferred(false);
        }
        Ok(())
    }

    /// Sync with the remote and reload the visible list.
    pub async fn pull_from_remote(&self) -> CycleOutcome {
        self.inner.run_cycle(CycleKind::Pull).await
    }

    /// Sync with the remote without reloading the visible list.
    pub async fn push_to_remote(&self) -> CycleOutcome {
        self.inner.run_cycle(CycleKind::Push).await
    }

    /// Run a cycle only if local deletions are waiting.
    pub async fn sync_pending_deletions(&self) -> CycleOutcome {
        if !self.inner.deletions.has_pending_deletions().await {
            return CycleOutcome::Skipped(SkipReason::NothingPending);
        }
        self.inner.run_cycle(CycleKind::Scheduled).await
    }

    /// Run one reconciliation cycle now, as a timer tick would.
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.inner.run_cycle(CycleKind::Scheduled).await
    }

    /// Turn background reconciliation on or off. Enabling arms the timer at
    /// the cadence matching outstanding deletions and starts one cycle
    /// immediately; disabling only cancels the timer.
    pub async fn toggle_sync(&self, enabled: bool) {
        let inner = &self.inner;
        if enabled && inner.disposed.load(Ordering::SeqCst) {
            tracing::warn!("ENGINE: Ignoring sync toggle on a disposed engine");
            return;
        }
        let changed = if enabled {
            let urgent = inner.deletions.has_pending_deletions().await;
            let armed = inner.scheduler.enable(urgent, inner.ticker());
            if armed {
                inner.schedule_cycle(Duration::ZERO, false);
            }
            armed
        } else {
            inner.scheduler.disable()
        };

        if changed {
            tracing::info!("ENGINE: Sync {}", if enabled { "enabled" } else { "disabled" });
            inner.events.emit(EngineEvent::SyncToggled { enabled });
        }
    }

    pub fn start_edit_mode(&self) {
        if self.inner.guard.enter() {
            tracing::debug!("ENGINE: Edit mode started, refreshes suspended");
        }
    }

    /// Leave edit mode and schedule one refresh (plus a cycle if syncing)
    /// after the settle delay.
    pub fn end_edit_mode(&self) {
        if self.inner.guard.exit() {
            tracing::debug!("ENGINE: Edit mode ended");
        }
        self.inner.schedule_deferred(true);
    }

    /// Visible records: staged records (newest first) followed by the
    /// persisted snapshot. Drafts always lead the list, ahead of any stored
    /// record.
    pub async fn records(&self) -> Vec<Record> {
        self.inner.visible_records().await
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.scheduler.is_enabled()
    }

    pub fn is_editing(&self) -> bool {
        self.inner.guard.is_suspended()
    }

    pub async fn has_pending_deletions(&self) -> bool {
        self.inner.deletions.has_pending_deletions().await
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.inner.scheduler.state()
    }

    pub fn armed_interval(&self) -> Option<Duration> {
        self.inner.scheduler.armed_interval()
    }

    pub async fn last_synced_at(&self) -> TallyResult<Option<DateTime<Utc>>> {
        Ok(self.inner.store.last_synced_at().await?)
    }

    /// Stop all background work. Local operations keep working.
    pub fn dispose(&self) {
        if !self.inner.disposed.swap(true, Ordering::SeqCst) {
            self.inner.scheduler.disable();
            tracing::info!("ENGINE: Disposed");
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl EngineInner {
    async fn visible_records(&self) -> Vec<Record> {
        let mut records: Vec<Record> = self.pending.values().await;
        records.reverse();
        records.extend(self.snapshot.read().await.iter().cloned());
        records.retain(|r| r.id.is_valid());
        records
    }

    async fn emit_records_changed(&self) {
        let count = self.visible_records().await.len();
        self.events.emit(EngineEvent::RecordsChanged { count });
    }

    async fn save_persisted(&self, permanent: i64, patch: &RecordPatch) -> TallyResult<i64> {
        let rows = self.store.update(permanent, patch).await.map_err(|e| {
            tracing::error!("ENGINE: Failed to update p-{}: {}", permanent, e);
            e
        })?;
        if rows == 0 && !patch.is_empty() {
            tracing::warn!("ENGINE: p-{} no longer exists, nothing updated", permanent);
        }

        let stored = self.store.get(permanent).await?;
        {
            let mut snapshot = self.snapshot.write().await;
            let position = snapshot
                .iter()
                .position(|r| r.id == RecordId::Permanent(permanent));
            match (position, stored) {
                (Some(index), Some(record)) => snapshot[index] = record,
                (Some(index), None) => {
                    snapshot.remove(index);
                }
                (None, Some(record)) => snapshot.insert(0, record),
                (None, None) => {}
            }
        }

        tracing::debug!("ENGINE: Saved p-{}, rows affected: {}", permanent, rows);
        self.events.emit(EngineEvent::RecordSaved {
            id: RecordId::Permanent(permanent),
        });
        self.emit_records_changed().await;
        Ok(permanent)
    }

    /// Replace the snapshot with the store's contents unless edit mode is on.
    /// Returns whether the snapshot was replaced.
    async fn refresh_snapshot(&self) -> bool {
        if self.guard.is_suspended() {
            tracing::debug!("ENGINE: Edit mode active, keeping snapshot");
            return false;
        }

        match self.store.load_all().await {
            Ok(records) => {
                let count = records.len();
                *self.snapshot.write().await = records;
                tracing::debug!("ENGINE: Snapshot refreshed with {} records", count);
                self.emit_records_changed().await;
                true
            }
            Err(e) => {
                tracing::warn!("ENGINE: Failed to reload records: {}", e);
                false
            }
        }
    }

    async fn run_cycle(self: &Arc<Self>, kind: CycleKind) -> CycleOutcome {
        if kind == CycleKind::Scheduled && self.guard.is_suspended() {
            tracing::debug!("ENGINE: Edit mode active, skipping sync");
            return CycleOutcome::Skipped(SkipReason::EditMode);
        }
        let Some(_flight) = InFlight::acquire(&self.in_flight) else {
            tracing::debug!("ENGINE: Sync already in flight, skipping");
            return CycleOutcome::Skipped(SkipReason::InFlight);
        };

        self.events.emit(EngineEvent::SyncStarted);

        let watermark = match self.store.queue_watermark().await {
            Ok(watermark) => watermark,
            Err(e) => return self.cycle_failed(e.to_string()),
        };

        let report = match self.remote.sync(&self.store).await {
            Ok(report) => report,
            Err(e) => return self.cycle_failed(e.to_string()),
        };

        self.follow_reassigned(&report.reassigned).await;
        if kind != CycleKind::Push {
            self.refresh_snapshot().await;
        }

        if let Err(e) = self.store.clear_sync_queue_through(watermark).await {
            tracing::warn!("ENGINE: Failed to trim sync queue: {}", e);
        }
        let deletions_synced = self.settle_deletions().await;
        if let Err(e) = self.store.record_sync_completed(Utc::now()).await {
            tracing::warn!("ENGINE: Failed to record sync time: {}", e);
        }

        tracing::info!(
            "ENGINE: Sync completed: {} pushed, {} deleted remotely, {} deletions confirmed",
            report.pushed,
            report.deleted,
            deletions_synced
        );
        self.events
            .emit(EngineEvent::SyncCompleted { deletions_synced });
        CycleOutcome::Completed(report)
    }

    /// Keep temp-id lookups and the visible snapshot on records the remote
    /// moved to a new id.
    async fn follow_reassigned(&self, moves: &[(i64, i64)]) {
        if moves.is_empty() {
            return;
        }
        let mut snapshot = self.snapshot.write().await;
        for &(old_id, new_id) in moves {
            self.pending.repoint(old_id, new_id).await;
            if let Some(record) = snapshot
                .iter_mut()
                .find(|r| r.id == RecordId::Permanent(old_id))
            {
                record.id = RecordId::Permanent(new_id);
            }
            tracing::info!("ENGINE: p-{} is now p-{}", old_id, new_id);
        }
    }

    fn cycle_failed(&self, message: String) -> CycleOutcome {
        tracing::warn!("ENGINE: Sync failed, will retry: {}", message);
        self.events.emit(EngineEvent::SyncFailed {
            message: message.clone(),
        });
        CycleOutcome::Failed(message)
    }

    /// Clear deletion markers after a successful cycle. Deletions queued
    /// after the cycle's watermark are still outstanding and stay marked.
    /// The cadence follows whether any deletion is pending afterwards.
    async fn settle_deletions(self: &Arc<Self>) -> usize {
        let was_pending = self.deletions.has_pending_deletions().await;
        let cleared = self.deletions.clear_all().await;

        match self.store.queued_deletions().await {
            Ok(remaining) => {
                for id in remaining {
                    self.deletions.mark_deleted(id).await;
                }
            }
            Err(e) => tracing::warn!("ENGINE: Failed to read queued deletions: {}", e),
        }

        let pending = self.deletions.has_pending_deletions().await;
        if pending != was_pending {
            self.events
                .emit(EngineEvent::PendingDeletionsChanged { pending });
        }
        self.rearm_cadence(pending);
        cleared
    }
}

// Timer ticks and deferred cycles only hold a `Weak` to the engine.
impl EngineInner {
    fn ticker(self: &Arc<Self>) -> impl Fn() -> TickFuture + Send + Sync + 'static {
        let weak = Arc::downgrade(self);
        move || -> TickFuture { Box::pin(scheduled_tick(weak.clone())) }
    }

    fn rearm_cadence(self: &Arc<Self>, urgent: bool) {
        self.scheduler.rearm(urgent, self.ticker());
    }

    fn schedule_deferred(self: &Arc<Self>, refresh: bool) {
        self.schedule_cycle(self.config.settle_delay, refresh);
    }

    /// Spawn a refresh and/or cycle after `delay`. The cycle only runs if
    /// sync is still enabled by then.
    fn schedule_cycle(self: &Arc<Self>, delay: Duration, refresh: bool) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.disposed.load(Ordering::SeqCst) {
                return;
            }
            if refresh {
                inner.refresh_snapshot().await;
            }
            if inner.scheduler.is_enabled() {
                inner.run_cycle(CycleKind::Scheduled).await;
            }
        });
    }
}

async fn scheduled_tick(weak: Weak<EngineInner>) {
    if let Some(inner) = weak.upgrade() {
        inner.run_cycle(CycleKind::Scheduled).await;
    }
}

//! Event callbacks for the inventory engine
//!
//! The engine emits events from whichever task did the work (a save, a
//! scheduled sync, a deferred refresh). Events are queued and callbacks only
//! run when the application calls `process_events()`, always on the thread
//! that registered the first callback. UI code therefore never has to deal
//! with callbacks arriving from runtime worker threads.
//!
//! # Example
//!
//! ```rust,no_run
//! use tally_client::events::{EngineEvent, EventDispatcher};
//!
//! let dispatcher = EventDispatcher::new();
//!
//! dispatcher.register_callback(|event| {
//!     if let EngineEvent::RecordsChanged { count } = event {
//!         println!("{} records visible", count);
//!     }
//! }).unwrap();
//!
//! // In the UI loop
//! dispatcher.process_events().unwrap();
//! ```

use std::sync::{mpsc, Mutex};
use std::thread::{self, ThreadId};
use tally_core::{
    errors::{TallyError, TallyResult},
    models::RecordId,
};

/// Discriminant of an [`EngineEvent`], used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    RecordsChanged,
    RecordSaved,
    RecordDeleted,
    SyncStarted,
    SyncCompleted,
    SyncFailed,
    SyncToggled,
    PendingDeletionsChanged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The visible record list was replaced
    RecordsChanged { count: usize },
    /// A record was persisted (first save of a staged record or an update)
    RecordSaved { id: RecordId },
    /// A record was removed locally
    RecordDeleted { id: RecordId },
    SyncStarted,
    /// A reconciliation finished; `deletions_synced` is the number of local
    /// deletions it covered
    SyncCompleted { deletions_synced: usize },
    /// A reconciliation failed and will be retried by a later cycle
    SyncFailed { message: String },
    SyncToggled { enabled: bool },
    PendingDeletionsChanged { pending: bool },
}

impl EngineEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            EngineEvent::RecordsChanged { .. } => EventType::RecordsChanged,
            EngineEvent::RecordSaved { .. } => EventType::RecordSaved,
            EngineEvent::RecordDeleted { .. } => EventType::RecordDeleted,
            EngineEvent::SyncStarted => EventType::SyncStarted,
            EngineEvent::SyncCompleted { .. } => EventType::SyncCompleted,
            EngineEvent::SyncFailed { .. } => EventType::SyncFailed,
            EngineEvent::SyncToggled { .. } => EventType::SyncToggled,
            EngineEvent::PendingDeletionsChanged { .. } => EventType::PendingDeletionsChanged,
        }
    }
}

struct CallbackEntry {
    callback: Box<dyn Fn(EngineEvent) + Send>,
    event_filter: Option<EventType>,
}

/// Thread-safe event dispatcher. Emitting is allowed from any thread;
/// callbacks are only invoked from `process_events()` on the callback thread.
pub struct EventDispatcher {
    callbacks: Mutex<Vec<CallbackEntry>>,
    event_queue: Mutex<mpsc::Receiver<EngineEvent>>,
    event_sender: mpsc::Sender<EngineEvent>,
    callback_thread_id: Mutex<Option<ThreadId>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            callbacks: Mutex::new(Vec::new()),
            event_queue: Mutex::new(receiver),
            event_sender: sender,
            callback_thread_id: Mutex::new(None),
        }
    }

    /// Helper to set callback thread ID on first registration
    fn ensure_callback_thread(&self) -> TallyResult<()> {
        let mut thread_id = self
            .callback_thread_id
            .lock()
            .map_err(|_| TallyError::LockError("thread ID".into()))?;
        if thread_id.is_none() {
            *thread_id = Some(thread::current().id());
            tracing::info!(
                "Event callbacks will be processed on thread: {:?}",
                thread::current().id()
            );
        }
        Ok(())
    }

    /// Register a callback for every event.
    pub fn register_callback<F>(&self, callback: F) -> TallyResult<()>
    where
        F: Fn(EngineEvent) + Send + 'static,
    {
        self.push_callback(Box::new(callback), None)
    }

    /// Register a callback that only receives events of `event_filter`.
    pub fn register_callback_filtered<F>(&self, callback: F, event_filter: EventType) -> TallyResult<()>
    where
        F: Fn(EngineEvent) + Send + 'static,
    {
        self.push_callback(Box::new(callback), Some(event_filter))
    }

    fn push_callback(
        &self,
        callback: Box<dyn Fn(EngineEvent) + Send>,
        event_filter: Option<EventType>,
    ) -> TallyResult<()> {
        self.ensure_callback_thread()?;

        let mut callbacks = self
            .callbacks
            .lock()
            .map_err(|_| TallyError::LockError("callbacks".into()))?;
        callbacks.push(CallbackEntry {
            callback,
            event_filter,
        });
        Ok(())
    }

    /// Queue an event for the callback thread. Events emitted before any
    /// callback is registered are dropped.
    pub fn emit(&self, event: EngineEvent) {
        let listening = self
            .callback_thread_id
            .lock()
            .map(|id| id.is_some())
            .unwrap_or(false);
        if !listening {
            return;
        }

        if self.event_sender.send(event).is_err() {
            tracing::error!("Failed to queue event - receiver may have been dropped");
        }
    }

    /// Process all queued events. This MUST be called on the same thread where callbacks were registered.
    pub fn process_events(&self) -> TallyResult<usize> {
        {
            let thread_id = self
                .callback_thread_id
                .lock()
                .map_err(|_| TallyError::LockError("thread ID".into()))?;
            match *thread_id {
                Some(expected) if thread::current().id() != expected => {
                    return Err(TallyError::ThreadSafetyViolation);
                }
                Some(_) => {}
                None => return Err(TallyError::NoCallbacksRegistered),
            }
        }

        let callbacks = self
            .callbacks
            .lock()
            .map_err(|_| TallyError::LockError("callbacks".into()))?;
        let receiver = self
            .event_queue
            .lock()
            .map_err(|_| TallyError::LockError("event queue".into()))?;

        let mut processed_count = 0;
        while let Ok(event) = receiver.try_recv() {
            let event_type = event.event_type();
            for entry in callbacks.iter() {
                if entry.event_filter.is_some_and(|filter| filter != event_type) {
                    continue;
                }
                (entry.callback)(event.clone());
            }
            processed_count += 1;
        }

        Ok(processed_count)
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

pub mod database;
pub mod deletions;
pub mod edit_guard;
pub mod engine;
pub mod events;
pub mod pending;
pub mod queries;
pub mod remote;
pub mod scheduler;

pub use database::{MergeSummary, RecordStore};
pub use engine::{CycleOutcome, Engine, SkipReason};
pub use events::{EngineEvent, EventDispatcher, EventType};
pub use remote::{RemoteSync, SqliteReplica, SyncReport};
pub use scheduler::SchedulerState;

//! Tally - local-first inventory records with background sync
//!
//! This crate provides a unified API for the Tally engine.
//!
//! # Example
//!
//! ```ignore
//! use tally::{Engine, EngineConfig, RecordPatch, ReplicaConfig};
//!
//! let engine = Engine::open("sqlite:tally.db?mode=rwc", &ReplicaConfig::from_env()?, EngineConfig::default()).await?;
//! let draft = engine.create_record().await?;
//! let id = engine.save_record(draft.id, &RecordPatch::default().name("Widget").qty(5)).await?;
//! engine.toggle_sync(true).await;
//! ```

// Re-export engine types
pub use tally_client::{
    CycleOutcome, Engine, EngineEvent, EventType, RecordStore, RemoteSync, SchedulerState,
    SkipReason, SqliteReplica, SyncReport,
};

// Re-export core types that applications need
pub use tally_core::config::{EngineConfig, ReplicaConfig};
pub use tally_core::errors::{StorageError, SyncError, TallyError};
pub use tally_core::models::{Record, RecordFields, RecordId, RecordPatch, RecordStatus};
pub use tally_core::{StorageResult, TallyResult};

use thiserror::Error;

/// Failure of a local persistence operation. Reported to the caller of the
/// user action that triggered it and never retried.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Date parsing error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("Invalid column value: {0}")]
    InvalidValue(String),
}

/// Failure of a reconciliation with the remote replica. Swallowed at the
/// scheduler and manual pull/push boundary; the next cycle retries.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    #[error("Remote database error: {0}")]
    Remote(#[from] sqlx::Error),

    #[error("Remote rejected sync: {0}")]
    Rejected(String),

    #[error("Local storage failed during sync: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Error, Debug)]
pub enum TallyError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid record id: {0}")]
    InvalidId(String),

    #[error("Temporary id {0} is already staged")]
    DuplicateTempId(u64),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Failed to acquire lock: {0}")]
    LockError(String),

    #[error("Thread safety violation: process_events() must be called on the registration thread")]
    ThreadSafetyViolation,

    #[error("No callbacks registered yet")]
    NoCallbacksRegistered,
}

impl From<sqlx::Error> for TallyError {
    fn from(err: sqlx::Error) -> Self {
        TallyError::Storage(StorageError::Database(err))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
pub type TallyResult<T> = Result<T, TallyError>;

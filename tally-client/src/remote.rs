//! Remote replica of the record table.
//!
//! The engine only knows the `RemoteSync` capability. `SqliteReplica` is the
//! concrete implementation: it pushes queued local changes to a replica
//! database and pulls the replica's rows back into the record store.

use crate::database::{MergeSummary, RecordStore};
use crate::queries::{DbHelpers, Queries};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::collections::BTreeMap;
use std::sync::Arc;
use tally_core::{config::ReplicaConfig, errors::SyncError};

/// Counts from one round trip with the remote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pushed: usize,
    pub deleted: usize,
    pub merged: MergeSummary,
    /// Local records moved to a new permanent id, as `(old, new)`.
    pub reassigned: Vec<(i64, i64)>,
}

#[derive(Default)]
struct PushSummary {
    pushed: usize,
    deleted: usize,
    reassigned: Vec<(i64, i64)>,
}

#[async_trait]
pub trait RemoteSync: Send + Sync {
    /// Exchange changes with the remote. A failed call may be retried as a
    /// whole; the local sync queue is only cleared by the engine after `Ok`.
    async fn sync(&self, store: &RecordStore) -> Result<SyncReport, SyncError>;
}

#[async_trait]
impl<T: RemoteSync + ?Sized> RemoteSync for Arc<T> {
    async fn sync(&self, store: &RecordStore) -> Result<SyncReport, SyncError> {
        (**self).sync(store).await
    }
}

pub struct SqliteReplica {
    pool: SqlitePool,
}

impl SqliteReplica {
    pub async fn connect(config: &ReplicaConfig) -> Result<Self, SyncError> {
        if config.url.trim().is_empty() {
            return Err(SyncError::Unavailable(
                "replica url is empty".to_string(),
            ));
        }
        if config.auth_token.is_some() {
            tracing::debug!("REPLICA: Auth token is not used by sqlite replicas");
        }

        // Each SQLite memory connection is its own database.
        let in_memory = config.url.contains(":memory:");
        let mut options = SqlitePoolOptions::new();
        options = if in_memory {
            options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options.max_connections(5)
        };

        let pool = options.connect(&config.url).await?;
        DbHelpers::init_replica_schema(&pool).await?;

        tracing::info!("REPLICA: Connected to {}", config.url);
        Ok(Self { pool })
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, SyncError> {
        DbHelpers::init_replica_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Send every queued local change. The queue only names ids; the current
    /// local row decides what the replica ends up with, so the last local
    /// write wins no matter how many operations were queued for it.
    ///
    /// Ids are assigned per device, so a replica row under the same id may
    /// belong to a record another device created. Such a row is recognised by
    /// its creation time: the local record is moved to an id unused on both
    /// sides before it is sent, and a local deletion only removes the replica
    /// row it was stamped with.
    async fn push(&self, store: &RecordStore) -> Result<PushSummary, SyncError> {
        let mut summary = PushSummary::default();
        let operations = store.queued_operations().await?;
        if operations.is_empty() {
            return Ok(summary);
        }

        let mut stamps: BTreeMap<i64, Option<String>> = BTreeMap::new();
        for op in &operations {
            let entry = stamps.entry(op.record_id).or_insert(None);
            if let Some(at) = &op.record_created_at {
                *entry = Some(DbHelpers::timestamp(at));
            }
        }

        let mut tx = self.pool.begin().await?;

        for (id, stamp) in stamps {
            let Some(record) = store.get(id).await? else {
                let result = sqlx::query(Queries::DELETE_STAMPED_RECORD)
                    .bind(id)
                    .bind(stamp)
                    .execute(&mut *tx)
                    .await?;
                summary.deleted += result.rows_affected() as usize;
                continue;
            };

            let created_at = DbHelpers::timestamp(&record.created_at);
            let remote_created_at: Option<String> =
                sqlx::query_scalar(Queries::GET_RECORD_CREATED_AT)
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?;

            let target = match remote_created_at {
                Some(remote) if remote != created_at => {
                    let floor: i64 = sqlx::query_scalar(Queries::MAX_RECORD_ID)
                        .fetch_one(&mut *tx)
                        .await?;
                    let moved = store.reassign_id(id, floor).await?;
                    tracing::warn!(
                        "REPLICA: p-{} is taken by another device's record, sending as p-{}",
                        id,
                        moved
                    );
                    summary.reassigned.push((id, moved));
                    moved
                }
                _ => id,
            };

            let params = DbHelpers::record_params(&record.fields);
            sqlx::query(Queries::UPSERT_RECORD)
                .bind(target)
                .bind(params.0)
                .bind(params.1)
                .bind(params.2)
                .bind(params.3)
                .bind(params.4)
                .bind(params.5)
                .bind(params.6)
                .bind(created_at)
                .bind(DbHelpers::timestamp(&record.updated_at))
                .execute(&mut *tx)
                .await?;
            summary.pushed += 1;
        }

        tx.commit().await?;
        Ok(summary)
    }

    async fn pull(&self, store: &RecordStore) -> Result<MergeSummary, SyncError> {
        let rows = sqlx::query(Queries::LOAD_ALL_RECORDS)
            .fetch_all(&self.pool)
            .await?;
        let records = rows
            .iter()
            .map(DbHelpers::parse_record)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(store.merge_remote(&records).await?)
    }
}

#[async_trait]
impl RemoteSync for SqliteReplica {
    async fn sync(&self, store: &RecordStore) -> Result<SyncReport, SyncError> {
        let pushed = self.push(store).await?;
        let merged = self.pull(store).await?;

        tracing::debug!(
            "REPLICA: Pushed {} rows, deleted {}, merged {:?}",
            pushed.pushed,
            pushed.deleted,
            merged
        );
        Ok(SyncReport {
            pushed: pushed.pushed,
            deleted: pushed.deleted,
            merged,
            reassigned: pushed.reassigned,
        })
    }
}

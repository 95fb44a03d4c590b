use crate::queries::{DbHelpers, Queries};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::collections::HashSet;
use tally_core::{
    models::{QueuedOperation, Record, RecordFields, RecordPatch, SyncOperation},
    StorageResult,
};

/// Outcome of folding the remote replica's rows into the local table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub upserted: usize,
    pub removed: usize,
    pub skipped: usize,
}

/// Durable local storage of persisted records.
///
/// Every mutation also appends to the sync queue inside the same
/// transaction, so a crash can never leave a change that the next
/// reconciliation does not know about.
pub struct RecordStore {
    pub pool: SqlitePool,
}

impl RecordStore {
    pub async fn new(database_url: &str) -> StorageResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Open (creating if needed) and migrate the database at `database_url`.
    pub async fn open(database_url: &str) -> StorageResult<Self> {
        let store = Self::new(database_url).await?;
        store.run_migrations().await?;
        Ok(store)
    }

    /// Private in-memory database. Pinned to a single connection that is
    /// never recycled, since each SQLite memory connection is its own database.
    pub async fn in_memory() -> StorageResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn run_migrations(&self) -> StorageResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn load_all(&self) -> StorageResult<Vec<Record>> {
        let rows = sqlx::query(Queries::LOAD_ALL_RECORDS)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(DbHelpers::parse_record).collect()
    }

    pub async fn get(&self, id: i64) -> StorageResult<Option<Record>> {
        let row = sqlx::query(Queries::GET_RECORD)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(DbHelpers::parse_record).transpose()
    }

    pub async fn count(&self) -> StorageResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Persist a new record and return its permanent id.
    pub async fn insert(&self, fields: &RecordFields) -> StorageResult<i64> {
        let now = DbHelpers::timestamp(&Utc::now());
        let params = DbHelpers::record_params(fields);

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(Queries::INSERT_RECORD)
            .bind(params.0) // name
            .bind(params.1) // barcode
            .bind(params.2) // image
            .bind(params.3) // location
            .bind(params.4) // qty
            .bind(params.5) // notes
            .bind(params.6) // status
            .bind(now.as_str()) // created_at
            .bind(now.as_str()) // updated_at
            .execute(&mut *tx)
            .await?;
        let id = result.last_insert_rowid();

        sqlx::query(Queries::INSERT_SYNC_QUEUE)
            .bind(id)
            .bind(SyncOperation::Create.to_string())
            .bind(now.as_str())
            .bind(Option::<String>::None)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::debug!("STORE: Inserted record p-{}", id);
        Ok(id)
    }

    /// Persist the fields present in `patch`. Returns the number of rows
    /// touched; zero means the record no longer exists.
    pub async fn update(&self, id: i64, patch: &RecordPatch) -> StorageResult<u64> {
        if patch.is_empty() {
            return Ok(0);
        }

        let now = DbHelpers::timestamp(&Utc::now());
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(Queries::UPDATE_RECORD)
            .bind(id)
            .bind(patch.name.clone())
            .bind(patch.barcode.clone())
            .bind(patch.image.clone())
            .bind(patch.location.clone())
            .bind(patch.qty)
            .bind(patch.notes.clone())
            .bind(patch.status.map(|s| s.to_string()))
            .bind(now.as_str())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() > 0 {
            sqlx::query(Queries::INSERT_SYNC_QUEUE)
                .bind(id)
                .bind(SyncOperation::Update.to_string())
                .bind(now.as_str())
                .bind(Option::<String>::None)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            "STORE: Updated record p-{}, rows affected: {}",
            id,
            result.rows_affected()
        );
        Ok(result.rows_affected())
    }

    /// Remove a record. Deleting a missing id succeeds and returns `false`.
    pub async fn delete(&self, id: i64) -> StorageResult<bool> {
        let now = DbHelpers::timestamp(&Utc::now());
        let mut tx = self.pool.begin().await?;

        let created_at: Option<String> = sqlx::query_scalar(Queries::GET_RECORD_CREATED_AT)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let result = sqlx::query(Queries::DELETE_RECORD)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let removed = result.rows_affected() > 0;

        if removed {
            sqlx::query(Queries::INSERT_SYNC_QUEUE)
                .bind(id)
                .bind(SyncOperation::Delete.to_string())
                .bind(now.as_str())
                .bind(created_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::debug!("STORE: Delete of record p-{} removed row: {}", id, removed);
        Ok(removed)
    }

    /// Highest sequence number currently in the sync queue (0 when empty).
    pub async fn queue_watermark(&self) -> StorageResult<i64> {
        let seq: i64 = sqlx::query_scalar(Queries::SYNC_QUEUE_WATERMARK)
            .fetch_one(&self.pool)
            .await?;
        Ok(seq)
    }

    pub async fn queued_operations(&self) -> StorageResult<Vec<QueuedOperation>> {
        let rows = sqlx::query(Queries::GET_SYNC_QUEUE)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(DbHelpers::parse_queued_operation).collect()
    }

    /// Ids whose deletion has not yet been confirmed by a reconciliation.
    pub async fn queued_deletions(&self) -> StorageResult<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(Queries::QUEUED_DELETIONS)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Drop queue entries up to and including `watermark`. Entries queued
    /// after the watermark was read stay for the next cycle.
    pub async fn clear_sync_queue_through(&self, watermark: i64) -> StorageResult<u64> {
        let result = sqlx::query(Queries::CLEAR_SYNC_QUEUE_THROUGH)
            .bind(watermark)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Move a record to a fresh id above both `floor` and every id this store
    /// has issued, carrying its queued changes along. Returns the new id.
    pub async fn reassign_id(&self, id: i64, floor: i64) -> StorageResult<i64> {
        let mut tx = self.pool.begin().await?;

        let issued: i64 = sqlx::query_scalar(Queries::MAX_ISSUED_RECORD_ID)
            .fetch_one(&mut *tx)
            .await?;
        let new_id = issued.max(floor) + 1;

        sqlx::query(Queries::MOVE_RECORD)
            .bind(id)
            .bind(new_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(Queries::MOVE_QUEUED_RECORD)
            .bind(id)
            .bind(new_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(Queries::BUMP_RECORD_SEQUENCE)
            .bind(new_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!("STORE: Record p-{} moved to p-{}", id, new_id);
        Ok(new_id)
    }

    /// Fold the replica's rows into the local table: rows are upserted, local
    /// rows absent remotely are removed. Ids with queued local changes are
    /// left alone; the next push carries them.
    pub async fn merge_remote(&self, remote: &[Record]) -> StorageResult<MergeSummary> {
        let mut tx = self.pool.begin().await?;

        let queued: HashSet<i64> = sqlx::query_scalar::<_, i64>(Queries::QUEUED_RECORD_IDS)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .collect();
        let local: HashSet<i64> = sqlx::query_scalar::<_, i64>(Queries::LIST_RECORD_IDS)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .collect();

        let mut summary = MergeSummary::default();
        let mut remote_ids = HashSet::with_capacity(remote.len());

        for record in remote {
            let Some(id) = record.id.permanent() else {
                continue;
            };
            remote_ids.insert(id);

            if queued.contains(&id) {
                summary.skipped += 1;
                continue;
            }

            let params = DbHelpers::record_params(&record.fields);
            sqlx::query(Queries::UPSERT_RECORD)
                .bind(id)
                .bind(params.0)
                .bind(params.1)
                .bind(params.2)
                .bind(params.3)
                .bind(params.4)
                .bind(params.5)
                .bind(params.6)
                .bind(DbHelpers::timestamp(&record.created_at))
                .bind(DbHelpers::timestamp(&record.updated_at))
                .execute(&mut *tx)
                .await?;
            summary.upserted += 1;
        }

        for id in local.difference(&remote_ids) {
            if queued.contains(id) {
                continue;
            }
            sqlx::query(Queries::DELETE_RECORD)
                .bind(*id)
                .execute(&mut *tx)
                .await?;
            summary.removed += 1;
        }

        tx.commit().await?;

        tracing::debug!(
            "STORE: Merged remote rows: {} upserted, {} removed, {} skipped",
            summary.upserted,
            summary.removed,
            summary.skipped
        );
        Ok(summary)
    }

    pub async fn record_sync_completed(&self, at: DateTime<Utc>) -> StorageResult<()> {
        sqlx::query(Queries::UPDATE_LAST_SYNC)
            .bind(DbHelpers::timestamp(&at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn last_synced_at(&self) -> StorageResult<Option<DateTime<Utc>>> {
        let raw = sqlx::query_scalar::<_, Option<String>>(Queries::GET_LAST_SYNC)
            .fetch_optional(&self.pool)
            .await?
            .flatten();

        raw.as_deref().map(DbHelpers::parse_timestamp).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::models::RecordId;

    fn widget(name: &str, qty: i64) -> RecordFields {
        RecordFields {
            name: name.to_string(),
            qty,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids() {
        let store = RecordStore::in_memory().await.unwrap();

        let first = store.insert(&widget("Bolts", 10)).await.unwrap();
        let second = store.insert(&widget("Nuts", 20)).await.unwrap();
        assert!(second > first);

        let loaded = store.get(first).await.unwrap().unwrap();
        assert_eq!(loaded.id, RecordId::Permanent(first));
        assert_eq!(loaded.fields.name, "Bolts");
        assert_eq!(loaded.fields.qty, 10);
    }

    #[tokio::test]
    async fn test_deleted_ids_are_not_reused() {
        let store = RecordStore::in_memory().await.unwrap();

        let first = store.insert(&widget("Bolts", 1)).await.unwrap();
        assert!(store.delete(first).await.unwrap());
        let second = store.insert(&widget("Nuts", 1)).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_update_with_empty_patch_is_noop() {
        let store = RecordStore::in_memory().await.unwrap();
        let id = store.insert(&widget("Bolts", 1)).await.unwrap();
        let watermark = store.queue_watermark().await.unwrap();

        let rows = store.update(id, &RecordPatch::default()).await.unwrap();
        assert_eq!(rows, 0);
        assert_eq!(store.queue_watermark().await.unwrap(), watermark);
    }

    #[tokio::test]
    async fn test_reassign_id_moves_row_and_queue() {
        let store = RecordStore::in_memory().await.unwrap();
        let id = store.insert(&widget("Bolts", 3)).await.unwrap();

        let moved = store.reassign_id(id, 40).await.unwrap();
        assert_eq!(moved, 41);
        assert!(store.get(id).await.unwrap().is_none());
        assert_eq!(store.get(moved).await.unwrap().unwrap().fields.name, "Bolts");

        let queued = store.queued_operations().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].record_id, moved);

        let next = store.insert(&widget("Nuts", 1)).await.unwrap();
        assert!(next > moved);
    }

    #[tokio::test]
    async fn test_delete_stamps_creation_time() {
        let store = RecordStore::in_memory().await.unwrap();
        let id = store.insert(&widget("Bolts", 3)).await.unwrap();
        let created_at = store.get(id).await.unwrap().unwrap().created_at;

        store.delete(id).await.unwrap();

        let queued = store.queued_operations().await.unwrap();
        assert_eq!(queued[0].record_created_at, None);
        assert_eq!(queued[1].operation, SyncOperation::Delete);
        assert_eq!(queued[1].record_created_at, Some(created_at));
    }

    #[tokio::test]
    async fn test_last_synced_at_round_trip() {
        let store = RecordStore::in_memory().await.unwrap();
        assert_eq!(store.last_synced_at().await.unwrap(), None);

        let now = Utc::now();
        store.record_sync_completed(now).await.unwrap();
        let stored = store.last_synced_at().await.unwrap().unwrap();
        assert_eq!(stored.timestamp_micros(), now.timestamp_micros());
    }
}

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tally_core::{
    models::{QueuedOperation, Record, RecordFields, RecordId, RecordStatus, SyncOperation},
    StorageError, StorageResult,
};

/// Type alias for record field parameters tuple
pub type RecordParams = (
    String, // name
    String, // barcode
    String, // image
    String, // location
    i64,    // qty
    String, // notes
    String, // status
);

/// SQL queries for record store and replica operations
pub struct Queries;

impl Queries {
    /// Schema of the remote replica. Rows arrive with their local ids, so the
    /// replica never assigns ids itself.
    pub const REPLICA_SCHEMA: &'static str = r#"
        CREATE TABLE IF NOT EXISTS records (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL DEFAULT '',
            barcode TEXT NOT NULL DEFAULT '',
            image TEXT NOT NULL DEFAULT '',
            location TEXT NOT NULL DEFAULT '',
            qty INTEGER NOT NULL DEFAULT 0,
            notes TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'active',
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_records_created_at ON records(created_at);
    "#;

    // Record queries
    pub const LOAD_ALL_RECORDS: &'static str = r#"
        SELECT id, name, barcode, image, location, qty, notes, status,
               created_at, updated_at
        FROM records
        ORDER BY created_at DESC, id DESC
    "#;

    pub const GET_RECORD: &'static str = r#"
        SELECT id, name, barcode, image, location, qty, notes, status,
               created_at, updated_at
        FROM records
        WHERE id = ?1
    "#;

    pub const LIST_RECORD_IDS: &'static str = "SELECT id FROM records";

    pub const INSERT_RECORD: &'static str = r#"
        INSERT INTO records (
            name, barcode, image, location, qty, notes, status,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
    "#;

    /// Partial update: NULL parameters keep the stored value.
    pub const UPDATE_RECORD: &'static str = r#"
        UPDATE records SET
            name = COALESCE(?2, name),
            barcode = COALESCE(?3, barcode),
            image = COALESCE(?4, image),
            location = COALESCE(?5, location),
            qty = COALESCE(?6, qty),
            notes = COALESCE(?7, notes),
            status = COALESCE(?8, status),
            updated_at = ?9
        WHERE id = ?1
    "#;

    pub const UPSERT_RECORD: &'static str = r#"
        INSERT INTO records (
            id, name, barcode, image, location, qty, notes, status,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            barcode = excluded.barcode,
            image = excluded.image,
            location = excluded.location,
            qty = excluded.qty,
            notes = excluded.notes,
            status = excluded.status,
            updated_at = excluded.updated_at
    "#;

    pub const DELETE_RECORD: &'static str = "DELETE FROM records WHERE id = ?1";

    pub const GET_RECORD_CREATED_AT: &'static str =
        "SELECT created_at FROM records WHERE id = ?1";

    /// Removes a replica row only if it is the one this device created. A NULL
    /// stamp matches any row.
    pub const DELETE_STAMPED_RECORD: &'static str = r#"
        DELETE FROM records
        WHERE id = ?1 AND (?2 IS NULL OR created_at = ?2)
    "#;

    pub const MAX_RECORD_ID: &'static str = "SELECT COALESCE(MAX(id), 0) FROM records";

    /// Highest id this table has ever handed out, including deleted rows.
    pub const MAX_ISSUED_RECORD_ID: &'static str = r#"
        SELECT MAX(
            COALESCE((SELECT MAX(id) FROM records), 0),
            COALESCE((SELECT seq FROM sqlite_sequence WHERE name = 'records'), 0)
        )
    "#;

    pub const MOVE_RECORD: &'static str = "UPDATE records SET id = ?2 WHERE id = ?1";

    pub const MOVE_QUEUED_RECORD: &'static str =
        "UPDATE sync_queue SET record_id = ?2 WHERE record_id = ?1";

    pub const BUMP_RECORD_SEQUENCE: &'static str = r#"
        UPDATE sqlite_sequence SET seq = MAX(seq, ?1) WHERE name = 'records'
    "#;

    // Sync queue queries
    pub const INSERT_SYNC_QUEUE: &'static str = r#"
        INSERT INTO sync_queue (record_id, operation_type, queued_at, record_created_at)
        VALUES (?1, ?2, ?3, ?4)
    "#;

    pub const GET_SYNC_QUEUE: &'static str = r#"
        SELECT seq, record_id, operation_type, queued_at, record_created_at
        FROM sync_queue
        ORDER BY seq ASC
    "#;

    pub const SYNC_QUEUE_WATERMARK: &'static str =
        "SELECT COALESCE(MAX(seq), 0) FROM sync_queue";

    pub const CLEAR_SYNC_QUEUE_THROUGH: &'static str = "DELETE FROM sync_queue WHERE seq <= ?1";

    pub const QUEUED_RECORD_IDS: &'static str = "SELECT DISTINCT record_id FROM sync_queue";

    pub const QUEUED_DELETIONS: &'static str = r#"
        SELECT DISTINCT record_id FROM sync_queue
        WHERE operation_type = 'delete'
        ORDER BY record_id ASC
    "#;

    // Sync state queries
    pub const GET_LAST_SYNC: &'static str = "SELECT last_sync_at FROM sync_state WHERE id = 1";

    pub const UPDATE_LAST_SYNC: &'static str =
        "UPDATE sync_state SET last_sync_at = ?1 WHERE id = 1";
}

/// Helper functions for common database operations
pub struct DbHelpers;

impl DbHelpers {
    /// Initialize the replica schema
    pub async fn init_replica_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(Queries::REPLICA_SCHEMA).execute(pool).await?;
        Ok(())
    }

    /// Parse a record from a database row
    pub fn parse_record(row: &SqliteRow) -> StorageResult<Record> {
        let id: i64 = row.try_get("id")?;
        let status: String = row.try_get("status")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Record {
            id: RecordId::Permanent(id),
            fields: RecordFields {
                name: row.try_get("name")?,
                barcode: row.try_get("barcode")?,
                image: row.try_get("image")?,
                location: row.try_get("location")?,
                qty: row.try_get("qty")?,
                notes: row.try_get("notes")?,
                status: status
                    .parse::<RecordStatus>()
                    .map_err(|_| StorageError::InvalidValue(format!("status '{}'", status)))?,
            },
            created_at: Self::parse_timestamp(&created_at)?,
            updated_at: Self::parse_timestamp(&updated_at)?,
        })
    }

    pub fn parse_queued_operation(row: &SqliteRow) -> StorageResult<QueuedOperation> {
        let operation: String = row.try_get("operation_type")?;
        let queued_at: String = row.try_get("queued_at")?;
        let record_created_at: Option<String> = row.try_get("record_created_at")?;

        Ok(QueuedOperation {
            seq: row.try_get("seq")?,
            record_id: row.try_get("record_id")?,
            operation: operation
                .parse::<SyncOperation>()
                .map_err(|_| StorageError::InvalidValue(format!("operation '{}'", operation)))?,
            queued_at: Self::parse_timestamp(&queued_at)?,
            record_created_at: record_created_at
                .as_deref()
                .map(Self::parse_timestamp)
                .transpose()?,
        })
    }

    /// Prepare record fields for binding
    pub fn record_params(fields: &RecordFields) -> RecordParams {
        (
            fields.name.clone(),
            fields.barcode.clone(),
            fields.image.clone(),
            fields.location.clone(),
            fields.qty,
            fields.notes.clone(),
            fields.status.to_string(),
        )
    }

    /// Fixed-width UTC timestamps so that text ordering matches time ordering.
    pub fn timestamp(at: &DateTime<Utc>) -> String {
        at.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn parse_timestamp(raw: &str) -> StorageResult<DateTime<Utc>> {
        Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_round_trip_and_ordering() {
        let early = Utc.with_ymd_and_hms(2024, 1, 18, 9, 0, 5).unwrap();
        let late = early + chrono::Duration::milliseconds(120);

        let early_text = DbHelpers::timestamp(&early);
        let late_text = DbHelpers::timestamp(&late);
        assert_eq!(early_text, "2024-01-18T09:00:05.000000Z");
        assert!(early_text < late_text);
        assert_eq!(DbHelpers::parse_timestamp(&late_text).unwrap(), late);
    }

    #[test]
    fn test_record_params_carry_status_text() {
        let fields = RecordFields {
            name: "Widget".into(),
            qty: 5,
            status: RecordStatus::Archived,
            ..Default::default()
        };
        let params = DbHelpers::record_params(&fields);
        assert_eq!(params.0, "Widget");
        assert_eq!(params.4, 5);
        assert_eq!(params.6, "archived");
    }
}

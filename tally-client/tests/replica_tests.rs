mod common;

use common::{fast_config, fields, setup_test_store};
use std::sync::Arc;
use tally_client::queries::{DbHelpers, Queries};
use tally_client::{CycleOutcome, Engine, RemoteSync, SqliteReplica};
use tally_core::config::ReplicaConfig;
use tally_core::models::{RecordId, RecordPatch};

async fn shared_replica() -> Arc<SqliteReplica> {
    Arc::new(
        SqliteReplica::connect(&ReplicaConfig::new("sqlite::memory:"))
            .await
            .unwrap(),
    )
}

async fn engine_on(replica: &Arc<SqliteReplica>) -> Engine {
    let remote: Arc<dyn RemoteSync> = replica.clone();
    Engine::new(setup_test_store().await, remote, fast_config())
        .await
        .unwrap()
}

async fn remote_names(replica: &SqliteReplica) -> Vec<String> {
    sqlx::query_scalar("SELECT name FROM records ORDER BY id")
        .fetch_all(replica.pool())
        .await
        .unwrap()
}

async fn visible_names(engine: &Engine) -> Vec<String> {
    let mut names: Vec<String> = engine
        .records()
        .await
        .into_iter()
        .map(|r| r.fields.name)
        .collect();
    names.sort();
    names
}

async fn save_new(engine: &Engine, name: &str) -> (RecordId, i64) {
    let draft = engine.create_record().await.unwrap();
    let id = engine
        .save_record(draft.id, &RecordPatch::default().name(name))
        .await
        .unwrap();
    (draft.id, id)
}

#[tokio::test]
async fn test_push_sends_saved_records() {
    let replica = shared_replica().await;
    let engine = engine_on(&replica).await;

    let draft = engine.create_record().await.unwrap();
    engine
        .save_record(draft.id, &RecordPatch::default().name("Sprockets").qty(3))
        .await
        .unwrap();

    let outcome = engine.push_to_remote().await;
    assert!(outcome.is_completed());
    assert_eq!(remote_names(&replica).await, vec!["Sprockets"]);
    assert!(engine.store().queued_operations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unsaved_records_are_never_pushed() {
    let replica = shared_replica().await;
    let engine = engine_on(&replica).await;

    let draft = engine.create_record().await.unwrap();
    engine
        .update_record(draft.id, &RecordPatch::default().name("Draft"))
        .await;

    assert!(engine.push_to_remote().await.is_completed());
    assert!(remote_names(&replica).await.is_empty());
    assert_eq!(engine.records().await.len(), 1);
}

#[tokio::test]
async fn test_deletion_reaches_replica() {
    let replica = shared_replica().await;
    let engine = engine_on(&replica).await;

    let draft = engine.create_record().await.unwrap();
    let id = engine
        .save_record(draft.id, &RecordPatch::default().name("Bearings"))
        .await
        .unwrap();
    engine.push_to_remote().await;
    assert_eq!(remote_names(&replica).await.len(), 1);

    engine.delete_record(RecordId::Permanent(id)).await.unwrap();
    assert!(engine.sync_pending_deletions().await.is_completed());
    assert!(remote_names(&replica).await.is_empty());
    assert!(!engine.has_pending_deletions().await);
}

#[tokio::test]
async fn test_pull_brings_in_rows_from_other_devices() {
    let replica = shared_replica().await;
    let first = engine_on(&replica).await;
    let second = engine_on(&replica).await;

    let draft = first.create_record().await.unwrap();
    let id = first
        .save_record(draft.id, &RecordPatch::default().name("Shared shelf"))
        .await
        .unwrap();
    assert!(first.push_to_remote().await.is_completed());

    assert!(second.pull_from_remote().await.is_completed());
    let visible = second.records().await;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, RecordId::Permanent(id));
    assert_eq!(visible[0].fields.name, "Shared shelf");
}

#[tokio::test]
async fn test_last_local_write_wins_on_push() {
    let replica = shared_replica().await;
    let engine = engine_on(&replica).await;

    let draft = engine.create_record().await.unwrap();
    let id = engine
        .save_record(draft.id, &RecordPatch::default().name("Local").qty(1))
        .await
        .unwrap();
    engine.push_to_remote().await;

    let remote_row = engine.store().get(id).await.unwrap().unwrap();
    let params = DbHelpers::record_params(&fields("Remote edit", 99));
    sqlx::query(Queries::UPSERT_RECORD)
        .bind(id)
        .bind(params.0)
        .bind(params.1)
        .bind(params.2)
        .bind(params.3)
        .bind(params.4)
        .bind(params.5)
        .bind(params.6)
        .bind(DbHelpers::timestamp(&remote_row.created_at))
        .bind(DbHelpers::timestamp(&remote_row.updated_at))
        .execute(replica.pool())
        .await
        .unwrap();

    engine
        .save_record(RecordId::Permanent(id), &RecordPatch::default().qty(2))
        .await
        .unwrap();
    assert!(engine.pull_from_remote().await.is_completed());

    let visible = engine.records().await;
    assert_eq!(visible[0].fields.name, "Local");
    assert_eq!(visible[0].fields.qty, 2);
    assert_eq!(remote_names(&replica).await, vec!["Local"]);
}

#[tokio::test]
async fn test_records_created_offline_on_two_devices_both_survive() {
    let replica = shared_replica().await;
    let first = engine_on(&replica).await;
    let second = engine_on(&replica).await;

    let (_, bolts) = save_new(&first, "Bolts").await;
    let (nuts_draft, nuts) = save_new(&second, "Nuts").await;
    assert_eq!(bolts, nuts);

    assert!(first.push_to_remote().await.is_completed());
    let CycleOutcome::Completed(report) = second.push_to_remote().await else {
        panic!("second push did not complete");
    };
    assert_eq!(report.reassigned.len(), 1);
    let (old_id, moved) = report.reassigned[0];
    assert_eq!(old_id, nuts);
    assert_ne!(moved, bolts);

    assert!(first.pull_from_remote().await.is_completed());
    assert_eq!(visible_names(&first).await, vec!["Bolts", "Nuts"]);
    assert_eq!(remote_names(&replica).await, vec!["Bolts", "Nuts"]);

    // The second device keeps editing its record under the new id.
    let visible = second.records().await;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, RecordId::Permanent(moved));
    let saved = second
        .save_record(nuts_draft, &RecordPatch::default().qty(9))
        .await
        .unwrap();
    assert_eq!(saved, moved);
    assert_eq!(second.store().get(moved).await.unwrap().unwrap().fields.qty, 9);

    assert!(second.pull_from_remote().await.is_completed());
    assert_eq!(visible_names(&second).await, vec!["Bolts", "Nuts"]);
    assert_eq!(
        second.store().get(bolts).await.unwrap().unwrap().fields.name,
        "Bolts"
    );
}

#[tokio::test]
async fn test_deleting_an_unsent_record_leaves_other_devices_rows() {
    let replica = shared_replica().await;
    let first = engine_on(&replica).await;
    let second = engine_on(&replica).await;

    let (_, bolts) = save_new(&first, "Bolts").await;
    assert!(first.push_to_remote().await.is_completed());

    let (_, scrap) = save_new(&second, "Scrap").await;
    assert_eq!(scrap, bolts);
    second.delete_record(RecordId::Permanent(scrap)).await.unwrap();

    assert!(second.sync_pending_deletions().await.is_completed());
    assert_eq!(remote_names(&replica).await, vec!["Bolts"]);
    assert!(!second.has_pending_deletions().await);
}

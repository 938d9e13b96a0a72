//! End-to-end exercises of the relational store: the uniqueness invariant,
//! replace atomicity, cascade semantics, and history ordering.

use chrono::Utc;
use tempfile::NamedTempFile;

use voicegate::storage::{Database, VoiceprintStore};
use voicegate::verifier::service::point_id;

async fn file_backed_store() -> (VoiceprintStore, NamedTempFile) {
    let temp = NamedTempFile::new().unwrap();
    let db = Database::new(temp.path()).await.unwrap();
    db.migrate().await.unwrap();
    (VoiceprintStore::new(db), temp)
}

#[tokio::test]
async fn enroll_like_flow_keeps_one_active_row_per_customer() {
    let (store, _temp) = file_backed_store().await;
    let alice_point = point_id("alice") as i64;

    let first = store.replace("alice", alice_point).await.unwrap();
    assert!(first.is_active);

    // Re-enrollment replaces in place.
    let second = store.replace("alice", alice_point).await.unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(store.count_for_customer("alice").await.unwrap(), 1);

    let active = store.get_active("alice").await.unwrap().unwrap();
    assert_eq!(active.id, second.id);
    assert_eq!(active.qdrant_vector_id, alice_point);
    assert!(active.created_at >= first.created_at);
}

#[tokio::test]
async fn verify_like_flow_records_attempt_and_marks_voiceprint() {
    let (store, _temp) = file_backed_store().await;
    let record = store.replace("alice", 42).await.unwrap();

    let before = Utc::now();
    let attempt = store
        .append_attempt(record.id, 18.4, 4.7, 3.0)
        .await
        .unwrap();
    store.mark_verified(record.id, Utc::now()).await.unwrap();

    let refreshed = store.get_active("alice").await.unwrap().unwrap();
    assert!(refreshed.verification);
    let verified_at = refreshed.last_verified_at.unwrap();
    assert!((verified_at - before).num_seconds().abs() <= 1);

    // Referential integrity: the attempt points at the live voiceprint.
    let history = store.history("alice").await.unwrap().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, attempt.id);
    assert_eq!(history[0].voiceprint_id, refreshed.id);
    assert_eq!(history[0].count, 0);
}

#[tokio::test]
async fn failed_verification_leaves_verification_flag_unset() {
    let (store, _temp) = file_backed_store().await;
    let record = store.replace("alice", 42).await.unwrap();

    store.append_attempt(record.id, -3.0, 0.4, 3.0).await.unwrap();

    let refreshed = store.get_active("alice").await.unwrap().unwrap();
    assert!(!refreshed.verification);
    assert!(refreshed.last_verified_at.is_none());
    assert_eq!(store.attempt_count(record.id).await.unwrap(), 1);
}

#[tokio::test]
async fn delete_cascades_attempts_and_is_idempotent() {
    let (store, _temp) = file_backed_store().await;
    let record = store.replace("alice", 7).await.unwrap();
    store.append_attempt(record.id, 10.0, 3.5, 3.0).await.unwrap();
    store.append_attempt(record.id, 11.0, 3.6, 3.0).await.unwrap();

    assert!(store.delete("alice").await.unwrap());
    assert!(store.get_active("alice").await.unwrap().is_none());
    assert_eq!(store.attempt_count(record.id).await.unwrap(), 0);
    assert!(store.history("alice").await.unwrap().is_none());

    assert!(!store.delete("alice").await.unwrap());
}

#[tokio::test]
async fn re_enrollment_wipes_previous_history() {
    let (store, _temp) = file_backed_store().await;
    let first = store.replace("alice", 7).await.unwrap();
    store.append_attempt(first.id, 10.0, 3.5, 3.0).await.unwrap();

    let second = store.replace("alice", 7).await.unwrap();
    let history = store.history("alice").await.unwrap().unwrap();
    assert!(history.is_empty());
    assert_eq!(store.attempt_count(first.id).await.unwrap(), 0);
    assert_eq!(store.attempt_count(second.id).await.unwrap(), 0);
}

#[tokio::test]
async fn point_ids_are_stable_and_distinct_across_customers() {
    let ids: Vec<u64> = ["alice", "bob", "carol", "dave"]
        .iter()
        .map(|c| point_id(c))
        .collect();
    let mut unique = ids.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), ids.len());
    assert_eq!(point_id("alice"), ids[0]);
}

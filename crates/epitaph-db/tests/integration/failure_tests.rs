use epitaph_core::error::{FailureKind, ParseErrorKind};
use epitaph_core::models::{NewFailureRecord, compute_hash};
use epitaph_core::traits::FailureStore;
use uuid::Uuid;

use crate::common::setup_test_db;

fn failure(subject_id: i64, provider: &str, raw: &str) -> NewFailureRecord {
    NewFailureRecord {
        run_id: Uuid::new_v4(),
        subject_id,
        provider: provider.into(),
        raw_payload: raw.into(),
        payload_hash: compute_hash(raw),
        error_kind: FailureKind::Parse,
        parse_kind: Some(ParseErrorKind::InvalidJson),
        error_message: "expected value at line 1".into(),
    }
}

#[tokio::test]
async fn same_payload_is_stored_once() {
    let (db, _container) = setup_test_db().await;
    let first = db.record_failure(&failure(1, "openai", "{oops")).await.unwrap();
    let second = db.record_failure(&failure(1, "openai", "{oops")).await.unwrap();
    assert_eq!(first, second);

    db.record_failure(&failure(1, "openai", "{other")).await.unwrap();
    assert_eq!(db.unprocessed_failures(None, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn reprocessed_failures_drop_out_of_the_queue() {
    let (db, _container) = setup_test_db().await;
    let id = db.record_failure(&failure(1, "openai", "{oops")).await.unwrap();
    db.record_failure(&failure(2, "wikidata", "<html>")).await.unwrap();

    let openai = db.unprocessed_failures(Some("openai"), 10).await.unwrap();
    assert_eq!(openai.len(), 1);
    assert_eq!(openai[0].parse_kind, Some(ParseErrorKind::InvalidJson));
    assert_eq!(openai[0].error_kind, FailureKind::Parse);

    db.mark_reprocessed(id, "recovered").await.unwrap();
    let pending = db.unprocessed_failures(None, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].provider, "wikidata");

    let err = db.mark_reprocessed(Uuid::new_v4(), "x").await.unwrap_err();
    assert!(matches!(err, epitaph_core::AppError::NotFound(_)));
}

#[tokio::test]
async fn failed_replays_stay_queued_behind_fresh_rows() {
    let (db, _container) = setup_test_db().await;
    let stale = db.record_failure(&failure(1, "openai", "{oops")).await.unwrap();
    let fresh = db.record_failure(&failure(2, "openai", "{other")).await.unwrap();

    db.record_replay_attempt(stale, "expected value").await.unwrap();
    db.record_replay_attempt(stale, "expected value").await.unwrap();

    let pending = db.unprocessed_failures(None, 10).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].id, fresh);
    assert_eq!(pending[1].id, stale);
    assert_eq!(pending[1].replay_attempts, 2);
    assert_eq!(pending[1].last_replay_error.as_deref(), Some("expected value"));

    db.mark_reprocessed(stale, "recovered").await.unwrap();
    let err = db.record_replay_attempt(stale, "late").await.unwrap_err();
    assert!(matches!(err, epitaph_core::AppError::NotFound(_)));
}

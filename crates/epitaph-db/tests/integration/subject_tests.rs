use chrono::Utc;
use epitaph_core::traits::{CandidateQuery, SubjectSource};

use crate::common::{seeded_db, subject};

fn query(limit: usize) -> CandidateQuery {
    CandidateQuery {
        limit,
        ..Default::default()
    }
}

#[tokio::test]
async fn candidates_ascend_by_id_after_cursor() {
    let (db, _container) = seeded_db(5).await;

    let first: Vec<i64> = db.candidates(&query(2)).await.unwrap().iter().map(|s| s.id).collect();
    assert_eq!(first, vec![1, 2]);

    let next = CandidateQuery {
        after_id: Some(2),
        ..query(10)
    };
    let ids: Vec<i64> = db.candidates(&next).await.unwrap().iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![3, 4, 5]);
    assert_eq!(db.count_candidates(&next).await.unwrap(), 5);
}

#[tokio::test]
async fn candidates_filter_ids_and_missing_cause() {
    let (db, _container) = seeded_db(3).await;
    db.subject_repo()
        .upsert_subjects(&[subject(4, "Known Cause").with_cause_of_death("stroke")])
        .await
        .unwrap();

    let only_missing = CandidateQuery {
        only_missing: true,
        ..query(10)
    };
    assert_eq!(db.count_candidates(&only_missing).await.unwrap(), 3);

    let picked = CandidateQuery {
        subject_ids: Some(vec![2, 4]),
        ..query(10)
    };
    let ids: Vec<i64> = db.candidates(&picked).await.unwrap().iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![2, 4]);
}

#[tokio::test]
async fn failure_bookkeeping_accumulates_and_resets() {
    let (db, _container) = seeded_db(2).await;
    let now = Utc::now();

    db.record_subject_failure(1, now, false).await.unwrap();
    db.record_subject_failure(1, now, true).await.unwrap();
    let subject = db.get_subject(1).await.unwrap().unwrap();
    assert_eq!(subject.enrichment_attempts, 2);
    assert!(subject.enrichment_permanently_failed);
    assert!(subject.last_enrichment_attempt.is_some());

    assert_eq!(db.reset_subject_failures(None).await.unwrap(), 1);
    let subject = db.get_subject(1).await.unwrap().unwrap();
    assert_eq!(subject.enrichment_attempts, 0);
    assert!(!subject.enrichment_permanently_failed);
}

#[tokio::test]
async fn failure_on_unknown_subject_is_not_found() {
    let (db, _container) = seeded_db(1).await;
    let err = db.record_subject_failure(99, Utc::now(), false).await.unwrap_err();
    assert!(matches!(err, epitaph_core::AppError::NotFound(_)));
    assert!(db.get_subject(99).await.unwrap().is_none());
}

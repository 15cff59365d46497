use epitaph_core::models::ClaimField;
use epitaph_core::provenance::{EnrichmentRecord, FieldWrite, SubjectUpdate};
use epitaph_core::traits::{EnrichmentWriter, SubjectSource};
use uuid::Uuid;

use crate::common::{seeded_db, subject};

fn write(field: ClaimField, value: &str, source: &str) -> FieldWrite {
    FieldWrite {
        field,
        value: value.into(),
        source: source.into(),
        confidence: 0.9,
    }
}

fn update(subject_id: i64, run_id: Uuid) -> SubjectUpdate {
    SubjectUpdate {
        subject_id,
        run_id,
        primary: vec![
            write(ClaimField::CauseOfDeath, "pancreatic cancer", "apnews"),
            write(ClaimField::DeathLocation, "Malibu, California", "wikipedia"),
        ],
        record: EnrichmentRecord {
            subject_id,
            circumstances: Some("Died at home surrounded by family".into()),
            notable_factors: vec!["long illness".into()],
            citations: vec!["https://apnews.com/article/x".into()],
            overall_confidence: Some(0.85),
            run_id: Some(run_id),
            ..Default::default()
        },
    }
}

#[tokio::test]
async fn apply_fills_empty_fields_with_history() {
    let (db, _container) = seeded_db(1).await;
    let run_id = Uuid::new_v4();

    let summary = db.apply(&update(1, run_id)).await.unwrap();
    assert_eq!(
        summary.fields_written,
        vec![ClaimField::CauseOfDeath, ClaimField::DeathLocation]
    );
    assert!(summary.record_upserted);
    assert_eq!(summary.history_rows, 3);

    let subject = db.get_subject(1).await.unwrap().unwrap();
    assert_eq!(subject.cause_of_death.as_deref(), Some("pancreatic cancer"));
    assert_eq!(subject.death_location.as_deref(), Some("Malibu, California"));

    let history = db.history(1).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].field, "cause_of_death");
    assert_eq!(history[0].old_value, None);
    assert_eq!(history[0].source, "apnews");
    assert!(history.iter().all(|h| h.run_id == run_id));

    let record = db.enrichment_repo().get_record(1).await.unwrap().unwrap();
    assert_eq!(record.notable_factors, vec!["long illness"]);
    assert_eq!(record.overall_confidence, Some(0.85));
}

#[tokio::test]
async fn apply_never_overwrites_known_values() {
    let (db, _container) = seeded_db(0).await;
    db.subject_repo()
        .upsert_subjects(&[subject(7, "Known").with_cause_of_death("stroke")])
        .await
        .unwrap();

    let summary = db.apply(&update(7, Uuid::new_v4())).await.unwrap();
    assert_eq!(summary.fields_skipped, vec![ClaimField::CauseOfDeath]);
    assert_eq!(summary.fields_written, vec![ClaimField::DeathLocation]);

    let subject = db.get_subject(7).await.unwrap().unwrap();
    assert_eq!(subject.cause_of_death.as_deref(), Some("stroke"));
    assert!(
        db.history(7)
            .await
            .unwrap()
            .iter()
            .all(|h| h.field != "cause_of_death")
    );
}

#[tokio::test]
async fn reapplying_the_same_update_adds_no_history() {
    let (db, _container) = seeded_db(1).await;
    let run_id = Uuid::new_v4();
    db.apply(&update(1, run_id)).await.unwrap();

    let again = db.apply(&update(1, run_id)).await.unwrap();
    assert!(again.fields_written.is_empty());
    assert_eq!(again.history_rows, 0);
    assert!(!again.updated());
    assert_eq!(db.history(1).await.unwrap().len(), 3);
}

#[tokio::test]
async fn satellite_merge_keeps_stored_lists() {
    let (db, _container) = seeded_db(1).await;
    db.apply(&update(1, Uuid::new_v4())).await.unwrap();

    let later = SubjectUpdate {
        subject_id: 1,
        run_id: Uuid::new_v4(),
        primary: vec![],
        record: EnrichmentRecord {
            subject_id: 1,
            career_status_at_death: Some("semi-retired".into()),
            ..Default::default()
        },
    };
    let summary = db.apply(&later).await.unwrap();
    assert!(summary.record_upserted);
    assert_eq!(summary.history_rows, 1);

    let record = db.enrichment_repo().get_record(1).await.unwrap().unwrap();
    assert_eq!(record.career_status_at_death.as_deref(), Some("semi-retired"));
    assert_eq!(record.notable_factors, vec!["long illness"]);
    assert_eq!(
        record.circumstances.as_deref(),
        Some("Died at home surrounded by family")
    );
}

#[tokio::test]
async fn apply_to_missing_subject_is_not_found() {
    let (db, _container) = seeded_db(0).await;
    let err = db.apply(&update(42, Uuid::new_v4())).await.unwrap_err();
    assert!(matches!(err, epitaph_core::AppError::NotFound(_)));
}

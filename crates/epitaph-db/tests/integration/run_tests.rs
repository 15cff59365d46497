use chrono::Utc;
use epitaph_core::run::{EnrichmentRun, RunStatus};
use epitaph_core::traits::RunLedger;
use uuid::Uuid;

use crate::common::setup_test_db;

#[tokio::test]
async fn run_lifecycle_is_persisted() {
    let (db, _container) = setup_test_db().await;
    let mut run = EnrichmentRun::new(
        Uuid::new_v4(),
        "death_details",
        serde_json::json!({"limit": 10}),
    );
    db.create_run(&run).await.unwrap();

    run.status = RunStatus::CircuitBroken;
    run.counters.processed = 4;
    run.counters.failed = 3;
    run.accumulated_cost = 0.03;
    run.current_subject = Some(17);
    run.exit_reason = Some("circuit breaker".into());
    run.finished_at = Some(Utc::now());
    db.update_run(&run).await.unwrap();

    let loaded = db.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, RunStatus::CircuitBroken);
    assert_eq!(loaded.counters.failed, 3);
    assert_eq!(loaded.current_subject, Some(17));
    assert_eq!(loaded.config["limit"], 10);
}

#[tokio::test]
async fn duplicate_run_conflicts_and_unknown_update_fails() {
    let (db, _container) = setup_test_db().await;
    let run = EnrichmentRun::new(Uuid::new_v4(), "death_details", serde_json::json!({}));
    db.create_run(&run).await.unwrap();
    assert!(matches!(
        db.create_run(&run).await.unwrap_err(),
        epitaph_core::AppError::Conflict(_)
    ));

    let ghost = EnrichmentRun::new(Uuid::new_v4(), "death_details", serde_json::json!({}));
    assert!(matches!(
        db.update_run(&ghost).await.unwrap_err(),
        epitaph_core::AppError::NotFound(_)
    ));
}

#[tokio::test]
async fn list_runs_newest_first() {
    let (db, _container) = setup_test_db().await;
    let mut older = EnrichmentRun::new(Uuid::new_v4(), "death_details", serde_json::json!({}));
    older.started_at = Utc::now() - chrono::TimeDelta::minutes(5);
    let newer = EnrichmentRun::new(Uuid::new_v4(), "death_details", serde_json::json!({}));
    db.create_run(&older).await.unwrap();
    db.create_run(&newer).await.unwrap();

    let runs = db.list_runs(10).await.unwrap();
    assert_eq!(runs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![newer.id, older.id]);
    assert_eq!(db.list_runs(1).await.unwrap().len(), 1);
}

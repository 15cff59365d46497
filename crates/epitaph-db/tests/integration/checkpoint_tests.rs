use epitaph_core::checkpoint::Checkpoint;
use epitaph_core::traits::CheckpointStore;
use uuid::Uuid;

use crate::common::setup_test_db;

#[tokio::test]
async fn checkpoint_upsert_roundtrip() {
    let (db, _container) = setup_test_db().await;
    assert!(db.load_checkpoint("death_details").await.unwrap().is_none());

    let mut checkpoint = Checkpoint::new("death_details", Uuid::new_v4());
    checkpoint.mark_processed(3);
    checkpoint.mark_processed(1);
    checkpoint.set_cursor(3);
    checkpoint.add_cost(0.125);
    checkpoint.counters.processed = 2;
    db.save_checkpoint(&checkpoint).await.unwrap();

    checkpoint.mark_processed(5);
    checkpoint.counters.processed = 3;
    db.save_checkpoint(&checkpoint).await.unwrap();

    let loaded = db.load_checkpoint("death_details").await.unwrap().unwrap();
    assert_eq!(loaded.processed_ids.iter().copied().collect::<Vec<_>>(), vec![1, 3, 5]);
    assert_eq!(loaded.last_processed_id, Some(5));
    assert_eq!(loaded.cursor(), Some(3));
    assert_eq!(loaded.counters.processed, 3);
    assert!((loaded.accumulated_cost - 0.125).abs() < 1e-9);
    assert_eq!(loaded.run_id, checkpoint.run_id);
}

#[tokio::test]
async fn clear_checkpoint_reports_existence() {
    let (db, _container) = setup_test_db().await;
    let checkpoint = Checkpoint::new("death_details", Uuid::new_v4());
    db.save_checkpoint(&checkpoint).await.unwrap();

    assert!(db.clear_checkpoint("death_details").await.unwrap());
    assert!(!db.clear_checkpoint("death_details").await.unwrap());
    assert!(db.load_checkpoint("death_details").await.unwrap().is_none());
}

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use epitaph_core::checkpoint::Checkpoint;
use epitaph_core::error::AppError;
use epitaph_core::run::RunCounters;
use epitaph_core::traits::CheckpointStore;

/// One checkpoint row per run type.
#[derive(Clone)]
pub struct CheckpointRepository {
    pool: Pool<Postgres>,
}

impl CheckpointRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    run_type: String,
    run_id: Uuid,
    processed_ids: Vec<i64>,
    last_processed_id: Option<i64>,
    counters: Json<RunCounters>,
    accumulated_cost: f64,
    resume_token: Option<String>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<CheckpointRow> for Checkpoint {
    fn from(row: CheckpointRow) -> Self {
        Checkpoint {
            run_type: row.run_type,
            run_id: row.run_id,
            processed_ids: row.processed_ids.into_iter().collect(),
            last_processed_id: row.last_processed_id,
            counters: row.counters.0,
            accumulated_cost: row.accumulated_cost,
            resume_token: row.resume_token,
            started_at: row.started_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        }
    }
}

impl CheckpointStore for CheckpointRepository {
    async fn load_checkpoint(&self, run_type: &str) -> Result<Option<Checkpoint>, AppError> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"SELECT * FROM enrichment_checkpoints WHERE run_type = $1"#,
        )
        .bind(run_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), AppError> {
        let processed: Vec<i64> = checkpoint.processed_ids.iter().copied().collect();
        sqlx::query(
            r#"
            INSERT INTO enrichment_checkpoints (
                run_type, run_id, processed_ids, last_processed_id, counters,
                accumulated_cost, resume_token, started_at, updated_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (run_type) DO UPDATE SET
                run_id = EXCLUDED.run_id,
                processed_ids = EXCLUDED.processed_ids,
                last_processed_id = EXCLUDED.last_processed_id,
                counters = EXCLUDED.counters,
                accumulated_cost = EXCLUDED.accumulated_cost,
                resume_token = EXCLUDED.resume_token,
                started_at = EXCLUDED.started_at,
                updated_at = EXCLUDED.updated_at,
                completed_at = EXCLUDED.completed_at
            "#,
        )
        .bind(&checkpoint.run_type)
        .bind(checkpoint.run_id)
        .bind(&processed)
        .bind(checkpoint.last_processed_id)
        .bind(Json(checkpoint.counters))
        .bind(checkpoint.accumulated_cost)
        .bind(&checkpoint.resume_token)
        .bind(checkpoint.started_at)
        .bind(checkpoint.updated_at)
        .bind(checkpoint.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    async fn clear_checkpoint(&self, run_type: &str) -> Result<bool, AppError> {
        let result = sqlx::query(r#"DELETE FROM enrichment_checkpoints WHERE run_type = $1"#)
            .bind(run_type)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

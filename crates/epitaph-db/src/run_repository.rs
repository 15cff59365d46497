use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use epitaph_core::error::AppError;
use epitaph_core::run::{EnrichmentRun, RunCounters, RunStatus};
use epitaph_core::traits::RunLedger;

/// Persisted run rows backing progress queries after a restart.
#[derive(Clone)]
pub struct RunRepository {
    pool: Pool<Postgres>,
}

impl RunRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    run_type: String,
    status: String,
    config: serde_json::Value,
    counters: Json<RunCounters>,
    accumulated_cost: f64,
    current_subject: Option<i64>,
    exit_reason: Option<String>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl From<RunRow> for EnrichmentRun {
    fn from(row: RunRow) -> Self {
        EnrichmentRun {
            id: row.id,
            run_type: row.run_type,
            status: row.status.parse().unwrap_or(RunStatus::Failed),
            config: row.config,
            counters: row.counters.0,
            accumulated_cost: row.accumulated_cost,
            current_subject: row.current_subject,
            exit_reason: row.exit_reason,
            started_at: row.started_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        }
    }
}

impl RunLedger for RunRepository {
    async fn create_run(&self, run: &EnrichmentRun) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO enrichment_runs (id, run_type, status, config, counters, accumulated_cost,
                                         current_subject, exit_reason, started_at, updated_at,
                                         finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(run.id)
        .bind(&run.run_type)
        .bind(run.status.as_str())
        .bind(&run.config)
        .bind(Json(run.counters))
        .bind(run.accumulated_cost)
        .bind(run.current_subject)
        .bind(&run.exit_reason)
        .bind(run.started_at)
        .bind(run.updated_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                AppError::Conflict(format!("run {} already exists", run.id))
            }
            other => AppError::DatabaseError(other.to_string()),
        })?;

        Ok(())
    }

    async fn update_run(&self, run: &EnrichmentRun) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE enrichment_runs
            SET status = $2, counters = $3, accumulated_cost = $4, current_subject = $5,
                exit_reason = $6, updated_at = $7, finished_at = $8
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(Json(run.counters))
        .bind(run.accumulated_cost)
        .bind(run.current_subject)
        .bind(&run.exit_reason)
        .bind(run.updated_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("run {}", run.id)));
        }
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<EnrichmentRun>, AppError> {
        let row = sqlx::query_as::<_, RunRow>(r#"SELECT * FROM enrichment_runs WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<EnrichmentRun>, AppError> {
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT * FROM enrichment_runs
            ORDER BY started_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

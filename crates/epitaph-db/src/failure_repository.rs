use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use epitaph_core::error::{AppError, FailureKind};
use epitaph_core::models::{FailureRecord, NewFailureRecord};
use epitaph_core::traits::FailureStore;

/// Raw provider payloads awaiting replay. The same payload for the same
/// subject and provider is stored once.
#[derive(Clone)]
pub struct FailureRepository {
    pool: Pool<Postgres>,
}

impl FailureRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct FailureRow {
    id: Uuid,
    run_id: Uuid,
    subject_id: i64,
    provider: String,
    raw_payload: String,
    payload_hash: String,
    error_kind: String,
    parse_kind: Option<String>,
    error_message: String,
    created_at: DateTime<Utc>,
    reprocessed_at: Option<DateTime<Utc>>,
    reprocess_result: Option<String>,
    replay_attempts: i32,
    last_replay_error: Option<String>,
}

impl From<FailureRow> for FailureRecord {
    fn from(row: FailureRow) -> Self {
        FailureRecord {
            id: row.id,
            run_id: row.run_id,
            subject_id: row.subject_id,
            provider: row.provider,
            raw_payload: row.raw_payload,
            payload_hash: row.payload_hash,
            error_kind: row.error_kind.parse().unwrap_or(FailureKind::Parse),
            parse_kind: row.parse_kind.and_then(|k| k.parse().ok()),
            error_message: row.error_message,
            created_at: row.created_at,
            reprocessed_at: row.reprocessed_at,
            reprocess_result: row.reprocess_result,
            replay_attempts: u32::try_from(row.replay_attempts).unwrap_or(0),
            last_replay_error: row.last_replay_error,
        }
    }
}

impl FailureStore for FailureRepository {
    async fn record_failure(&self, failure: &NewFailureRecord) -> Result<Uuid, AppError> {
        // The no-op update makes RETURNING yield the existing id on conflict.
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO provider_failures (run_id, subject_id, provider, raw_payload, payload_hash,
                                           error_kind, parse_kind, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (subject_id, provider, payload_hash)
            DO UPDATE SET provider = EXCLUDED.provider
            RETURNING id
            "#,
        )
        .bind(failure.run_id)
        .bind(failure.subject_id)
        .bind(&failure.provider)
        .bind(&failure.raw_payload)
        .bind(&failure.payload_hash)
        .bind(failure.error_kind.as_str())
        .bind(failure.parse_kind.map(|k| k.as_str()))
        .bind(&failure.error_message)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(id)
    }

    async fn unprocessed_failures(
        &self,
        provider: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FailureRecord>, AppError> {
        let rows = sqlx::query_as::<_, FailureRow>(
            r#"
            SELECT * FROM provider_failures
            WHERE reprocessed_at IS NULL
              AND ($1::VARCHAR IS NULL OR provider = $1)
            ORDER BY replay_attempts ASC, created_at ASC
            LIMIT $2
            "#,
        )
        .bind(provider)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mark_reprocessed(&self, id: Uuid, result: &str) -> Result<(), AppError> {
        let outcome = sqlx::query(
            r#"
            UPDATE provider_failures
            SET reprocessed_at = NOW(), reprocess_result = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(result)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if outcome.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("failure {id}")));
        }
        Ok(())
    }

    async fn record_replay_attempt(&self, id: Uuid, error: &str) -> Result<(), AppError> {
        let outcome = sqlx::query(
            r#"
            UPDATE provider_failures
            SET replay_attempts = replay_attempts + 1, last_replay_error = $2
            WHERE id = $1 AND reprocessed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if outcome.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("failure {id}")));
        }
        Ok(())
    }
}

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Pool, Postgres};

use epitaph_core::error::AppError;
use epitaph_core::models::Subject;
use epitaph_core::traits::{CandidateQuery, SubjectSource};

/// Repository over the subject catalog.
#[derive(Clone)]
pub struct SubjectRepository {
    pool: Pool<Postgres>,
}

impl SubjectRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert subjects, refreshing name and dates of existing ids. Death facts
    /// already on file are left alone.
    pub async fn upsert_subjects(&self, subjects: &[Subject]) -> Result<u64, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        let mut written = 0;
        for subject in subjects {
            let result = sqlx::query(
                r#"
                INSERT INTO subjects (id, name, birthday, deathday, cause_of_death,
                                      cause_of_death_details, death_location)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO UPDATE
                SET name = EXCLUDED.name, birthday = EXCLUDED.birthday, deathday = EXCLUDED.deathday
                "#,
            )
            .bind(subject.id)
            .bind(&subject.name)
            .bind(subject.birthday)
            .bind(subject.deathday)
            .bind(&subject.cause_of_death)
            .bind(&subject.cause_of_death_details)
            .bind(&subject.death_location)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
            written += result.rows_affected();
        }
        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(written)
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
pub(crate) struct SubjectRow {
    id: i64,
    name: String,
    birthday: Option<NaiveDate>,
    deathday: Option<NaiveDate>,
    cause_of_death: Option<String>,
    cause_of_death_details: Option<String>,
    death_location: Option<String>,
    enrichment_attempts: i32,
    last_enrichment_attempt: Option<DateTime<Utc>>,
    enrichment_permanently_failed: bool,
}

impl From<SubjectRow> for Subject {
    fn from(row: SubjectRow) -> Self {
        Subject {
            id: row.id,
            name: row.name,
            birthday: row.birthday,
            deathday: row.deathday,
            cause_of_death: row.cause_of_death,
            cause_of_death_details: row.cause_of_death_details,
            death_location: row.death_location,
            enrichment_attempts: row.enrichment_attempts.max(0) as u32,
            last_enrichment_attempt: row.last_enrichment_attempt,
            enrichment_permanently_failed: row.enrichment_permanently_failed,
        }
    }
}

const SUBJECT_COLUMNS: &str = "id, name, birthday, deathday, cause_of_death, \
    cause_of_death_details, death_location, enrichment_attempts, last_enrichment_attempt, \
    enrichment_permanently_failed";

/// `$1` ids filter, `$2` only missing cause.
const CANDIDATE_FILTER: &str = "($1::BIGINT[] IS NULL OR id = ANY($1)) \
    AND (NOT $2 OR cause_of_death IS NULL OR btrim(cause_of_death) = '')";

impl SubjectSource for SubjectRepository {
    async fn candidates(&self, query: &CandidateQuery) -> Result<Vec<Subject>, AppError> {
        let sql = format!(
            "SELECT {SUBJECT_COLUMNS} FROM subjects \
             WHERE {CANDIDATE_FILTER} AND ($3::BIGINT IS NULL OR id > $3) \
             ORDER BY id ASC LIMIT $4"
        );
        let rows = sqlx::query_as::<_, SubjectRow>(&sql)
            .bind(query.subject_ids.as_deref())
            .bind(query.only_missing)
            .bind(query.after_id)
            .bind(query.limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count_candidates(&self, query: &CandidateQuery) -> Result<u64, AppError> {
        let sql = format!("SELECT COUNT(*) FROM subjects WHERE {CANDIDATE_FILTER}");
        let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(query.subject_ids.as_deref())
            .bind(query.only_missing)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(count.max(0) as u64)
    }

    async fn get_subject(&self, id: i64) -> Result<Option<Subject>, AppError> {
        let sql = format!("SELECT {SUBJECT_COLUMNS} FROM subjects WHERE id = $1");
        let row = sqlx::query_as::<_, SubjectRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn record_subject_failure(
        &self,
        id: i64,
        attempted_at: DateTime<Utc>,
        permanently_failed: bool,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE subjects
            SET enrichment_attempts = enrichment_attempts + 1,
                last_enrichment_attempt = $2,
                enrichment_permanently_failed = enrichment_permanently_failed OR $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempted_at)
        .bind(permanently_failed)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("subject {id}")));
        }
        Ok(())
    }

    async fn reset_subject_failures(&self, ids: Option<&[i64]>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE subjects
            SET enrichment_attempts = 0,
                last_enrichment_attempt = NULL,
                enrichment_permanently_failed = FALSE
            WHERE ($1::BIGINT[] IS NULL OR id = ANY($1))
              AND (enrichment_attempts > 0 OR enrichment_permanently_failed)
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

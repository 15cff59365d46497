use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres, Transaction};
use uuid::Uuid;

use epitaph_core::error::AppError;
use epitaph_core::models::{ClaimField, HistoryEntry, Project, RelatedPerson, SourceEntry};
use epitaph_core::provenance::{
    EnrichmentRecord, SATELLITE_SOURCE, SubjectUpdate, WriteSummary, narrative_changes,
};
use epitaph_core::traits::EnrichmentWriter;

/// Writes merged claims with provenance: primary fields fill-if-empty on the
/// subject row, the satellite record upserted, one history row per change.
#[derive(Clone)]
pub struct EnrichmentRepository {
    pool: Pool<Postgres>,
}

impl EnrichmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_record(&self, subject_id: i64) -> Result<Option<EnrichmentRecord>, AppError> {
        let row = sqlx::query_as::<_, RecordRow>(RECORD_SELECT)
            .bind(subject_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }
}

fn column_for(field: ClaimField) -> Option<&'static str> {
    match field {
        ClaimField::CauseOfDeath => Some("cause_of_death"),
        ClaimField::CauseOfDeathDetails => Some("cause_of_death_details"),
        ClaimField::DeathLocation => Some("death_location"),
        _ => None,
    }
}

#[derive(sqlx::FromRow)]
struct PrimaryRow {
    cause_of_death: Option<String>,
    cause_of_death_details: Option<String>,
    death_location: Option<String>,
}

impl PrimaryRow {
    fn value(&self, field: ClaimField) -> Option<&str> {
        match field {
            ClaimField::CauseOfDeath => self.cause_of_death.as_deref(),
            ClaimField::CauseOfDeathDetails => self.cause_of_death_details.as_deref(),
            ClaimField::DeathLocation => self.death_location.as_deref(),
            _ => None,
        }
    }

    /// Blank strings count as empty.
    fn known(&self, field: ClaimField) -> Option<&str> {
        self.value(field).filter(|v| !v.trim().is_empty())
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    subject_id: i64,
    circumstances: Option<String>,
    rumored_circumstances: Option<String>,
    notable_factors: Json<Vec<String>>,
    related_people: Json<Vec<RelatedPerson>>,
    career_status_at_death: Option<String>,
    last_project: Option<Json<Project>>,
    posthumous_releases: Json<Vec<Project>>,
    citations: Json<Vec<String>>,
    sources: Json<Vec<SourceEntry>>,
    raw_payloads: Json<BTreeMap<String, serde_json::Value>>,
    overall_confidence: Option<f64>,
    run_id: Option<Uuid>,
}

impl From<RecordRow> for EnrichmentRecord {
    fn from(row: RecordRow) -> Self {
        EnrichmentRecord {
            subject_id: row.subject_id,
            circumstances: row.circumstances,
            rumored_circumstances: row.rumored_circumstances,
            notable_factors: row.notable_factors.0,
            related_people: row.related_people.0,
            career_status_at_death: row.career_status_at_death,
            last_project: row.last_project.map(|p| p.0),
            posthumous_releases: row.posthumous_releases.0,
            citations: row.citations.0,
            sources: row.sources.0,
            raw_payloads: row.raw_payloads.0,
            overall_confidence: row.overall_confidence,
            run_id: row.run_id,
        }
    }
}

const RECORD_SELECT: &str = r#"
    SELECT subject_id, circumstances, rumored_circumstances, notable_factors, related_people,
           career_status_at_death, last_project, posthumous_releases, citations, sources,
           raw_payloads, overall_confidence, run_id
    FROM death_circumstances
    WHERE subject_id = $1
"#;

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: i64,
    subject_id: i64,
    field: String,
    old_value: Option<String>,
    new_value: Option<String>,
    source: String,
    run_id: Uuid,
    created_at: DateTime<Utc>,
}

impl From<HistoryRow> for HistoryEntry {
    fn from(row: HistoryRow) -> Self {
        HistoryEntry {
            id: row.id,
            subject_id: row.subject_id,
            field: row.field,
            old_value: row.old_value,
            new_value: row.new_value,
            source: row.source,
            run_id: row.run_id,
            created_at: row.created_at,
        }
    }
}

async fn insert_history(
    tx: &mut Transaction<'_, Postgres>,
    subject_id: i64,
    field: ClaimField,
    old_value: Option<&str>,
    new_value: Option<&str>,
    source: &str,
    run_id: Uuid,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO field_history (subject_id, field, old_value, new_value, source, run_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(subject_id)
    .bind(field.as_str())
    .bind(old_value)
    .bind(new_value)
    .bind(source)
    .bind(run_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| AppError::DatabaseError(e.to_string()))?;
    Ok(())
}

async fn upsert_record(
    tx: &mut Transaction<'_, Postgres>,
    record: &EnrichmentRecord,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO death_circumstances (
            subject_id, circumstances, rumored_circumstances, notable_factors, related_people,
            career_status_at_death, last_project, posthumous_releases, citations, sources,
            raw_payloads, overall_confidence, run_id, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
        ON CONFLICT (subject_id) DO UPDATE SET
            circumstances = EXCLUDED.circumstances,
            rumored_circumstances = EXCLUDED.rumored_circumstances,
            notable_factors = EXCLUDED.notable_factors,
            related_people = EXCLUDED.related_people,
            career_status_at_death = EXCLUDED.career_status_at_death,
            last_project = EXCLUDED.last_project,
            posthumous_releases = EXCLUDED.posthumous_releases,
            citations = EXCLUDED.citations,
            sources = EXCLUDED.sources,
            raw_payloads = EXCLUDED.raw_payloads,
            overall_confidence = EXCLUDED.overall_confidence,
            run_id = EXCLUDED.run_id,
            updated_at = NOW()
        "#,
    )
    .bind(record.subject_id)
    .bind(&record.circumstances)
    .bind(&record.rumored_circumstances)
    .bind(Json(&record.notable_factors))
    .bind(Json(&record.related_people))
    .bind(&record.career_status_at_death)
    .bind(record.last_project.as_ref().map(Json))
    .bind(Json(&record.posthumous_releases))
    .bind(Json(&record.citations))
    .bind(Json(&record.sources))
    .bind(Json(&record.raw_payloads))
    .bind(record.overall_confidence)
    .bind(record.run_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| AppError::DatabaseError(e.to_string()))?;
    Ok(())
}

impl EnrichmentWriter for EnrichmentRepository {
    async fn apply(&self, update: &SubjectUpdate) -> Result<WriteSummary, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        // Row lock: concurrent writers see each other's fills.
        let current = sqlx::query_as::<_, PrimaryRow>(
            r#"
            SELECT cause_of_death, cause_of_death_details, death_location
            FROM subjects WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(update.subject_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?
        .ok_or_else(|| AppError::NotFound(format!("subject {}", update.subject_id)))?;

        let mut summary = WriteSummary::default();

        for write in &update.primary {
            let Some(column) = column_for(write.field) else {
                continue;
            };
            if current.known(write.field).is_some() {
                summary.fields_skipped.push(write.field);
                continue;
            }
            sqlx::query(&format!("UPDATE subjects SET {column} = $2 WHERE id = $1"))
                .bind(update.subject_id)
                .bind(&write.value)
                .execute(&mut *tx)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;
            insert_history(
                &mut tx,
                update.subject_id,
                write.field,
                current.value(write.field),
                Some(&write.value),
                &write.source,
                update.run_id,
            )
            .await?;
            summary.fields_written.push(write.field);
            summary.history_rows += 1;
        }

        if update.record.has_content() {
            let previous: Option<EnrichmentRecord> =
                sqlx::query_as::<_, RecordRow>(&format!("{RECORD_SELECT} FOR UPDATE"))
                    .bind(update.subject_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| AppError::DatabaseError(e.to_string()))?
                    .map(Into::into);
            let merged = update.record.merged_onto(previous.as_ref());

            for (field, old, new) in narrative_changes(previous.as_ref(), &merged) {
                insert_history(
                    &mut tx,
                    update.subject_id,
                    field,
                    old.as_deref(),
                    new.as_deref(),
                    SATELLITE_SOURCE,
                    update.run_id,
                )
                .await?;
                summary.history_rows += 1;
            }
            if previous.as_ref() != Some(&merged) {
                upsert_record(&mut tx, &merged).await?;
                summary.record_upserted = true;
            }
        }

        if summary.updated() {
            sqlx::query(
                r#"
                UPDATE subjects
                SET enriched_at = NOW(),
                    enrichment_attempts = 0,
                    last_enrichment_attempt = NULL,
                    enrichment_permanently_failed = FALSE
                WHERE id = $1
                "#,
            )
            .bind(update.subject_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tracing::debug!(
            subject_id = update.subject_id,
            written = summary.fields_written.len(),
            skipped = summary.fields_skipped.len(),
            record_upserted = summary.record_upserted,
            "Enrichment applied"
        );
        Ok(summary)
    }

    async fn history(&self, subject_id: i64) -> Result<Vec<HistoryEntry>, AppError> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT id, subject_id, field, old_value, new_value, source, run_id, created_at
            FROM field_history
            WHERE subject_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use epitaph_core::AppError;
use epitaph_core::checkpoint::Checkpoint;
use epitaph_core::models::{FailureRecord, HistoryEntry, NewFailureRecord, Subject};
use epitaph_core::provenance::{SubjectUpdate, WriteSummary};
use epitaph_core::run::EnrichmentRun;
use epitaph_core::traits::{
    CandidateQuery, CheckpointStore, EnrichmentWriter, FailureStore, RunLedger, SubjectSource,
};

use crate::checkpoint_repository::CheckpointRepository;
use crate::config::DatabaseConfig;
use crate::enrichment_repository::EnrichmentRepository;
use crate::failure_repository::FailureRepository;
use crate::run_repository::RunRepository;
use crate::subject_repository::SubjectRepository;

/// Central database facade. Owns the connection pool, runs migrations,
/// vends repositories, and implements every storage trait the batch
/// controller needs by delegating to them.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    subjects: SubjectRepository,
    enrichment: EnrichmentRepository,
    checkpoints: CheckpointRepository,
    failures: FailureRepository,
    runs: RunRepository,
}

impl Database {
    /// Connect to PostgreSQL with the given configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        tracing::debug!(max_connections = config.max_connections, "Database pool ready");
        Ok(Self::from_pool(pool))
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            subjects: SubjectRepository::new(pool.clone()),
            enrichment: EnrichmentRepository::new(pool.clone()),
            checkpoints: CheckpointRepository::new(pool.clone()),
            failures: FailureRepository::new(pool.clone()),
            runs: RunRepository::new(pool.clone()),
            pool,
        }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    pub fn subject_repo(&self) -> &SubjectRepository {
        &self.subjects
    }

    pub fn enrichment_repo(&self) -> &EnrichmentRepository {
        &self.enrichment
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl SubjectSource for Database {
    async fn candidates(&self, query: &CandidateQuery) -> Result<Vec<Subject>, AppError> {
        self.subjects.candidates(query).await
    }

    async fn count_candidates(&self, query: &CandidateQuery) -> Result<u64, AppError> {
        self.subjects.count_candidates(query).await
    }

    async fn get_subject(&self, id: i64) -> Result<Option<Subject>, AppError> {
        self.subjects.get_subject(id).await
    }

    async fn record_subject_failure(
        &self,
        id: i64,
        attempted_at: DateTime<Utc>,
        permanently_failed: bool,
    ) -> Result<(), AppError> {
        self.subjects
            .record_subject_failure(id, attempted_at, permanently_failed)
            .await
    }

    async fn reset_subject_failures(&self, ids: Option<&[i64]>) -> Result<u64, AppError> {
        self.subjects.reset_subject_failures(ids).await
    }
}

impl EnrichmentWriter for Database {
    async fn apply(&self, update: &SubjectUpdate) -> Result<WriteSummary, AppError> {
        self.enrichment.apply(update).await
    }

    async fn history(&self, subject_id: i64) -> Result<Vec<HistoryEntry>, AppError> {
        self.enrichment.history(subject_id).await
    }
}

impl CheckpointStore for Database {
    async fn load_checkpoint(&self, run_type: &str) -> Result<Option<Checkpoint>, AppError> {
        self.checkpoints.load_checkpoint(run_type).await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), AppError> {
        self.checkpoints.save_checkpoint(checkpoint).await
    }

    async fn clear_checkpoint(&self, run_type: &str) -> Result<bool, AppError> {
        self.checkpoints.clear_checkpoint(run_type).await
    }
}

impl FailureStore for Database {
    async fn record_failure(&self, failure: &NewFailureRecord) -> Result<Uuid, AppError> {
        self.failures.record_failure(failure).await
    }

    async fn unprocessed_failures(
        &self,
        provider: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FailureRecord>, AppError> {
        self.failures.unprocessed_failures(provider, limit).await
    }

    async fn mark_reprocessed(&self, id: Uuid, result: &str) -> Result<(), AppError> {
        self.failures.mark_reprocessed(id, result).await
    }

    async fn record_replay_attempt(&self, id: Uuid, error: &str) -> Result<(), AppError> {
        self.failures.record_replay_attempt(id, error).await
    }
}

impl RunLedger for Database {
    async fn create_run(&self, run: &EnrichmentRun) -> Result<(), AppError> {
        self.runs.create_run(run).await
    }

    async fn update_run(&self, run: &EnrichmentRun) -> Result<(), AppError> {
        self.runs.update_run(run).await
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<EnrichmentRun>, AppError> {
        self.runs.get_run(id).await
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<EnrichmentRun>, AppError> {
        self.runs.list_runs(limit).await
    }
}

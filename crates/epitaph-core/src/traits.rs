use std::future::Future;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::error::AppError;
use crate::models::{
    FailureRecord, FallbackOutcome, FetchedPage, HistoryEntry, NewFailureRecord, Subject,
};
use crate::provenance::{SubjectUpdate, WriteSummary};
use crate::run::EnrichmentRun;

/// Fetches a page over HTTP.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<FetchedPage, AppError>> + Send;
}

/// Converts raw HTML into readable text.
pub trait Cleaner: Send + Sync + Clone {
    fn clean(&self, html: &str) -> Result<String, AppError>;
}

/// Token accounting reported by an LLM call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Validated JSON from an LLM plus what it cost to get it.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub data: serde_json::Value,
    /// The model's message content, verbatim.
    pub raw: String,
    pub usage: TokenUsage,
}

/// Extracts structured JSON from text content using an LLM.
pub trait Extractor: Send + Sync + Clone {
    /// Parse failures must be reported as `AppError::Parse` carrying the raw
    /// model output so the payload can be replayed later.
    fn extract(
        &self,
        instructions: &str,
        content: &str,
        schema: &serde_json::Value,
    ) -> impl Future<Output = Result<Extraction, AppError>> + Send;
}

/// Recovers the content of a blocked URL through alternate routes.
pub trait FallbackFetcher: Send + Sync + Clone {
    /// Never fails: exhausting every route is reported as
    /// [`FallbackOutcome::Unavailable`].
    fn fetch_with_fallback(&self, url: &str) -> impl Future<Output = FallbackOutcome> + Send;
}

/// A fallback that never recovers anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFallback;

impl FallbackFetcher for NoFallback {
    async fn fetch_with_fallback(&self, _url: &str) -> FallbackOutcome {
        FallbackOutcome::Unavailable { attempts: vec![] }
    }
}

/// Filter for [`SubjectSource::candidates`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateQuery {
    /// Restrict to these ids.
    pub subject_ids: Option<Vec<i64>>,
    /// Only ids strictly greater than this.
    pub after_id: Option<i64>,
    pub limit: usize,
    /// Only subjects with no known cause of death.
    pub only_missing: bool,
}

/// Read access to the subject catalog plus failure bookkeeping.
pub trait SubjectSource: Send + Sync + Clone {
    /// Deceased subjects, ascending by id.
    fn candidates(
        &self,
        query: &CandidateQuery,
    ) -> impl Future<Output = Result<Vec<Subject>, AppError>> + Send;

    /// Number of subjects the query would return without `after_id`/`limit`.
    fn count_candidates(
        &self,
        query: &CandidateQuery,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn get_subject(&self, id: i64)
    -> impl Future<Output = Result<Option<Subject>, AppError>> + Send;

    /// Increment the attempt counter and stamp the attempt time.
    fn record_subject_failure(
        &self,
        id: i64,
        attempted_at: DateTime<Utc>,
        permanently_failed: bool,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Clear failure bookkeeping. `None` resets every subject.
    fn reset_subject_failures(
        &self,
        ids: Option<&[i64]>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// Applies merged claims to the subject store with provenance.
pub trait EnrichmentWriter: Send + Sync + Clone {
    /// All writes for one subject happen in one transaction: primary fields
    /// fill-if-empty, one history row per write, satellite record upserted,
    /// failure bookkeeping reset.
    fn apply(
        &self,
        update: &SubjectUpdate,
    ) -> impl Future<Output = Result<WriteSummary, AppError>> + Send;

    /// History rows for a subject, oldest first.
    fn history(
        &self,
        subject_id: i64,
    ) -> impl Future<Output = Result<Vec<HistoryEntry>, AppError>> + Send;
}

/// Durable checkpoint storage, one row per run type.
pub trait CheckpointStore: Send + Sync + Clone {
    fn load_checkpoint(
        &self,
        run_type: &str,
    ) -> impl Future<Output = Result<Option<Checkpoint>, AppError>> + Send;

    /// Atomic upsert.
    fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Returns true if a checkpoint existed.
    fn clear_checkpoint(&self, run_type: &str)
    -> impl Future<Output = Result<bool, AppError>> + Send;
}

/// Raw payloads that failed to parse, kept for replay.
pub trait FailureStore: Send + Sync + Clone {
    fn record_failure(
        &self,
        failure: &NewFailureRecord,
    ) -> impl Future<Output = Result<Uuid, AppError>> + Send;

    /// Failures not yet reprocessed, least replayed first, then oldest.
    fn unprocessed_failures(
        &self,
        provider: Option<&str>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<FailureRecord>, AppError>> + Send;

    fn mark_reprocessed(
        &self,
        id: Uuid,
        result: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Count a replay that still failed without dequeuing the row.
    fn record_replay_attempt(
        &self,
        id: Uuid,
        error: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Persisted run rows backing progress queries.
pub trait RunLedger: Send + Sync + Clone {
    fn create_run(&self, run: &EnrichmentRun)
    -> impl Future<Output = Result<(), AppError>> + Send;

    fn update_run(&self, run: &EnrichmentRun)
    -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_run(&self, id: Uuid)
    -> impl Future<Output = Result<Option<EnrichmentRun>, AppError>> + Send;

    /// Most recent first.
    fn list_runs(&self, limit: usize)
    -> impl Future<Output = Result<Vec<EnrichmentRun>, AppError>> + Send;
}

/// Everything the batch controller needs from storage.
pub trait EnrichmentStore:
    SubjectSource + EnrichmentWriter + CheckpointStore + FailureStore + RunLedger + 'static
{
}

impl<T> EnrichmentStore for T where
    T: SubjectSource + EnrichmentWriter + CheckpointStore + FailureStore + RunLedger + 'static
{
}

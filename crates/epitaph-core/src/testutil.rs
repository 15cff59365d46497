//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::batch::{BatchEvent, BatchReporter};
use crate::checkpoint::Checkpoint;
use crate::error::{AppError, ParseErrorKind};
use crate::models::{
    ClaimField, DeathDetails, FailureRecord, FallbackAttempt, FallbackOutcome, FetchMethod,
    FetchedPage, HistoryEntry, LookupResult, NewFailureRecord, RecoveredPage, SourceEntry, Subject,
};
use crate::provenance::{
    EnrichmentRecord, SATELLITE_SOURCE, SubjectUpdate, WriteSummary, narrative_changes,
};
use crate::provider::{
    Provider, ProviderDescriptor, ProviderFamily, ProviderHit, ReliabilityTier,
};
use crate::run::EnrichmentRun;
use crate::throttle::RateLimiter;
use crate::traits::{
    CandidateQuery, CheckpointStore, Cleaner, EnrichmentWriter, Extraction, Extractor,
    FailureStore, FallbackFetcher, Fetcher, RunLedger, SubjectSource, TokenUsage,
};

/// `AppError` is not `Clone` (it wraps `serde_json::Error`); mocks that
/// replay the same error need a copy.
pub fn clone_error(err: &AppError) -> AppError {
    match err {
        AppError::HttpError(m) => AppError::HttpError(m.clone()),
        AppError::AccessBlocked { url, status } => AppError::AccessBlocked {
            url: url.clone(),
            status: *status,
        },
        AppError::NotFound(m) => AppError::NotFound(m.clone()),
        AppError::ServerError { status, message } => AppError::ServerError {
            status: *status,
            message: message.clone(),
        },
        AppError::LlmError {
            message,
            status_code,
            retryable,
        } => AppError::LlmError {
            message: message.clone(),
            status_code: *status_code,
            retryable: *retryable,
        },
        AppError::CleanerError(m) => AppError::CleanerError(m.clone()),
        AppError::Parse { kind, message, raw } => AppError::Parse {
            kind: *kind,
            message: message.clone(),
            raw: raw.clone(),
        },
        AppError::SerializationError(e) => AppError::Generic(e.to_string()),
        AppError::Timeout(s) => AppError::Timeout(*s),
        AppError::RateLimitExceeded => AppError::RateLimitExceeded,
        AppError::NetworkError(m) => AppError::NetworkError(m.clone()),
        AppError::ProvidersUnavailable(m) => AppError::ProvidersUnavailable(m.clone()),
        AppError::DatabaseError(m) => AppError::DatabaseError(m.clone()),
        AppError::ConfigError(m) => AppError::ConfigError(m.clone()),
        AppError::ValidationError(m) => AppError::ValidationError(m.clone()),
        AppError::BudgetExceeded { spent, limit } => AppError::BudgetExceeded {
            spent: *spent,
            limit: *limit,
        },
        AppError::Conflict(m) => AppError::Conflict(m.clone()),
        AppError::Generic(m) => AppError::Generic(m.clone()),
    }
}

fn clone_outcome(outcome: &Result<DeathDetails, AppError>) -> Result<DeathDetails, AppError> {
    match outcome {
        Ok(d) => Ok(d.clone()),
        Err(e) => Err(clone_error(e)),
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A deceased subject with a name, birth and death date, and nothing else.
pub fn sample_subject(id: i64) -> Subject {
    let mut subject = Subject::new(id, format!("Subject {id}"));
    subject.birthday = NaiveDate::from_ymd_opt(1950, 1, 1);
    subject.deathday = NaiveDate::from_ymd_opt(2020, 1, 1);
    subject
}

pub fn sample_details() -> DeathDetails {
    DeathDetails {
        cause_of_death: Some("heart attack".into()),
        circumstances: Some("Collapsed at home and was pronounced dead in hospital".into()),
        ..Default::default()
    }
}

/// A successful result as if `name` had returned `data`.
pub fn result_from(
    name: &str,
    family: ProviderFamily,
    tier: ReliabilityTier,
    confidence: f64,
    data: DeathDetails,
) -> LookupResult {
    let descriptor = ProviderDescriptor::free(name, family, tier);
    LookupResult::succeeded(
        SourceEntry::new(&descriptor).with_confidence(confidence),
        data,
    )
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

struct Route {
    prefix: String,
    final_url: Option<String>,
    response: Result<String, AppError>,
}

/// Mock fetcher with URL-prefix routes and a fallback response queue.
#[derive(Clone)]
pub struct MockFetcher {
    /// Queue of responses for unrouted URLs. Each call pops the first
    /// element. If empty, returns a default HTML string.
    responses: Arc<Mutex<Vec<Result<String, AppError>>>>,
    routes: Arc<Mutex<Vec<Route>>>,
    requested: Arc<Mutex<Vec<String>>>,
}

impl MockFetcher {
    pub fn new(html: &str) -> Self {
        Self::with_responses(vec![Ok(html.to_string())])
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<String, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            routes: Arc::new(Mutex::new(Vec::new())),
            requested: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Serve `body` for every URL starting with `prefix`.
    pub fn route(self, prefix: &str, body: &str) -> Self {
        self.push_route(prefix, None, Ok(body.to_string()))
    }

    /// Serve `body` as if the request was redirected to `final_url`.
    pub fn route_redirect(self, prefix: &str, final_url: &str, body: &str) -> Self {
        self.push_route(prefix, Some(final_url.to_string()), Ok(body.to_string()))
    }

    pub fn route_error(self, prefix: &str, error: AppError) -> Self {
        self.push_route(prefix, None, Err(error))
    }

    fn push_route(
        self,
        prefix: &str,
        final_url: Option<String>,
        response: Result<String, AppError>,
    ) -> Self {
        self.routes.lock().unwrap().push(Route {
            prefix: prefix.to_string(),
            final_url,
            response,
        });
        self
    }

    /// Every URL fetched so far, in order.
    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

impl Default for MockFetcher {
    fn default() -> Self {
        Self::with_responses(Vec::new())
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, AppError> {
        self.requested.lock().unwrap().push(url.to_string());

        {
            let routes = self.routes.lock().unwrap();
            let best = routes
                .iter()
                .filter(|r| url.starts_with(&r.prefix))
                .max_by_key(|r| r.prefix.len());
            if let Some(route) = best {
                let final_url = route.final_url.clone().unwrap_or_else(|| url.to_string());
                return match &route.response {
                    Ok(body) => Ok(FetchedPage::ok(final_url, body.clone())),
                    Err(e) => Err(clone_error(e)),
                };
            }
        }

        let mut responses = self.responses.lock().unwrap();
        let body = if responses.is_empty() {
            "<html><body>default</body></html>".to_string()
        } else {
            responses.remove(0)?
        };
        Ok(FetchedPage::ok(url, body))
    }
}

// ---------------------------------------------------------------------------
// MockCleaner
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockCleaner {
    error: Arc<Mutex<Option<AppError>>>,
}

impl MockCleaner {
    /// Creates a cleaner that returns the input unchanged.
    pub fn passthrough() -> Self {
        Self {
            error: Arc::new(Mutex::new(None)),
        }
    }

    /// Creates a cleaner that fails once.
    pub fn with_error(error: AppError) -> Self {
        Self {
            error: Arc::new(Mutex::new(Some(error))),
        }
    }
}

impl Cleaner for MockCleaner {
    fn clean(&self, html: &str) -> Result<String, AppError> {
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(html.to_string())
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Mock extractor that returns configurable JSON and records its inputs.
#[derive(Clone)]
pub struct MockExtractor {
    responses: Arc<Mutex<Vec<Result<serde_json::Value, AppError>>>>,
    contents: Arc<Mutex<Vec<String>>>,
}

impl MockExtractor {
    pub fn new(data: serde_json::Value) -> Self {
        Self::with_responses(vec![Ok(data)])
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<serde_json::Value, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            contents: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Content passed to each call.
    pub fn contents(&self) -> Vec<String> {
        self.contents.lock().unwrap().clone()
    }
}

impl Extractor for MockExtractor {
    async fn extract(
        &self,
        _instructions: &str,
        content: &str,
        _schema: &serde_json::Value,
    ) -> Result<Extraction, AppError> {
        self.contents.lock().unwrap().push(content.to_string());
        let mut responses = self.responses.lock().unwrap();
        let data = if responses.is_empty() {
            serde_json::json!({})
        } else {
            responses.remove(0)?
        };
        Ok(Extraction {
            raw: data.to_string(),
            data,
            usage: TokenUsage {
                prompt_tokens: 1_000,
                completion_tokens: 200,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// MockProvider
// ---------------------------------------------------------------------------

/// Provider with a scripted outcome. Defaults to a free secondary site
/// search with no rate limit.
#[derive(Clone)]
pub struct MockProvider {
    descriptor: ProviderDescriptor,
    limiter: RateLimiter,
    outcome: Arc<Result<DeathDetails, AppError>>,
    sequence: Arc<Mutex<VecDeque<Result<DeathDetails, AppError>>>>,
    page_data: Option<DeathDetails>,
    parses_pages: bool,
    reported_cost: Option<f64>,
    json_payloads: bool,
    available: bool,
    timeout: Duration,
    latency: Duration,
    calls: Arc<AtomicUsize>,
    page_calls: Arc<AtomicUsize>,
}

impl MockProvider {
    fn build(name: &str, outcome: Result<DeathDetails, AppError>) -> Self {
        Self {
            descriptor: ProviderDescriptor::free(
                name,
                ProviderFamily::SiteSearch,
                ReliabilityTier::Secondary,
            )
            .with_min_delay(Duration::ZERO),
            limiter: RateLimiter::unlimited(),
            outcome: Arc::new(outcome),
            sequence: Arc::new(Mutex::new(VecDeque::new())),
            page_data: None,
            parses_pages: true,
            reported_cost: None,
            json_payloads: false,
            available: true,
            timeout: Duration::from_secs(5),
            latency: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            page_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn succeeding(name: &str, data: DeathDetails) -> Self {
        Self::build(name, Ok(data))
    }

    pub fn failing(name: &str, error: AppError) -> Self {
        Self::build(name, Err(error))
    }

    /// Returns each outcome once, in order, then `NotFound`.
    pub fn sequence(name: &str, outcomes: Vec<Result<DeathDetails, AppError>>) -> Self {
        let provider = Self::build(name, Err(AppError::NotFound("sequence exhausted".into())));
        provider.sequence.lock().unwrap().extend(outcomes);
        provider
    }

    /// An AI provider that parses stored payloads as `DeathDetails` JSON.
    pub fn json_payloads(name: &str) -> Self {
        let mut provider = Self::build(name, Err(AppError::NotFound("live lookup disabled".into())));
        provider.descriptor.family = ProviderFamily::AiModel;
        provider.descriptor.tier = ReliabilityTier::AiInference;
        provider.json_payloads = true;
        provider
    }

    pub fn paid(mut self, cost: f64) -> Self {
        self.descriptor.paid = true;
        self.descriptor.cost_per_query = cost;
        self
    }

    pub fn ai(mut self, cost: f64) -> Self {
        self.descriptor.family = ProviderFamily::AiModel;
        self.descriptor.tier = ReliabilityTier::AiInference;
        self.paid(cost)
    }

    pub fn with_tier(mut self, tier: ReliabilityTier) -> Self {
        self.descriptor.tier = tier;
        self
    }

    pub fn with_family(mut self, family: ProviderFamily) -> Self {
        self.descriptor.family = family;
        self
    }

    /// Data returned when parsing a recovered page.
    pub fn with_page_data(mut self, data: DeathDetails) -> Self {
        self.page_data = Some(data);
        self
    }

    /// Actual cost reported with each hit, overriding the descriptor estimate.
    pub fn with_reported_cost(mut self, cost: f64) -> Self {
        self.reported_cost = Some(cost);
        self
    }

    /// Behave like a provider that cannot read recovered pages.
    pub fn without_page_parsing(mut self) -> Self {
        self.parses_pages = false;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Number of live lookups performed.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of recovered pages parsed.
    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> Result<DeathDetails, AppError> {
        if let Some(next) = self.sequence.lock().unwrap().pop_front() {
            return next;
        }
        clone_outcome(&self.outcome)
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn perform_lookup(&self, subject: &Subject) -> Result<ProviderHit, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let data = self.next_outcome()?;
        let hit = ProviderHit::new(data).with_query(subject.search_query());
        Ok(match self.reported_cost {
            Some(cost) => hit.with_cost(cost),
            None => hit,
        })
    }

    fn supports_recovery(&self) -> bool {
        self.parses_pages
    }

    async fn parse_page(
        &self,
        _subject: &Subject,
        _page: &RecoveredPage,
    ) -> Result<ProviderHit, AppError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let data = match &self.page_data {
            Some(data) => data.clone(),
            None => clone_outcome(&self.outcome)?,
        };
        Ok(ProviderHit::new(data))
    }

    fn parse_payload(&self, _subject: &Subject, raw: &str) -> Result<ProviderHit, AppError> {
        if !self.json_payloads {
            return Err(AppError::Parse {
                kind: ParseErrorKind::UnexpectedMarkup,
                message: "replay unsupported".into(),
                raw: raw.to_string(),
            });
        }
        serde_json::from_str::<DeathDetails>(raw)
            .map(ProviderHit::new)
            .map_err(|e| AppError::Parse {
                kind: ParseErrorKind::InvalidJson,
                message: e.to_string(),
                raw: raw.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// MockFallback
// ---------------------------------------------------------------------------

/// Fallback chain that either recovers every URL with one method or none.
#[derive(Clone)]
pub struct MockFallback {
    method: Option<FetchMethod>,
    requested: Arc<Mutex<Vec<String>>>,
}

impl MockFallback {
    pub fn recovering(method: FetchMethod) -> Self {
        Self {
            method: Some(method),
            requested: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            method: None,
            requested: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

impl FallbackFetcher for MockFallback {
    async fn fetch_with_fallback(&self, url: &str) -> FallbackOutcome {
        self.requested.lock().unwrap().push(url.to_string());
        match self.method {
            Some(method) => FallbackOutcome::Recovered(RecoveredPage {
                method,
                requested_url: url.to_string(),
                resolved_url: url.to_string(),
                title: Some("Obituary".into()),
                text: "The actor died at home after a long illness.".into(),
                html: "<html><body><p>The actor died at home after a long illness.</p></body></html>"
                    .into(),
            }),
            None => FallbackOutcome::Unavailable {
                attempts: vec![
                    FallbackAttempt {
                        method: FetchMethod::Wayback,
                        reason: "no snapshot".into(),
                    },
                    FallbackAttempt {
                        method: FetchMethod::ArchiveToday,
                        reason: "no snapshot".into(),
                    },
                ],
            },
        }
    }
}

// ---------------------------------------------------------------------------
// MockStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    subjects: BTreeMap<i64, Subject>,
    history: Vec<HistoryEntry>,
    records: HashMap<i64, EnrichmentRecord>,
    checkpoints: HashMap<String, Checkpoint>,
    failures: Vec<FailureRecord>,
    runs: HashMap<Uuid, EnrichmentRun>,
    next_history_id: i64,
}

/// In-memory store implementing every storage trait with the same
/// fill-if-empty rules as the database.
#[derive(Clone, Default)]
pub struct MockStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MockStore {
    pub fn with_subjects(subjects: Vec<Subject>) -> Self {
        let store = Self::default();
        {
            let mut inner = store.inner.lock().unwrap();
            for s in subjects {
                inner.subjects.insert(s.id, s);
            }
        }
        store
    }

    pub fn subject(&self, id: i64) -> Option<Subject> {
        self.inner.lock().unwrap().subjects.get(&id).cloned()
    }

    pub fn record(&self, subject_id: i64) -> Option<EnrichmentRecord> {
        self.inner.lock().unwrap().records.get(&subject_id).cloned()
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.inner.lock().unwrap().failures.clone()
    }

    pub fn run(&self, id: Uuid) -> Option<EnrichmentRun> {
        self.inner.lock().unwrap().runs.get(&id).cloned()
    }

    pub fn checkpoint(&self, run_type: &str) -> Option<Checkpoint> {
        self.inner.lock().unwrap().checkpoints.get(run_type).cloned()
    }

    pub fn seed_failure(&self, failure: NewFailureRecord) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().unwrap().failures.push(failure_row(id, &failure));
        id
    }
}

fn failure_row(id: Uuid, f: &NewFailureRecord) -> FailureRecord {
    FailureRecord {
        id,
        run_id: f.run_id,
        subject_id: f.subject_id,
        provider: f.provider.clone(),
        raw_payload: f.raw_payload.clone(),
        payload_hash: f.payload_hash.clone(),
        error_kind: f.error_kind,
        parse_kind: f.parse_kind,
        error_message: f.error_message.clone(),
        created_at: Utc::now(),
        reprocessed_at: None,
        reprocess_result: None,
        replay_attempts: 0,
        last_replay_error: None,
    }
}

fn matches_query(subject: &Subject, query: &CandidateQuery) -> bool {
    if let Some(ids) = &query.subject_ids
        && !ids.contains(&subject.id)
    {
        return false;
    }
    !(query.only_missing && subject.known_value(ClaimField::CauseOfDeath).is_some())
}

impl StoreInner {
    fn push_history(
        &mut self,
        subject_id: i64,
        field: &str,
        old_value: Option<String>,
        new_value: Option<String>,
        source: &str,
        run_id: Uuid,
    ) {
        self.next_history_id += 1;
        self.history.push(HistoryEntry {
            id: self.next_history_id,
            subject_id,
            field: field.to_string(),
            old_value,
            new_value,
            source: source.to_string(),
            run_id,
            created_at: Utc::now(),
        });
    }
}

impl SubjectSource for MockStore {
    async fn candidates(&self, query: &CandidateQuery) -> Result<Vec<Subject>, AppError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .subjects
            .values()
            .filter(|s| query.after_id.is_none_or(|after| s.id > after))
            .filter(|s| matches_query(s, query))
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn count_candidates(&self, query: &CandidateQuery) -> Result<u64, AppError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .subjects
            .values()
            .filter(|s| matches_query(s, query))
            .count() as u64)
    }

    async fn get_subject(&self, id: i64) -> Result<Option<Subject>, AppError> {
        Ok(self.subject(id))
    }

    async fn record_subject_failure(
        &self,
        id: i64,
        attempted_at: DateTime<Utc>,
        permanently_failed: bool,
    ) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        let subject = inner
            .subjects
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("subject {id}")))?;
        subject.enrichment_attempts += 1;
        subject.last_enrichment_attempt = Some(attempted_at);
        subject.enrichment_permanently_failed |= permanently_failed;
        Ok(())
    }

    async fn reset_subject_failures(&self, ids: Option<&[i64]>) -> Result<u64, AppError> {
        let mut inner = self.inner.lock().unwrap();
        let mut reset = 0;
        for subject in inner.subjects.values_mut() {
            if ids.is_some_and(|ids| !ids.contains(&subject.id)) {
                continue;
            }
            if subject.enrichment_attempts > 0 || subject.enrichment_permanently_failed {
                subject.enrichment_attempts = 0;
                subject.last_enrichment_attempt = None;
                subject.enrichment_permanently_failed = false;
                reset += 1;
            }
        }
        Ok(reset)
    }
}

impl EnrichmentWriter for MockStore {
    async fn apply(&self, update: &SubjectUpdate) -> Result<WriteSummary, AppError> {
        let mut inner = self.inner.lock().unwrap();
        let mut subject = inner
            .subjects
            .get(&update.subject_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("subject {}", update.subject_id)))?;
        let mut summary = WriteSummary::default();

        for write in &update.primary {
            if subject.known_value(write.field).is_some() {
                summary.fields_skipped.push(write.field);
                continue;
            }
            let slot = match write.field {
                ClaimField::CauseOfDeath => &mut subject.cause_of_death,
                ClaimField::CauseOfDeathDetails => &mut subject.cause_of_death_details,
                ClaimField::DeathLocation => &mut subject.death_location,
                _ => continue,
            };
            let old = slot.replace(write.value.clone());
            inner.push_history(
                update.subject_id,
                write.field.as_str(),
                old,
                Some(write.value.clone()),
                &write.source,
                update.run_id,
            );
            summary.fields_written.push(write.field);
            summary.history_rows += 1;
        }

        if update.record.has_content() {
            let previous = inner.records.get(&update.subject_id).cloned();
            let merged = update.record.merged_onto(previous.as_ref());
            for (field, old, new) in narrative_changes(previous.as_ref(), &merged) {
                inner.push_history(
                    update.subject_id,
                    field.as_str(),
                    old,
                    new,
                    SATELLITE_SOURCE,
                    update.run_id,
                );
                summary.history_rows += 1;
            }
            if previous.as_ref() != Some(&merged) {
                summary.record_upserted = true;
                inner.records.insert(update.subject_id, merged);
            }
        }

        if summary.updated() {
            subject.enrichment_attempts = 0;
            subject.last_enrichment_attempt = None;
            subject.enrichment_permanently_failed = false;
        }
        inner.subjects.insert(subject.id, subject);
        Ok(summary)
    }

    async fn history(&self, subject_id: i64) -> Result<Vec<HistoryEntry>, AppError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .history
            .iter()
            .filter(|h| h.subject_id == subject_id)
            .cloned()
            .collect())
    }
}

impl CheckpointStore for MockStore {
    async fn load_checkpoint(&self, run_type: &str) -> Result<Option<Checkpoint>, AppError> {
        Ok(self.checkpoint(run_type))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), AppError> {
        self.inner
            .lock()
            .unwrap()
            .checkpoints
            .insert(checkpoint.run_type.clone(), checkpoint.clone());
        Ok(())
    }

    async fn clear_checkpoint(&self, run_type: &str) -> Result<bool, AppError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .checkpoints
            .remove(run_type)
            .is_some())
    }
}

impl FailureStore for MockStore {
    async fn record_failure(&self, failure: &NewFailureRecord) -> Result<Uuid, AppError> {
        let mut inner = self.inner.lock().unwrap();
        // Same payload for the same subject and provider is stored once.
        if let Some(existing) = inner.failures.iter().find(|f| {
            f.subject_id == failure.subject_id
                && f.provider == failure.provider
                && f.payload_hash == failure.payload_hash
        }) {
            return Ok(existing.id);
        }
        let id = Uuid::new_v4();
        inner.failures.push(failure_row(id, failure));
        Ok(id)
    }

    async fn unprocessed_failures(
        &self,
        provider: Option<&str>,
        limit: usize,
    ) -> Result<Vec<FailureRecord>, AppError> {
        let inner = self.inner.lock().unwrap();
        let mut pending: Vec<FailureRecord> = inner
            .failures
            .iter()
            .filter(|f| f.reprocessed_at.is_none())
            .filter(|f| provider.is_none_or(|p| f.provider == p))
            .cloned()
            .collect();
        pending.sort_by_key(|f| f.replay_attempts);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_reprocessed(&self, id: Uuid, result: &str) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        let failure = inner
            .failures
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| AppError::NotFound(format!("failure {id}")))?;
        failure.reprocessed_at = Some(Utc::now());
        failure.reprocess_result = Some(result.to_string());
        Ok(())
    }

    async fn record_replay_attempt(&self, id: Uuid, error: &str) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        let failure = inner
            .failures
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| AppError::NotFound(format!("failure {id}")))?;
        failure.replay_attempts += 1;
        failure.last_replay_error = Some(error.to_string());
        Ok(())
    }
}

impl RunLedger for MockStore {
    async fn create_run(&self, run: &EnrichmentRun) -> Result<(), AppError> {
        self.inner.lock().unwrap().runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &EnrichmentRun) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.runs.contains_key(&run.id) {
            return Err(AppError::NotFound(format!("run {}", run.id)));
        }
        inner.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<EnrichmentRun>, AppError> {
        Ok(self.run(id))
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<EnrichmentRun>, AppError> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<EnrichmentRun> = inner.runs.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Counts finished subjects; optionally cancels a run after `k` of them.
#[derive(Default)]
pub struct MockReporter {
    finished: AtomicUsize,
    skipped: AtomicUsize,
    cancel: Option<(usize, CancellationToken)>,
}

impl MockReporter {
    pub fn cancel_after(k: usize, token: CancellationToken) -> Self {
        Self {
            cancel: Some((k, token)),
            ..Default::default()
        }
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }
}

impl BatchReporter for MockReporter {
    fn report(&self, event: BatchEvent<'_>) {
        match event {
            BatchEvent::SubjectFinished { .. } => {
                let n = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some((k, token)) = &self.cancel
                    && n >= *k
                {
                    token.cancel();
                }
            }
            BatchEvent::SubjectSkipped { .. } => {
                self.skipped.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

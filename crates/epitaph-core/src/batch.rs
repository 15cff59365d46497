//! Resumable batch controller.
//!
//! Walks candidate subjects in ascending id order, enriches each one through
//! the orchestrator and the writer, and persists a checkpoint after every
//! subject so a crashed or stopped run picks up where it left off.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::Checkpoint;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::AppError;
use crate::models::{NewFailureRecord, Subject};
use crate::orchestrator::{EnrichmentOrchestrator, EnrichmentOutcome, RunConfig};
use crate::provenance::build_update;
use crate::retry::{RetryPolicy, TransientRetry};
use crate::run::{EnrichmentRun, RunCounters, RunProgress, RunStatus};
use crate::traits::{CandidateQuery, EnrichmentStore, FallbackFetcher};

/// Run type used when none is given.
pub const DEFAULT_RUN_TYPE: &str = "death_details";

const PAGE_SIZE: usize = 100;

/// Batch run settings.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Checkpoint key. Two runs of the same type cannot overlap.
    pub run_type: String,
    pub run: RunConfig,
    /// Subjects to process in this run (skips excluded).
    pub limit: Option<u64>,
    pub subject_ids: Option<Vec<i64>>,
    /// Only subjects without a known cause of death.
    pub only_missing: bool,
    pub retry_policy: RetryPolicy,
    pub transient_retry: TransientRetry,
    pub circuit_breaker_threshold: u32,
    /// USD ceiling for the whole run.
    pub max_total_cost: Option<f64>,
    pub delay_between_subjects: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            run_type: DEFAULT_RUN_TYPE.to_string(),
            run: RunConfig::default(),
            limit: None,
            subject_ids: None,
            only_missing: true,
            retry_policy: RetryPolicy::default(),
            transient_retry: TransientRetry::default(),
            circuit_breaker_threshold: 5,
            max_total_cost: None,
            delay_between_subjects: Duration::ZERO,
        }
    }
}

impl BatchConfig {
    /// Snapshot stored with the run row.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "run_type": self.run_type,
            "run": self.run,
            "limit": self.limit,
            "subject_ids": self.subject_ids,
            "only_missing": self.only_missing,
            "max_attempts": self.retry_policy.max_attempts,
            "transient_retries": self.transient_retry.max_retries,
            "circuit_breaker_threshold": self.circuit_breaker_threshold,
            "max_total_cost": self.max_total_cost,
        })
    }
}

/// Result of processing one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SubjectOutcome {
    Updated { fields: usize, cost: f64 },
    NoNewData { cost: f64 },
    NotFound { permanently_failed: bool },
    Invalid { reason: String, permanently_failed: bool },
    TransientFailure { error: String, permanently_failed: bool },
}

impl SubjectOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectOutcome::Updated { .. } => "updated",
            SubjectOutcome::NoNewData { .. } => "no_data",
            SubjectOutcome::NotFound { .. } => "not_found",
            SubjectOutcome::Invalid { .. } => "invalid",
            SubjectOutcome::TransientFailure { .. } => "transient_failure",
        }
    }

    pub fn cost(&self) -> f64 {
        match self {
            SubjectOutcome::Updated { cost, .. } | SubjectOutcome::NoNewData { cost } => *cost,
            _ => 0.0,
        }
    }

    fn permanently_failed(&self) -> bool {
        match self {
            SubjectOutcome::NotFound { permanently_failed }
            | SubjectOutcome::Invalid {
                permanently_failed, ..
            }
            | SubjectOutcome::TransientFailure {
                permanently_failed, ..
            } => *permanently_failed,
            _ => false,
        }
    }
}

/// One processed subject, for reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectReport {
    pub subject_id: i64,
    pub name: String,
    pub outcome: SubjectOutcome,
    pub providers_attempted: Vec<String>,
    pub stop_reason: Option<String>,
    pub elapsed_ms: u64,
}

/// Events emitted by the controller.
#[derive(Debug, Clone)]
pub enum BatchEvent<'a> {
    Started {
        run_id: Uuid,
        run_type: &'a str,
        resumed_from: Option<usize>,
    },
    SubjectStarted {
        subject: &'a Subject,
    },
    SubjectFinished {
        report: &'a SubjectReport,
    },
    SubjectSkipped {
        subject_id: i64,
        reason: &'a str,
    },
    TransientRetry {
        subject_id: i64,
        attempt: u32,
        error: &'a str,
    },
    BreakerTripped {
        failures: u32,
        last_error: &'a str,
    },
    Progress {
        counters: &'a RunCounters,
        accumulated_cost: f64,
    },
    Finished {
        run_id: Uuid,
        status: RunStatus,
        counters: &'a RunCounters,
        accumulated_cost: f64,
    },
}

/// Receives controller events.
pub trait BatchReporter: Send + Sync {
    fn report(&self, event: BatchEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBatchReporter;

impl BatchReporter for TracingBatchReporter {
    fn report(&self, event: BatchEvent<'_>) {
        match event {
            BatchEvent::Started {
                run_id,
                run_type,
                resumed_from,
            } => {
                tracing::info!(%run_id, %run_type, ?resumed_from, "Batch run started");
            }
            BatchEvent::SubjectStarted { subject } => {
                tracing::debug!(subject_id = subject.id, name = %subject.name, "Subject started");
            }
            BatchEvent::SubjectFinished { report } => {
                tracing::info!(
                    subject_id = report.subject_id,
                    outcome = report.outcome.as_str(),
                    elapsed_ms = report.elapsed_ms,
                    "Subject finished"
                );
            }
            BatchEvent::SubjectSkipped { subject_id, reason } => {
                tracing::debug!(subject_id, %reason, "Subject skipped");
            }
            BatchEvent::TransientRetry {
                subject_id,
                attempt,
                error,
            } => {
                tracing::warn!(subject_id, attempt, %error, "Transient failure, retrying");
            }
            BatchEvent::BreakerTripped {
                failures,
                last_error,
            } => {
                tracing::error!(
                    failures,
                    %last_error,
                    "Circuit breaker tripped: providers appear to be down, halting run"
                );
            }
            BatchEvent::Progress {
                counters,
                accumulated_cost,
            } => {
                tracing::info!(%counters, cost = accumulated_cost, "Progress");
            }
            BatchEvent::Finished {
                run_id,
                status,
                counters,
                accumulated_cost,
            } => {
                tracing::info!(%run_id, %status, %counters, cost = accumulated_cost, "Batch run finished");
            }
        }
    }
}

/// Final tallies of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub counters: RunCounters,
    pub accumulated_cost: f64,
    pub exit_reason: String,
    pub reports: Vec<SubjectReport>,
}

/// Shared live progress handle.
pub type ProgressHandle = Arc<RwLock<RunProgress>>;

pub struct BatchController<D, FF> {
    store: D,
    orchestrator: Arc<EnrichmentOrchestrator<FF>>,
    config: BatchConfig,
    breaker: CircuitBreaker,
}

enum Halt {
    Cancelled,
    Budget,
    Limit,
    Breaker,
    SourceFailed,
}

impl<D, FF> BatchController<D, FF>
where
    D: EnrichmentStore,
    FF: FallbackFetcher,
{
    pub fn new(store: D, orchestrator: Arc<EnrichmentOrchestrator<FF>>, config: BatchConfig) -> Self {
        let breaker = CircuitBreaker::new(
            format!("batch:{}", config.run_type),
            CircuitBreakerConfig {
                failure_threshold: config.circuit_breaker_threshold.max(1),
            },
        );
        Self {
            store,
            orchestrator,
            config,
            breaker,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Run to completion, stop request, budget exhaustion or breaker trip.
    ///
    /// Only setup failures (checkpoint/ledger unreachable) return `Err`.
    pub async fn run<R: BatchReporter>(
        &self,
        run_id: Uuid,
        cancel: CancellationToken,
        reporter: &R,
        progress: Option<ProgressHandle>,
    ) -> Result<BatchSummary, AppError> {
        let run_type = self.config.run_type.clone();
        let mut checkpoint = match self.store.load_checkpoint(&run_type).await? {
            Some(existing) => existing.resume(run_id),
            None => Checkpoint::new(&run_type, run_id),
        };
        let resumed_from = (!checkpoint.processed_ids.is_empty()).then(|| checkpoint.processed_ids.len());
        self.store.save_checkpoint(&checkpoint).await?;

        let mut run = EnrichmentRun::new(run_id, &run_type, self.config.snapshot());
        run.status = RunStatus::Running;
        run.counters = checkpoint.counters;
        run.accumulated_cost = checkpoint.accumulated_cost;
        self.store.create_run(&run).await?;

        let total = self
            .store
            .count_candidates(&self.base_query())
            .await
            .ok()
            .map(|n| match self.config.limit {
                Some(limit) => n.min(limit),
                None => n,
            });
        if let Some(p) = &progress {
            let mut p = p.write().await;
            p.status = RunStatus::Running;
            p.total = total;
            p.counters = checkpoint.counters;
            p.accumulated_cost = checkpoint.accumulated_cost;
        }

        reporter.report(BatchEvent::Started {
            run_id,
            run_type: &run_type,
            resumed_from,
        });

        let mut reports = Vec::new();
        let halt = self
            .process_all(
                &mut checkpoint,
                &mut run,
                &cancel,
                reporter,
                progress.as_ref(),
                &mut reports,
            )
            .await;

        let (status, exit_reason) = match halt {
            None => (RunStatus::Completed, "completed"),
            Some(Halt::Limit) => (RunStatus::Completed, "limit"),
            Some(Halt::Cancelled) => (RunStatus::Stopped, "cancelled"),
            Some(Halt::Budget) => (RunStatus::Stopped, "budget"),
            Some(Halt::Breaker) => (RunStatus::CircuitBroken, "circuit_breaker"),
            Some(Halt::SourceFailed) => (RunStatus::Failed, "candidate_query_failed"),
        };
        if halt.is_none() {
            checkpoint.complete();
        }

        // Flush regardless of why the loop ended.
        if let Err(e) = self.store.save_checkpoint(&checkpoint).await {
            tracing::error!(error = %e, "Failed to flush checkpoint");
        }

        run.status = status;
        run.exit_reason = Some(exit_reason.to_string());
        run.current_subject = None;
        run.finished_at = Some(Utc::now());
        run.updated_at = Utc::now();
        if let Err(e) = self.store.update_run(&run).await {
            tracing::error!(error = %e, "Failed to record run completion");
        }

        if let Some(p) = &progress {
            let mut p = p.write().await;
            p.status = status;
            p.current_subject = None;
            p.exit_reason = Some(exit_reason.to_string());
            p.estimated_time_remaining_secs = None;
        }

        reporter.report(BatchEvent::Finished {
            run_id,
            status,
            counters: &checkpoint.counters,
            accumulated_cost: checkpoint.accumulated_cost,
        });

        Ok(BatchSummary {
            run_id,
            status,
            counters: checkpoint.counters,
            accumulated_cost: checkpoint.accumulated_cost,
            exit_reason: exit_reason.to_string(),
            reports,
        })
    }

    fn base_query(&self) -> CandidateQuery {
        CandidateQuery {
            subject_ids: self.config.subject_ids.clone(),
            after_id: None,
            limit: PAGE_SIZE,
            only_missing: self.config.only_missing,
        }
    }

    async fn process_all<R: BatchReporter>(
        &self,
        checkpoint: &mut Checkpoint,
        run: &mut EnrichmentRun,
        cancel: &CancellationToken,
        reporter: &R,
        progress: Option<&ProgressHandle>,
        reports: &mut Vec<SubjectReport>,
    ) -> Option<Halt> {
        let mut cursor = checkpoint.cursor();
        // The stored cursor never passes a subject that still needs a visit.
        let mut cursor_held = false;
        let mut handled_this_run: u64 = 0;

        loop {
            let query = CandidateQuery {
                after_id: cursor,
                ..self.base_query()
            };
            let page = match self.store.candidates(&query).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to load candidates");
                    if !e.is_retryable() {
                        return Some(Halt::SourceFailed);
                    }
                    if self.breaker.record_failure(&e) {
                        return Some(Halt::Breaker);
                    }
                    tokio::time::sleep(self.config.transient_retry.delay_for(0)).await;
                    continue;
                }
            };
            let Some(last) = page.last() else {
                return None;
            };
            let page_end = last.id;

            for subject in page {
                if cancel.is_cancelled() {
                    return Some(Halt::Cancelled);
                }
                if let Some(limit) = self.config.limit
                    && handled_this_run >= limit
                {
                    return Some(Halt::Limit);
                }
                if let Some(max) = self.config.max_total_cost
                    && checkpoint.accumulated_cost >= max
                {
                    tracing::warn!(spent = checkpoint.accumulated_cost, limit = max, "Run budget exhausted");
                    return Some(Halt::Budget);
                }

                if let Some(reason) = self.skip_reason(checkpoint, &subject) {
                    if reason != "already processed" {
                        checkpoint.counters.skipped += 1;
                    }
                    if reason == "cooling down" {
                        cursor_held = true;
                    } else if !cursor_held {
                        checkpoint.set_cursor(subject.id);
                    }
                    reporter.report(BatchEvent::SubjectSkipped {
                        subject_id: subject.id,
                        reason,
                    });
                    continue;
                }

                reporter.report(BatchEvent::SubjectStarted { subject: &subject });
                run.current_subject = Some(subject.id);
                if let Some(p) = progress {
                    p.write().await.current_subject = Some(subject.id);
                }

                let report = self.process_subject(run.id, &subject, reporter).await;
                handled_this_run += 1;
                let transient = matches!(report.outcome, SubjectOutcome::TransientFailure { .. });

                self.tally(checkpoint, &report.outcome);
                if transient {
                    cursor_held = true;
                } else {
                    checkpoint.mark_processed(subject.id);
                    if !cursor_held {
                        checkpoint.set_cursor(subject.id);
                    }
                }
                if let Err(e) = self.store.save_checkpoint(checkpoint).await {
                    tracing::error!(subject_id = subject.id, error = %e, "Failed to persist checkpoint");
                }

                run.counters = checkpoint.counters;
                run.accumulated_cost = checkpoint.accumulated_cost;
                run.updated_at = Utc::now();
                if let Err(e) = self.store.update_run(run).await {
                    tracing::warn!(error = %e, "Failed to update run row");
                }
                if let Some(p) = progress {
                    let mut p = p.write().await;
                    p.processed_count = checkpoint.counters.processed;
                    p.counters = checkpoint.counters;
                    p.accumulated_cost = checkpoint.accumulated_cost;
                    p.estimated_time_remaining_secs = p.estimate_remaining(Utc::now());
                }

                reporter.report(BatchEvent::SubjectFinished { report: &report });
                if checkpoint.counters.processed % 25 == 0 {
                    reporter.report(BatchEvent::Progress {
                        counters: &checkpoint.counters,
                        accumulated_cost: checkpoint.accumulated_cost,
                    });
                }
                reports.push(report);

                if transient && self.breaker.is_tripped() {
                    let stats = self.breaker.stats();
                    reporter.report(BatchEvent::BreakerTripped {
                        failures: stats.consecutive_failures,
                        last_error: stats.last_error.as_deref().unwrap_or("unknown"),
                    });
                    return Some(Halt::Breaker);
                }

                if !self.config.delay_between_subjects.is_zero() {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.delay_between_subjects) => {}
                        () = cancel.cancelled() => return Some(Halt::Cancelled),
                    }
                }
            }

            cursor = Some(page_end);
        }
    }

    fn skip_reason(&self, checkpoint: &Checkpoint, subject: &Subject) -> Option<&'static str> {
        if checkpoint.is_processed(subject.id) {
            return Some("already processed");
        }
        if subject.enrichment_permanently_failed {
            return Some("permanently failed");
        }
        if !self.config.retry_policy.is_eligible(
            subject.enrichment_attempts,
            subject.last_enrichment_attempt,
            Utc::now(),
        ) {
            return Some("cooling down");
        }
        None
    }

    fn tally(&self, checkpoint: &mut Checkpoint, outcome: &SubjectOutcome) {
        let counters = &mut checkpoint.counters;
        counters.processed += 1;
        match outcome {
            SubjectOutcome::Updated { .. } => counters.updated += 1,
            SubjectOutcome::NoNewData { .. } => counters.no_data += 1,
            other if other.permanently_failed() => counters.permanently_failed += 1,
            _ => counters.failed += 1,
        }
        checkpoint.add_cost(outcome.cost());
    }

    async fn process_subject<R: BatchReporter>(
        &self,
        run_id: Uuid,
        subject: &Subject,
        reporter: &R,
    ) -> SubjectReport {
        let started = std::time::Instant::now();
        let mut report = SubjectReport {
            subject_id: subject.id,
            name: subject.name.clone(),
            outcome: SubjectOutcome::NoNewData { cost: 0.0 },
            providers_attempted: Vec::new(),
            stop_reason: None,
            elapsed_ms: 0,
        };

        if let Err(e) = subject.validate() {
            let permanently_failed = self.record_permanent(subject).await;
            report.outcome = SubjectOutcome::Invalid {
                reason: e.to_string(),
                permanently_failed,
            };
            report.elapsed_ms = started.elapsed().as_millis() as u64;
            return report;
        }

        let mut attempt = 0;
        let mut spent = 0.0;
        let outcome = loop {
            match self.attempt_subject(run_id, subject, &mut report).await {
                Ok(outcome) => {
                    self.breaker.record_success();
                    break match outcome {
                        SubjectOutcome::Updated { fields, cost } => SubjectOutcome::Updated {
                            fields,
                            cost: cost + spent,
                        },
                        SubjectOutcome::NoNewData { cost } => SubjectOutcome::NoNewData {
                            cost: cost + spent,
                        },
                        SubjectOutcome::NotFound { .. } => {
                            let permanently_failed = self.record_permanent(subject).await;
                            SubjectOutcome::NotFound { permanently_failed }
                        }
                        other => other,
                    };
                }
                Err((err, cost)) if err.is_retryable() => {
                    spent += cost;
                    if attempt < self.config.transient_retry.max_retries {
                        let message = err.to_string();
                        reporter.report(BatchEvent::TransientRetry {
                            subject_id: subject.id,
                            attempt: attempt + 1,
                            error: &message,
                        });
                        tokio::time::sleep(self.config.transient_retry.delay_for(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    self.breaker.record_failure(&err);
                    let permanently_failed = self.record_permanent(subject).await;
                    break SubjectOutcome::TransientFailure {
                        error: err.to_string(),
                        permanently_failed,
                    };
                }
                Err((err, _)) => {
                    let permanently_failed = self.record_permanent(subject).await;
                    break SubjectOutcome::Invalid {
                        reason: err.to_string(),
                        permanently_failed,
                    };
                }
            }
        };

        report.outcome = outcome;
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        report
    }

    /// One enrichment + write attempt. Transient errors carry the cost spent.
    async fn attempt_subject(
        &self,
        run_id: Uuid,
        subject: &Subject,
        report: &mut SubjectReport,
    ) -> Result<SubjectOutcome, (AppError, f64)> {
        let outcome: EnrichmentOutcome = self.orchestrator.enrich(subject, &self.config.run).await;
        report.providers_attempted = outcome.providers_attempted.clone();
        report.stop_reason = Some(outcome.stop_reason.as_str().to_string());

        self.store_parse_failures(run_id, subject.id, &outcome).await;

        if outcome.all_transient() {
            let message = outcome
                .first_transient_error()
                .unwrap_or("all providers failed")
                .to_string();
            return Err((AppError::ProvidersUnavailable(message), outcome.total_cost));
        }

        if outcome.claims.is_empty() {
            if outcome.confirmed_absent() {
                return Ok(SubjectOutcome::NotFound {
                    permanently_failed: false,
                });
            }
            return Ok(SubjectOutcome::NoNewData {
                cost: outcome.total_cost,
            });
        }

        let update = build_update(subject.id, run_id, &outcome.claims, &outcome.results);
        let summary = self
            .store
            .apply(&update)
            .await
            .map_err(|e| (e, outcome.total_cost))?;

        if summary.updated() {
            Ok(SubjectOutcome::Updated {
                fields: summary.fields_written.len(),
                cost: outcome.total_cost,
            })
        } else {
            Ok(SubjectOutcome::NoNewData {
                cost: outcome.total_cost,
            })
        }
    }

    async fn store_parse_failures(&self, run_id: Uuid, subject_id: i64, outcome: &EnrichmentOutcome) {
        for result in &outcome.results {
            let Some(record) = NewFailureRecord::from_result(run_id, subject_id, result) else {
                continue;
            };
            if let Err(e) = self.store.record_failure(&record).await {
                tracing::warn!(
                    subject_id,
                    provider = %record.provider,
                    error = %e,
                    "Failed to store raw payload for replay"
                );
            }
        }
    }

    /// Record a permanent-class failure. Returns true if the subject is now
    /// permanently failed.
    async fn record_permanent(&self, subject: &Subject) -> bool {
        let attempts_after = subject.enrichment_attempts.saturating_add(1);
        let permanently_failed = self.config.retry_policy.exhausts(attempts_after);
        if let Err(e) = self
            .store
            .record_subject_failure(subject.id, Utc::now(), permanently_failed)
            .await
        {
            tracing::warn!(subject_id = subject.id, error = %e, "Failed to record subject failure");
        }
        permanently_failed
    }
}

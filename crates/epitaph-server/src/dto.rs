use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use epitaph_core::aggregate::CauseOfDeathPolicy;
use epitaph_core::batch::{BatchConfig, DEFAULT_RUN_TYPE};
use epitaph_core::error::AppError;
use epitaph_core::models::HistoryEntry;
use epitaph_core::orchestrator::RunConfig;
use epitaph_core::run::{RunCounters, RunProgress};

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CausePolicy {
    /// An AI answer beats a knowledge-base answer for cause of death
    #[default]
    AiFirst,
    /// Highest reliability tier wins
    TierOrder,
}

impl From<CausePolicy> for CauseOfDeathPolicy {
    fn from(policy: CausePolicy) -> Self {
        match policy {
            CausePolicy::AiFirst => CauseOfDeathPolicy::AiFirst,
            CausePolicy::TierOrder => CauseOfDeathPolicy::TierOrder,
        }
    }
}

/// Every field is optional; omitted fields take the batch defaults.
#[derive(Debug, Default, Deserialize, utoipa::ToSchema)]
#[serde(default)]
pub struct StartRunRequest {
    /// Checkpoint key (default "death_details")
    pub run_type: Option<String>,
    /// Maximum subjects to process
    pub limit: Option<u64>,
    pub subject_ids: Option<Vec<i64>>,
    /// Only subjects without a known cause of death (default true)
    pub only_missing: Option<bool>,
    /// Skip paid providers (default true)
    pub free_only: Option<bool>,
    pub use_ai: Option<bool>,
    pub follow_links: Option<bool>,
    pub max_cost_per_subject: Option<f64>,
    pub max_total_cost: Option<f64>,
    pub confidence_threshold: Option<f64>,
    pub require_corroboration: Option<bool>,
    pub cause_of_death_policy: Option<CausePolicy>,
    pub circuit_breaker_threshold: Option<u32>,
}

impl StartRunRequest {
    pub fn into_config(self) -> Result<BatchConfig, AppError> {
        if self.limit == Some(0) {
            return Err(AppError::ValidationError("limit must be at least 1".into()));
        }
        if self.run_type.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(AppError::ValidationError("run_type must not be blank".into()));
        }
        for (name, value) in [
            ("max_cost_per_subject", self.max_cost_per_subject),
            ("max_total_cost", self.max_total_cost),
        ] {
            if value.is_some_and(|v| !v.is_finite() || v < 0.0) {
                return Err(AppError::ValidationError(format!(
                    "{name} must be a non-negative number"
                )));
            }
        }
        if self
            .confidence_threshold
            .is_some_and(|c| !(0.0..=1.0).contains(&c))
        {
            return Err(AppError::ValidationError(
                "confidence_threshold must be between 0 and 1".into(),
            ));
        }

        let defaults = BatchConfig::default();
        let run_defaults = RunConfig::default();
        let use_ai = self.use_ai.unwrap_or(run_defaults.use_ai);
        let run = RunConfig {
            free_only: self.free_only.unwrap_or(!use_ai),
            use_ai,
            max_cost_per_subject: self
                .max_cost_per_subject
                .or(run_defaults.max_cost_per_subject),
            follow_links: self.follow_links.unwrap_or(run_defaults.follow_links),
            confidence_threshold: self
                .confidence_threshold
                .unwrap_or(run_defaults.confidence_threshold),
            require_corroboration: self
                .require_corroboration
                .unwrap_or(run_defaults.require_corroboration),
            cause_of_death_policy: self
                .cause_of_death_policy
                .map(Into::into)
                .unwrap_or(run_defaults.cause_of_death_policy),
            ..run_defaults
        };

        Ok(BatchConfig {
            run_type: self
                .run_type
                .map(|t| t.trim().to_string())
                .unwrap_or_else(|| DEFAULT_RUN_TYPE.to_string()),
            run,
            limit: self.limit,
            subject_ids: self.subject_ids,
            only_missing: self.only_missing.unwrap_or(defaults.only_missing),
            max_total_cost: self.max_total_cost,
            circuit_breaker_threshold: self
                .circuit_breaker_threshold
                .unwrap_or(defaults.circuit_breaker_threshold),
            ..defaults
        })
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct StartRunResponse {
    pub run_id: Uuid,
    pub run_type: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CountersResponse {
    pub processed: u64,
    pub updated: u64,
    pub no_data: u64,
    pub failed: u64,
    pub permanently_failed: u64,
    pub skipped: u64,
}

impl From<RunCounters> for CountersResponse {
    fn from(c: RunCounters) -> Self {
        Self {
            processed: c.processed,
            updated: c.updated,
            no_data: c.no_data,
            failed: c.failed,
            permanently_failed: c.permanently_failed,
            skipped: c.skipped,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RunProgressResponse {
    pub run_id: Uuid,
    pub run_type: String,
    pub status: String,
    pub processed_count: u64,
    pub total: Option<u64>,
    pub current_subject: Option<i64>,
    pub accumulated_cost: f64,
    pub estimated_time_remaining_secs: Option<u64>,
    pub counters: CountersResponse,
    pub exit_reason: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl From<RunProgress> for RunProgressResponse {
    fn from(p: RunProgress) -> Self {
        let estimate = p
            .estimate_remaining(Utc::now())
            .or(p.estimated_time_remaining_secs);
        Self {
            run_id: p.run_id,
            run_type: p.run_type,
            status: p.status.to_string(),
            processed_count: p.processed_count,
            total: p.total,
            current_subject: p.current_subject,
            accumulated_cost: p.accumulated_cost,
            estimated_time_remaining_secs: estimate,
            counters: p.counters.into(),
            exit_reason: p.exit_reason,
            started_at: p.started_at,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListRunsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RunListResponse {
    pub runs: Vec<RunProgressResponse>,
    pub total: usize,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct StopRunResponse {
    pub run_id: Uuid,
    pub stop_requested: bool,
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HistoryEntryResponse {
    pub id: i64,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub source: String,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl From<HistoryEntry> for HistoryEntryResponse {
    fn from(e: HistoryEntry) -> Self {
        Self {
            id: e.id,
            field: e.field,
            old_value: e.old_value,
            new_value: e.new_value,
            source: e.source,
            run_id: e.run_id,
            created_at: e.created_at,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HistoryResponse {
    pub subject_id: i64,
    pub entries: Vec<HistoryEntryResponse>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

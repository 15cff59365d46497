use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Stopped,
    Failed,
    /// Halted after too many consecutive transient failures.
    CircuitBroken,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::Failed => "failed",
            RunStatus::CircuitBroken => "circuit_broken",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    /// Process exit code for a run that ended in this status.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunStatus::CircuitBroken => 2,
            RunStatus::Failed => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "stopped" => Ok(RunStatus::Stopped),
            "failed" => Ok(RunStatus::Failed),
            "circuit_broken" => Ok(RunStatus::CircuitBroken),
            _ => Err(format!("Unknown run status: {s}")),
        }
    }
}

/// Per-outcome tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunCounters {
    pub processed: u64,
    pub updated: u64,
    pub no_data: u64,
    pub failed: u64,
    pub permanently_failed: u64,
    pub skipped: u64,
}

impl fmt::Display for RunCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} updated={} no_data={} failed={} permanently_failed={} skipped={}",
            self.processed,
            self.updated,
            self.no_data,
            self.failed,
            self.permanently_failed,
            self.skipped
        )
    }
}

/// A persisted batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRun {
    pub id: Uuid,
    pub run_type: String,
    pub status: RunStatus,
    pub config: serde_json::Value,
    pub counters: RunCounters,
    pub accumulated_cost: f64,
    pub current_subject: Option<i64>,
    pub exit_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl EnrichmentRun {
    pub fn new(id: Uuid, run_type: impl Into<String>, config: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            run_type: run_type.into(),
            status: RunStatus::Pending,
            config,
            counters: RunCounters::default(),
            accumulated_cost: 0.0,
            current_subject: None,
            exit_reason: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

/// Live snapshot of a run, shared between the controller and observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub run_id: Uuid,
    pub run_type: String,
    pub status: RunStatus,
    pub processed_count: u64,
    pub total: Option<u64>,
    pub current_subject: Option<i64>,
    pub accumulated_cost: f64,
    pub estimated_time_remaining_secs: Option<u64>,
    pub counters: RunCounters,
    pub exit_reason: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl RunProgress {
    pub fn new(run_id: Uuid, run_type: impl Into<String>) -> Self {
        Self {
            run_id,
            run_type: run_type.into(),
            status: RunStatus::Pending,
            processed_count: 0,
            total: None,
            current_subject: None,
            accumulated_cost: 0.0,
            estimated_time_remaining_secs: None,
            counters: RunCounters::default(),
            exit_reason: None,
            started_at: Utc::now(),
        }
    }

    /// Linear estimate from the average time per processed subject.
    pub fn estimate_remaining(&self, now: DateTime<Utc>) -> Option<u64> {
        let total = self.total?;
        if self.processed_count == 0 || self.status.is_terminal() {
            return None;
        }
        let elapsed = (now - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        let per_subject = elapsed / self.processed_count as f64;
        let remaining = total.saturating_sub(self.processed_count) as f64;
        Some((per_subject * remaining).round() as u64)
    }
}

impl From<&EnrichmentRun> for RunProgress {
    fn from(run: &EnrichmentRun) -> Self {
        Self {
            run_id: run.id,
            run_type: run.run_type.clone(),
            status: run.status,
            processed_count: run.counters.processed,
            total: None,
            current_subject: run.current_subject,
            accumulated_cost: run.accumulated_cost,
            estimated_time_remaining_secs: None,
            counters: run.counters,
            exit_reason: run.exit_reason.clone(),
            started_at: run.started_at,
        }
    }
}

//! Durable progress marker for resumable batch runs.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::RunCounters;

/// Progress of the latest run of one run type.
///
/// `processed_ids` only grows while a run is active; the checkpoint is
/// discarded only through an explicit clear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_type: String,
    pub run_id: Uuid,
    pub processed_ids: BTreeSet<i64>,
    pub last_processed_id: Option<i64>,
    pub counters: RunCounters,
    pub accumulated_cost: f64,
    /// Candidate cursor to resume pagination from.
    pub resume_token: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(run_type: impl Into<String>, run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_type: run_type.into(),
            run_id,
            processed_ids: BTreeSet::new(),
            last_processed_id: None,
            counters: RunCounters::default(),
            accumulated_cost: 0.0,
            resume_token: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Take over an existing checkpoint for a new run of the same type.
    pub fn resume(mut self, run_id: Uuid) -> Self {
        tracing::info!(
            run_type = %self.run_type,
            previous_run = %self.run_id,
            processed = self.processed_ids.len(),
            "Resuming from checkpoint"
        );
        self.run_id = run_id;
        self.completed_at = None;
        self.updated_at = Utc::now();
        self
    }

    pub fn is_processed(&self, subject_id: i64) -> bool {
        self.processed_ids.contains(&subject_id)
    }

    pub fn mark_processed(&mut self, subject_id: i64) {
        self.processed_ids.insert(subject_id);
        self.last_processed_id = Some(subject_id);
        self.updated_at = Utc::now();
    }

    pub fn add_cost(&mut self, cost: f64) {
        if cost > 0.0 {
            self.accumulated_cost += cost;
        }
    }

    /// Cursor stored in `resume_token`, if it parses.
    pub fn cursor(&self) -> Option<i64> {
        self.resume_token.as_deref().and_then(|t| t.parse().ok())
    }

    pub fn set_cursor(&mut self, after_id: i64) {
        self.resume_token = Some(after_id.to_string());
    }

    pub fn complete(&mut self) {
        let now = Utc::now();
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}

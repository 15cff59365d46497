//! Re-parse stored raw payloads without querying providers again.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::{MergeOptions, merge_claims};
use crate::error::AppError;
use crate::provenance::build_update;
use crate::provider::ProviderRegistry;
use crate::traits::{EnrichmentWriter, FailureStore, SubjectSource};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayOptions {
    /// Only failures from this provider.
    pub provider: Option<String>,
    pub limit: usize,
    pub merge: MergeOptions,
    /// Parse and report without writing or marking anything.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaySummary {
    pub examined: usize,
    pub recovered: usize,
    pub still_failing: usize,
    /// Provider no longer configured or subject gone; left unprocessed.
    pub skipped: usize,
    pub subjects_updated: usize,
}

/// Replay up to `options.limit` unprocessed failures through their provider's
/// payload parser and the normal writer.
pub async fn replay_failures<S>(
    registry: &ProviderRegistry,
    store: &S,
    run_id: Uuid,
    options: &ReplayOptions,
) -> Result<ReplaySummary, AppError>
where
    S: FailureStore + SubjectSource + EnrichmentWriter,
{
    let failures = store
        .unprocessed_failures(options.provider.as_deref(), options.limit)
        .await?;
    let mut summary = ReplaySummary {
        examined: failures.len(),
        ..Default::default()
    };

    for failure in failures {
        let Some(provider) = registry.get(&failure.provider) else {
            tracing::warn!(failure_id = %failure.id, provider = %failure.provider, "Provider not configured, skipping");
            summary.skipped += 1;
            continue;
        };
        let Some(subject) = store.get_subject(failure.subject_id).await? else {
            tracing::warn!(failure_id = %failure.id, subject_id = failure.subject_id, "Subject missing, skipping");
            summary.skipped += 1;
            continue;
        };

        let result = provider.replay(&subject, &failure.raw_payload);
        if !result.success() {
            let message = result.error().unwrap_or("no data").to_string();
            tracing::info!(failure_id = %failure.id, error = %message, "Payload still fails to parse");
            summary.still_failing += 1;
            if !options.dry_run {
                store.record_replay_attempt(failure.id, &message).await?;
            }
            continue;
        }

        summary.recovered += 1;
        if options.dry_run {
            continue;
        }

        let results = vec![result];
        let merged = merge_claims(&results, &options.merge);
        let update = build_update(subject.id, run_id, &merged, &results);
        let written = store.apply(&update).await?;
        if written.updated() {
            summary.subjects_updated += 1;
        }
        store.mark_reprocessed(failure.id, "recovered").await?;
        tracing::info!(
            failure_id = %failure.id,
            subject_id = subject.id,
            fields = written.fields_written.len(),
            "Replayed payload"
        );
    }

    Ok(summary)
}

//! What gets written for a subject, and how merged claims become a write.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::MergedClaims;
use crate::models::{ClaimField, LookupResult, Project, RelatedPerson, SourceEntry};

/// A primary field value proposed for the subject row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldWrite {
    pub field: ClaimField,
    pub value: String,
    /// Provider name recorded in history.
    pub source: String,
    pub confidence: f64,
}

/// Satellite row with everything that does not live on the subject.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    pub subject_id: i64,
    pub circumstances: Option<String>,
    pub rumored_circumstances: Option<String>,
    pub notable_factors: Vec<String>,
    pub related_people: Vec<RelatedPerson>,
    pub career_status_at_death: Option<String>,
    pub last_project: Option<Project>,
    pub posthumous_releases: Vec<Project>,
    pub citations: Vec<String>,
    pub sources: Vec<SourceEntry>,
    /// Raw debug payloads keyed by provider.
    pub raw_payloads: BTreeMap<String, serde_json::Value>,
    pub overall_confidence: Option<f64>,
    pub run_id: Option<Uuid>,
}

impl EnrichmentRecord {
    /// Carries at least one non-primary fact.
    pub fn has_content(&self) -> bool {
        self.circumstances.is_some()
            || self.rumored_circumstances.is_some()
            || self.career_status_at_death.is_some()
            || self.last_project.is_some()
            || !self.notable_factors.is_empty()
            || !self.related_people.is_empty()
            || !self.posthumous_releases.is_empty()
    }

    /// This record laid over the stored one: new values win, lists are only
    /// replaced by non-empty lists.
    pub fn merged_onto(&self, previous: Option<&EnrichmentRecord>) -> EnrichmentRecord {
        let Some(prev) = previous else {
            return self.clone();
        };
        EnrichmentRecord {
            subject_id: self.subject_id,
            circumstances: self.circumstances.clone().or_else(|| prev.circumstances.clone()),
            rumored_circumstances: self
                .rumored_circumstances
                .clone()
                .or_else(|| prev.rumored_circumstances.clone()),
            notable_factors: pick_list(&self.notable_factors, &prev.notable_factors),
            related_people: pick_list(&self.related_people, &prev.related_people),
            career_status_at_death: self
                .career_status_at_death
                .clone()
                .or_else(|| prev.career_status_at_death.clone()),
            last_project: self.last_project.clone().or_else(|| prev.last_project.clone()),
            posthumous_releases: pick_list(&self.posthumous_releases, &prev.posthumous_releases),
            citations: pick_list(&self.citations, &prev.citations),
            sources: self.sources.clone(),
            raw_payloads: self.raw_payloads.clone(),
            overall_confidence: self.overall_confidence.or(prev.overall_confidence),
            run_id: self.run_id.or(prev.run_id),
        }
    }
}

fn pick_list<T: Clone>(new: &[T], old: &[T]) -> Vec<T> {
    if new.is_empty() { old.to_vec() } else { new.to_vec() }
}

/// Narrative fields whose value differs between the stored record and its
/// replacement, as `(field, old, new)`. Each one gets a history row.
pub fn narrative_changes(
    previous: Option<&EnrichmentRecord>,
    merged: &EnrichmentRecord,
) -> Vec<(ClaimField, Option<String>, Option<String>)> {
    let scalars = [
        (
            ClaimField::Circumstances,
            previous.and_then(|r| r.circumstances.clone()),
            merged.circumstances.clone(),
        ),
        (
            ClaimField::RumoredCircumstances,
            previous.and_then(|r| r.rumored_circumstances.clone()),
            merged.rumored_circumstances.clone(),
        ),
        (
            ClaimField::CareerStatus,
            previous.and_then(|r| r.career_status_at_death.clone()),
            merged.career_status_at_death.clone(),
        ),
        (
            ClaimField::LastProject,
            previous.and_then(|r| r.last_project.as_ref().map(ToString::to_string)),
            merged.last_project.as_ref().map(ToString::to_string),
        ),
    ];
    scalars.into_iter().filter(|(_, old, new)| old != new).collect()
}

/// Source label recorded in history for satellite fields.
pub const SATELLITE_SOURCE: &str = "enrichment";

/// Everything the writer applies for one subject in one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectUpdate {
    pub subject_id: i64,
    pub run_id: Uuid,
    pub primary: Vec<FieldWrite>,
    pub record: EnrichmentRecord,
}

impl SubjectUpdate {
    pub fn has_content(&self) -> bool {
        !self.primary.is_empty() || self.record.has_content()
    }
}

/// What the writer actually changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteSummary {
    pub fields_written: Vec<ClaimField>,
    /// Fields that already had a value and were left alone.
    pub fields_skipped: Vec<ClaimField>,
    pub history_rows: usize,
    /// The satellite record changed.
    pub record_upserted: bool,
}

impl WriteSummary {
    pub fn updated(&self) -> bool {
        !self.fields_written.is_empty() || self.record_upserted
    }
}

/// Turn merged claims into the write for one subject.
pub fn build_update(
    subject_id: i64,
    run_id: Uuid,
    merged: &MergedClaims,
    results: &[LookupResult],
) -> SubjectUpdate {
    let primary = merged
        .claims
        .values()
        .filter(|c| c.field.is_primary())
        .map(|c| FieldWrite {
            field: c.field,
            value: c.value.clone(),
            source: c.source.provider.clone(),
            confidence: c.confidence,
        })
        .collect();

    let raw_payloads = results
        .iter()
        .filter_map(|r| Some((r.source.provider.clone(), r.source.raw.clone()?)))
        .collect();

    let record = EnrichmentRecord {
        subject_id,
        circumstances: merged.value(ClaimField::Circumstances).map(str::to_string),
        rumored_circumstances: merged
            .value(ClaimField::RumoredCircumstances)
            .map(str::to_string),
        notable_factors: merged.notable_factors.clone(),
        related_people: merged.related_people.clone(),
        career_status_at_death: merged.value(ClaimField::CareerStatus).map(str::to_string),
        last_project: merged.last_project.clone(),
        posthumous_releases: merged.posthumous_releases.clone(),
        citations: merged.citations.clone(),
        sources: results.iter().map(|r| r.source.clone()).collect(),
        raw_payloads,
        overall_confidence: merged.overall_confidence,
        run_id: Some(run_id),
    };

    SubjectUpdate {
        subject_id,
        run_id,
        primary,
        record,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{MergeOptions, merge_claims};
    use crate::models::DeathDetails;
    use crate::provider::{ProviderFamily, ReliabilityTier};
    use crate::testutil::result_from;

    #[test]
    fn test_build_update_splits_primary_and_satellite() {
        let details = DeathDetails {
            cause_of_death: Some("lung cancer".into()),
            location_of_death: Some("Los Angeles, California".into()),
            circumstances: Some("Died in hospice care".into()),
            notable_factors: vec!["smoker".into()],
            ..Default::default()
        };
        let mut result = result_from(
            "apnews",
            ProviderFamily::SiteSearch,
            ReliabilityTier::Primary,
            0.9,
            details,
        );
        result.source.raw = Some(serde_json::json!({"html_len": 1200}));
        let results = vec![result];
        let merged = merge_claims(&results, &MergeOptions::default());
        let run_id = Uuid::new_v4();

        let update = build_update(7, run_id, &merged, &results);
        let fields: Vec<ClaimField> = update.primary.iter().map(|w| w.field).collect();
        assert_eq!(fields, vec![ClaimField::CauseOfDeath, ClaimField::DeathLocation]);
        assert!(update.primary.iter().all(|w| w.source == "apnews"));
        assert_eq!(update.record.circumstances.as_deref(), Some("Died in hospice care"));
        assert_eq!(update.record.notable_factors, vec!["smoker"]);
        assert_eq!(update.record.sources.len(), 1);
        assert!(update.record.raw_payloads.contains_key("apnews"));
        assert_eq!(update.record.run_id, Some(run_id));
        assert!(update.has_content());
    }

    #[test]
    fn test_merged_onto_keeps_stored_lists_and_reports_changes() {
        let stored = EnrichmentRecord {
            subject_id: 1,
            circumstances: Some("Collapsed on stage".into()),
            notable_factors: vec!["sudden".into()],
            ..Default::default()
        };
        let incoming = EnrichmentRecord {
            subject_id: 1,
            circumstances: Some("Collapsed during a concert".into()),
            career_status_at_death: Some("active".into()),
            ..Default::default()
        };
        let merged = incoming.merged_onto(Some(&stored));
        assert_eq!(merged.notable_factors, vec!["sudden"]);
        assert_eq!(merged.circumstances.as_deref(), Some("Collapsed during a concert"));

        let changes = narrative_changes(Some(&stored), &merged);
        let fields: Vec<ClaimField> = changes.iter().map(|c| c.0).collect();
        assert_eq!(fields, vec![ClaimField::Circumstances, ClaimField::CareerStatus]);
        assert!(narrative_changes(Some(&merged), &merged).is_empty());
    }

    #[test]
    fn test_empty_merge_has_no_content() {
        let merged = MergedClaims::default();
        let update = build_update(1, Uuid::new_v4(), &merged, &[]);
        assert!(!update.has_content());
    }
}

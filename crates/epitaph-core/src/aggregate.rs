//! Merging partial, conflicting provider answers into one record.
//!
//! For each [`ClaimField`] the candidates are the successful results that
//! carry a value. The winner is chosen by tier, then citations, then source
//! confidence, then invocation order. Its confidence is the noisy-OR of every
//! candidate that agrees with it.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::models::{ClaimField, LookupResult, Project, RelatedPerson, SourceEntry, clamp_confidence};
use crate::provider::{ProviderFamily, ReliabilityTier};

/// How the cause of death is chosen when an AI model and a structured
/// knowledge base disagree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CauseOfDeathPolicy {
    /// A non-empty AI answer beats a structured knowledge base answer.
    #[default]
    AiFirst,
    /// The general tier rule.
    TierOrder,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeOptions {
    /// Drop narrative claims below `Trade` unless a structured knowledge
    /// base succeeded for the subject.
    pub require_corroboration: bool,
    pub cause_of_death_policy: CauseOfDeathPolicy,
}

/// The merged decision for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedClaim {
    pub field: ClaimField,
    pub value: String,
    pub source: SourceEntry,
    /// Every source that proposed a value for this field.
    pub contributors: Vec<SourceEntry>,
    /// Sources agreeing with the chosen value, winner included.
    pub agreeing: usize,
    pub confidence: f64,
}

/// Output of [`merge_claims`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedClaims {
    pub claims: BTreeMap<ClaimField, AggregatedClaim>,
    pub notable_factors: Vec<String>,
    pub related_people: Vec<RelatedPerson>,
    pub posthumous_releases: Vec<Project>,
    pub citations: Vec<String>,
    /// Structured form of the winning last-project claim.
    pub last_project: Option<Project>,
    /// Successful results that fed the merge.
    pub contributing_results: usize,
    /// Mean claim confidence; `None` when nothing contributed.
    pub overall_confidence: Option<f64>,
}

impl MergedClaims {
    pub fn get(&self, field: ClaimField) -> Option<&AggregatedClaim> {
        self.claims.get(&field)
    }

    pub fn value(&self, field: ClaimField) -> Option<&str> {
        self.get(field).map(|c| c.value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
            && self.notable_factors.is_empty()
            && self.related_people.is_empty()
            && self.posthumous_releases.is_empty()
    }

    /// Every field in `required` has a claim at or above `threshold`.
    pub fn satisfies(&self, required: &[ClaimField], threshold: f64) -> bool {
        required
            .iter()
            .all(|f| self.get(*f).is_some_and(|c| c.confidence >= threshold))
    }
}

struct Candidate<'a> {
    order: usize,
    value: String,
    result: &'a LookupResult,
}

impl Candidate<'_> {
    fn source(&self) -> &SourceEntry {
        &self.result.source
    }

    fn has_citations(&self) -> bool {
        self.result.data().is_some_and(|d| d.has_citations())
    }
}

pub fn merge_claims(results: &[LookupResult], options: &MergeOptions) -> MergedClaims {
    let successes: Vec<(usize, &LookupResult)> = results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.success())
        .collect();

    let mut merged = MergedClaims {
        contributing_results: successes.len(),
        ..Default::default()
    };
    if successes.is_empty() {
        return merged;
    }

    let knowledge_base_succeeded = successes
        .iter()
        .any(|(_, r)| r.source.family == ProviderFamily::StructuredKnowledgeBase);

    for field in ClaimField::ALL {
        let mut candidates: Vec<Candidate<'_>> = successes
            .iter()
            .filter_map(|(order, result)| {
                let value = result.data()?.field(field)?;
                Some(Candidate {
                    order: *order,
                    value: value.trim().to_string(),
                    result,
                })
            })
            .collect();
        if candidates.is_empty() {
            continue;
        }

        rank(&mut candidates);
        let mut winner = 0;
        if field == ClaimField::CauseOfDeath
            && options.cause_of_death_policy == CauseOfDeathPolicy::AiFirst
            && candidates[0].source().family == ProviderFamily::StructuredKnowledgeBase
            && let Some(ai) = candidates
                .iter()
                .position(|c| c.source().family == ProviderFamily::AiModel)
        {
            winner = ai;
        }

        let chosen = &candidates[winner];
        if options.require_corroboration
            && field.is_narrative()
            && chosen.source().tier < ReliabilityTier::Trade
            && !knowledge_base_succeeded
        {
            tracing::debug!(
                field = %field,
                provider = %chosen.source().provider,
                "Dropping uncorroborated claim"
            );
            continue;
        }

        let agreeing: Vec<&Candidate<'_>> = candidates
            .iter()
            .filter(|c| values_agree(&c.value, &chosen.value))
            .collect();
        let confidence = noisy_or(agreeing.iter().map(|c| c.source().confidence));

        if field == ClaimField::LastProject {
            merged.last_project = chosen.result.data().and_then(|d| d.last_project.clone());
        }

        merged.claims.insert(
            field,
            AggregatedClaim {
                field,
                value: chosen.value.clone(),
                source: chosen.source().clone(),
                contributors: candidates.iter().map(|c| c.source().clone()).collect(),
                agreeing: agreeing.len(),
                confidence,
            },
        );
    }

    for (_, result) in &successes {
        let Some(data) = result.data() else { continue };
        union_strings(&mut merged.notable_factors, &data.notable_factors);
        union_strings(&mut merged.citations, &data.citations);
        for person in &data.related_people {
            if !merged
                .related_people
                .iter()
                .any(|p| normalize(&p.name) == normalize(&person.name))
            {
                merged.related_people.push(person.clone());
            }
        }
        for project in &data.posthumous_releases {
            if !merged
                .posthumous_releases
                .iter()
                .any(|p| normalize(&p.title) == normalize(&project.title))
            {
                merged.posthumous_releases.push(project.clone());
            }
        }
    }

    if !merged.claims.is_empty() {
        let sum: f64 = merged.claims.values().map(|c| c.confidence).sum();
        merged.overall_confidence = Some(clamp_confidence(sum / merged.claims.len() as f64));
    }
    merged
}

/// Tier desc, citations first, confidence desc, earlier invocation first.
fn rank(candidates: &mut [Candidate<'_>]) {
    candidates.sort_by(|a, b| {
        b.source()
            .tier
            .cmp(&a.source().tier)
            .then(b.has_citations().cmp(&a.has_citations()))
            .then(b.source().confidence.total_cmp(&a.source().confidence))
            .then(a.order.cmp(&b.order))
    });
}

/// `1 - Π(1 - c)`, clamped to [0, 1].
pub fn noisy_or(confidences: impl IntoIterator<Item = f64>) -> f64 {
    let miss: f64 = confidences
        .into_iter()
        .map(|c| 1.0 - clamp_confidence(c))
        .product();
    clamp_confidence(1.0 - miss)
}

/// Case/whitespace-insensitive equality or containment.
pub fn values_agree(a: &str, b: &str) -> bool {
    let (a, b) = (normalize(a), normalize(b));
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || a.contains(&b) || b.contains(&a)
}

fn normalize(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(['.', ',', ';'])
        .to_lowercase()
}

fn union_strings(target: &mut Vec<String>, incoming: &[String]) {
    let mut seen: HashSet<String> = target.iter().map(|s| normalize(s)).collect();
    for value in incoming {
        let key = normalize(value);
        if !key.is_empty() && seen.insert(key) {
            target.push(value.trim().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::models::{DeathDetails, LookupFailure};
    use crate::testutil::result_from;

    fn cause(value: &str) -> DeathDetails {
        DeathDetails {
            cause_of_death: Some(value.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_input_has_no_confidence() {
        let merged = merge_claims(&[], &MergeOptions::default());
        assert!(merged.claims.is_empty());
        assert_eq!(merged.overall_confidence, None);
    }

    #[test]
    fn test_failures_are_ignored() {
        let failed = LookupResult::failed(
            result_from("apnews", ProviderFamily::SiteSearch, ReliabilityTier::Primary, 0.9, cause("x")).source,
            LookupFailure::new(FailureKind::NotFound, "nothing"),
        );
        let merged = merge_claims(&[failed], &MergeOptions::default());
        assert_eq!(merged.contributing_results, 0);
        assert!(merged.claims.is_empty());
    }

    #[test]
    fn test_higher_tier_wins_disagreement() {
        let results = vec![
            result_from("wikipedia", ProviderFamily::Encyclopedia, ReliabilityTier::Secondary, 0.6, cause("stroke")),
            result_from("apnews", ProviderFamily::SiteSearch, ReliabilityTier::Primary, 0.9, cause("heart attack")),
        ];
        let merged = merge_claims(&results, &MergeOptions::default());
        let claim = merged.get(ClaimField::CauseOfDeath).unwrap();
        assert_eq!(claim.value, "heart attack");
        assert_eq!(claim.source.provider, "apnews");
        assert_eq!(claim.contributors.len(), 2);
        assert_eq!(claim.agreeing, 1);
        assert!((claim.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_citations_break_tier_ties() {
        let mut cited = cause("cancer");
        cited.citations = vec!["https://example.org/obit".into()];
        let results = vec![
            result_from("deadline", ProviderFamily::SiteSearch, ReliabilityTier::Trade, 0.95, cause("pneumonia")),
            result_from("variety", ProviderFamily::SiteSearch, ReliabilityTier::Trade, 0.7, cited),
        ];
        let merged = merge_claims(&results, &MergeOptions::default());
        assert_eq!(merged.value(ClaimField::CauseOfDeath), Some("cancer"));
    }

    #[test]
    fn test_confidence_then_order_break_remaining_ties() {
        let results = vec![
            result_from("a", ProviderFamily::SiteSearch, ReliabilityTier::Trade, 0.7, cause("first")),
            result_from("b", ProviderFamily::SiteSearch, ReliabilityTier::Trade, 0.8, cause("second")),
            result_from("c", ProviderFamily::SiteSearch, ReliabilityTier::Trade, 0.8, cause("third")),
        ];
        let merged = merge_claims(&results, &MergeOptions::default());
        assert_eq!(merged.value(ClaimField::CauseOfDeath), Some("second"));
    }

    #[test]
    fn test_agreeing_sources_raise_confidence() {
        let results = vec![
            result_from("apnews", ProviderFamily::SiteSearch, ReliabilityTier::Primary, 0.9, cause("Heart  attack.")),
            result_from("variety", ProviderFamily::SiteSearch, ReliabilityTier::Trade, 0.8, cause("heart attack")),
            result_from("legacy", ProviderFamily::SiteSearch, ReliabilityTier::Secondary, 0.6, cause("a sudden heart attack at home")),
        ];
        let merged = merge_claims(&results, &MergeOptions::default());
        let claim = merged.get(ClaimField::CauseOfDeath).unwrap();
        assert_eq!(claim.agreeing, 3);
        // 1 - 0.1 * 0.2 * 0.4
        assert!((claim.confidence - 0.992).abs() < 1e-9);
        assert!(claim.confidence <= 1.0);
    }

    #[test]
    fn test_ai_first_overrides_knowledge_base() {
        let results = vec![
            result_from("wikidata", ProviderFamily::StructuredKnowledgeBase, ReliabilityTier::Trade, 0.8, cause("myocardial infarction")),
            result_from("openai", ProviderFamily::AiModel, ReliabilityTier::AiInference, 0.5, cause("complications of surgery")),
        ];
        let merged = merge_claims(&results, &MergeOptions::default());
        assert_eq!(
            merged.value(ClaimField::CauseOfDeath),
            Some("complications of surgery")
        );

        let tier_order = MergeOptions {
            cause_of_death_policy: CauseOfDeathPolicy::TierOrder,
            ..Default::default()
        };
        let merged = merge_claims(&results, &tier_order);
        assert_eq!(
            merged.value(ClaimField::CauseOfDeath),
            Some("myocardial infarction")
        );
    }

    #[test]
    fn test_ai_first_does_not_override_primary_press() {
        let results = vec![
            result_from("apnews", ProviderFamily::SiteSearch, ReliabilityTier::Primary, 0.9, cause("cancer")),
            result_from("openai", ProviderFamily::AiModel, ReliabilityTier::AiInference, 0.5, cause("stroke")),
        ];
        let merged = merge_claims(&results, &MergeOptions::default());
        assert_eq!(merged.value(ClaimField::CauseOfDeath), Some("cancer"));
    }

    #[test]
    fn test_corroboration_drops_low_tier_narrative() {
        let details = DeathDetails {
            circumstances: Some("Died at home surrounded by family".into()),
            cause_of_death: Some("cancer".into()),
            ..Default::default()
        };
        let results = vec![result_from(
            "brave_search",
            ProviderFamily::WebSearch,
            ReliabilityTier::Secondary,
            0.6,
            details.clone(),
        )];
        let options = MergeOptions {
            require_corroboration: true,
            ..Default::default()
        };
        let merged = merge_claims(&results, &options);
        assert!(merged.get(ClaimField::Circumstances).is_none());
        // Non-narrative fields are unaffected.
        assert!(merged.get(ClaimField::CauseOfDeath).is_some());

        let mut with_kb = results.clone();
        with_kb.push(result_from(
            "wikidata",
            ProviderFamily::StructuredKnowledgeBase,
            ReliabilityTier::Trade,
            0.8,
            cause("cancer"),
        ));
        let merged = merge_claims(&with_kb, &options);
        assert!(merged.get(ClaimField::Circumstances).is_some());
    }

    #[test]
    fn test_lists_are_unioned_case_insensitively() {
        let a = DeathDetails {
            notable_factors: vec!["Overdose".into(), "accidental".into()],
            citations: vec!["https://a.example/1".into()],
            related_people: vec![RelatedPerson {
                name: "John Smith".into(),
                relationship: "spouse".into(),
                details: None,
            }],
            ..Default::default()
        };
        let b = DeathDetails {
            notable_factors: vec!["overdose".into(), "Investigation".into()],
            citations: vec!["https://a.example/1".into(), "https://b.example/2".into()],
            related_people: vec![RelatedPerson {
                name: "john smith".into(),
                relationship: "husband".into(),
                details: None,
            }],
            ..Default::default()
        };
        let results = vec![
            result_from("x", ProviderFamily::SiteSearch, ReliabilityTier::Trade, 0.8, a),
            result_from("y", ProviderFamily::SiteSearch, ReliabilityTier::Trade, 0.8, b),
        ];
        let merged = merge_claims(&results, &MergeOptions::default());
        assert_eq!(
            merged.notable_factors,
            vec!["Overdose", "accidental", "Investigation"]
        );
        assert_eq!(merged.citations.len(), 2);
        assert_eq!(merged.related_people.len(), 1);
    }

    #[test]
    fn test_satisfies_threshold() {
        let results = vec![result_from(
            "apnews",
            ProviderFamily::SiteSearch,
            ReliabilityTier::Primary,
            0.9,
            cause("cancer"),
        )];
        let merged = merge_claims(&results, &MergeOptions::default());
        assert!(merged.satisfies(&[ClaimField::CauseOfDeath], 0.5));
        assert!(!merged.satisfies(&[ClaimField::CauseOfDeath, ClaimField::Circumstances], 0.5));
        assert!(!merged.satisfies(&[ClaimField::CauseOfDeath], 0.95));
    }

    #[test]
    fn test_values_agree() {
        assert!(values_agree("Heart Attack", "heart   attack."));
        assert!(values_agree("cancer", "pancreatic cancer"));
        assert!(!values_agree("stroke", "cancer"));
        assert!(!values_agree("", "cancer"));
    }

    #[test]
    fn test_noisy_or_bounds() {
        assert_eq!(noisy_or([]), 0.0);
        assert!((noisy_or([0.5, 0.5]) - 0.75).abs() < 1e-9);
        assert_eq!(noisy_or([1.0, 0.2]), 1.0);
        assert_eq!(noisy_or([2.0]), 1.0);
    }
}

//! Per-subject enrichment: invoke providers in priority order, recover
//! blocked pages, merge, and decide when to stop.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::aggregate::{CauseOfDeathPolicy, MergeOptions, MergedClaims, merge_claims};
use crate::error::FailureKind;
use crate::models::{ClaimField, FallbackOutcome, LookupResult, Subject};
use crate::provider::{Provider, ProviderRegistry};
use crate::traits::FallbackFetcher;

/// Per-run enrichment settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Skip every paid provider.
    pub free_only: bool,
    /// Allow AI model providers and the AI link extractor.
    pub use_ai: bool,
    /// USD ceiling per subject. `None` means unbounded.
    pub max_cost_per_subject: Option<f64>,
    pub follow_links: bool,
    pub max_links: usize,
    pub max_link_cost: f64,
    pub stop_on_sufficient: bool,
    pub confidence_threshold: f64,
    pub required_fields: Vec<ClaimField>,
    pub require_corroboration: bool,
    pub cause_of_death_policy: CauseOfDeathPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            free_only: true,
            use_ai: false,
            max_cost_per_subject: Some(0.25),
            follow_links: false,
            max_links: 3,
            max_link_cost: 0.05,
            stop_on_sufficient: true,
            confidence_threshold: 0.5,
            required_fields: vec![ClaimField::CauseOfDeath, ClaimField::Circumstances],
            require_corroboration: false,
            cause_of_death_policy: CauseOfDeathPolicy::AiFirst,
        }
    }
}

impl RunConfig {
    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            require_corroboration: self.require_corroboration,
            cause_of_death_policy: self.cause_of_death_policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every eligible provider was consulted.
    Exhausted,
    /// Every required field reached the confidence threshold.
    Sufficient,
    /// The next provider would have crossed the per-subject budget.
    BudgetExceeded,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Exhausted => "exhausted",
            StopReason::Sufficient => "sufficient",
            StopReason::BudgetExceeded => "budget_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentOutcome {
    pub subject_id: i64,
    pub results: Vec<LookupResult>,
    pub claims: MergedClaims,
    pub total_cost: f64,
    pub stop_reason: StopReason,
    pub providers_attempted: Vec<String>,
}

impl EnrichmentOutcome {
    /// At least one provider ran and every one failed transiently.
    pub fn all_transient(&self) -> bool {
        !self.results.is_empty()
            && self
                .results
                .iter()
                .all(|r| r.failure_kind() == Some(FailureKind::Transient))
    }

    /// Nothing succeeded and at least one source confirmed it has no record.
    pub fn confirmed_absent(&self) -> bool {
        !self.results.iter().any(LookupResult::success)
            && self
                .results
                .iter()
                .any(|r| r.failure_kind() == Some(FailureKind::NotFound))
    }

    /// First transient failure message, for error reporting.
    pub fn first_transient_error(&self) -> Option<&str> {
        self.results
            .iter()
            .find(|r| r.failure_kind() == Some(FailureKind::Transient))
            .and_then(LookupResult::error)
    }
}

/// Drives providers for one subject.
pub struct EnrichmentOrchestrator<FF> {
    registry: Arc<ProviderRegistry>,
    fallback: FF,
}

impl<FF: FallbackFetcher> EnrichmentOrchestrator<FF> {
    pub fn new(registry: Arc<ProviderRegistry>, fallback: FF) -> Self {
        Self { registry, fallback }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Enrich one subject. Individual provider failures are recorded in the
    /// results; this never fails and never mutates the subject.
    pub async fn enrich(&self, subject: &Subject, config: &RunConfig) -> EnrichmentOutcome {
        let providers = self.registry.prioritized(config);
        let options = config.merge_options();

        let mut results: Vec<LookupResult> = Vec::new();
        let mut attempted: Vec<String> = Vec::new();
        let mut total_cost = 0.0;
        let mut stop_reason = StopReason::Exhausted;

        tracing::info!(
            subject_id = subject.id,
            name = %subject.name,
            providers = providers.len(),
            "Enriching subject"
        );

        for provider in &providers {
            let descriptor = provider.descriptor();
            if exceeds(config.max_cost_per_subject, total_cost, descriptor.cost_per_query) {
                tracing::info!(
                    subject_id = subject.id,
                    provider = %descriptor.name,
                    spent = total_cost,
                    "Per-subject budget reached"
                );
                stop_reason = StopReason::BudgetExceeded;
                break;
            }

            attempted.push(descriptor.name.clone());
            let mut result = provider.lookup(subject).await;
            total_cost += result.source.cost;

            if provider.supports_recovery()
                && let Some(url) = result.blocked_url().map(str::to_string)
            {
                result = self.recover_blocked(provider.as_ref(), subject, &url, result).await;
            }

            let succeeded = result.success();
            results.push(result);

            if succeeded
                && config.stop_on_sufficient
                && merge_claims(&results, &options)
                    .satisfies(&config.required_fields, config.confidence_threshold)
            {
                tracing::info!(
                    subject_id = subject.id,
                    provider = %descriptor.name,
                    "Required fields satisfied"
                );
                stop_reason = StopReason::Sufficient;
                break;
            }

            // Token-priced providers report actual spend, which can exceed
            // their estimate.
            if exceeds(config.max_cost_per_subject, total_cost, 0.0) {
                tracing::warn!(
                    subject_id = subject.id,
                    provider = %descriptor.name,
                    spent = total_cost,
                    "Per-subject budget overspent"
                );
                stop_reason = StopReason::BudgetExceeded;
                break;
            }
        }

        if config.follow_links && stop_reason != StopReason::Sufficient {
            let link_cost = self
                .follow_links(subject, config, &mut results, &mut attempted, total_cost)
                .await;
            total_cost += link_cost;
        }
        let claims = merge_claims(&results, &options);

        tracing::info!(
            subject_id = subject.id,
            stop_reason = stop_reason.as_str(),
            claims = claims.claims.len(),
            cost = total_cost,
            "Subject enrichment finished"
        );

        EnrichmentOutcome {
            subject_id: subject.id,
            results,
            claims,
            total_cost,
            stop_reason,
            providers_attempted: attempted,
        }
    }

    /// Route a blocked URL through the fallback chain and let the provider
    /// parse whatever comes back. Keeps the blocked result when nothing does.
    async fn recover_blocked(
        &self,
        provider: &dyn Provider,
        subject: &Subject,
        url: &str,
        blocked: LookupResult,
    ) -> LookupResult {
        match self.fallback.fetch_with_fallback(url).await {
            FallbackOutcome::Recovered(page) => {
                tracing::info!(
                    subject_id = subject.id,
                    provider = %provider.descriptor().name,
                    method = %page.method,
                    url,
                    "Recovered blocked page"
                );
                let mut recovered = provider.recover(subject, &page).await;
                recovered.source.cost += blocked.source.cost;
                recovered.source.elapsed_ms += blocked.source.elapsed_ms;
                recovered
            }
            FallbackOutcome::Unavailable { attempts } => {
                tracing::info!(
                    subject_id = subject.id,
                    provider = %provider.descriptor().name,
                    url,
                    attempts = attempts.len(),
                    "Blocked page could not be recovered"
                );
                blocked
            }
        }
    }

    /// Second pass over cited URLs. Returns the cost spent.
    async fn follow_links(
        &self,
        subject: &Subject,
        config: &RunConfig,
        results: &mut Vec<LookupResult>,
        attempted: &mut Vec<String>,
        spent_before: f64,
    ) -> f64 {
        let parsers = self.registry.link_parsers(config);
        if parsers.is_empty() || config.max_links == 0 {
            return 0.0;
        }

        let mut seen: HashSet<String> = results
            .iter()
            .filter_map(|r| r.source.url.clone())
            .collect();
        let links: Vec<String> = results
            .iter()
            .filter_map(LookupResult::data)
            .flat_map(|d| d.citations.iter())
            .filter(|u| u.starts_with("http"))
            .filter(|u| seen.insert((*u).clone()))
            .take(config.max_links)
            .cloned()
            .collect();

        let mut link_cost = 0.0;
        for link in links {
            let FallbackOutcome::Recovered(page) = self.fallback.fetch_with_fallback(&link).await
            else {
                tracing::debug!(subject_id = subject.id, url = %link, "Link unavailable");
                continue;
            };

            for parser in &parsers {
                let estimate = parser.descriptor().cost_per_query;
                if link_cost + estimate > config.max_link_cost
                    || exceeds(config.max_cost_per_subject, spent_before + link_cost, estimate)
                {
                    continue;
                }
                let name = parser.descriptor().name.clone();
                if !attempted.contains(&name) {
                    attempted.push(name);
                }
                let result = parser.recover(subject, &page).await;
                link_cost += result.source.cost;
                let succeeded = result.success();
                results.push(result);
                if succeeded {
                    break;
                }
            }
        }
        link_cost
    }
}

fn exceeds(limit: Option<f64>, spent: f64, estimate: f64) -> bool {
    limit.is_some_and(|max| spent + estimate > max + f64::EPSILON)
}

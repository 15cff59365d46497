//! The provider contract and registry.
//!
//! A provider knows how to ask one external origin about a subject's death.
//! Implementors only write [`Provider::perform_lookup`]; the provided
//! [`Provider::lookup`] wraps it with rate limiting, a deadline, elapsed-time
//! capture and error normalization so every call yields a [`LookupResult`].

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AppError, FailureKind, ParseErrorKind};
use crate::models::{
    DeathDetails, LookupFailure, LookupResult, RecoveredPage, SourceEntry, Subject,
    clamp_confidence,
};
use crate::orchestrator::RunConfig;
use crate::throttle::RateLimiter;

/// Coarse trust ranking. Declaration order is ascending trust.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ReliabilityTier {
    /// AI model answers without citations.
    AiInference,
    /// Search aggregators, encyclopedias.
    Secondary,
    /// Trade press, institutional archives, structured knowledge bases.
    Trade,
    /// Wire services and major press.
    Primary,
}

impl ReliabilityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReliabilityTier::AiInference => "ai_inference",
            ReliabilityTier::Secondary => "secondary",
            ReliabilityTier::Trade => "trade",
            ReliabilityTier::Primary => "primary",
        }
    }

    /// Default confidence for a claim from this tier.
    pub fn base_confidence(&self) -> f64 {
        match self {
            ReliabilityTier::AiInference => 0.5,
            ReliabilityTier::Secondary => 0.6,
            ReliabilityTier::Trade => 0.8,
            ReliabilityTier::Primary => 0.9,
        }
    }

    /// Tier of an arbitrary page, judged by its host.
    pub fn for_url(url: &str) -> ReliabilityTier {
        const PRIMARY: &[&str] = &["apnews.com", "reuters.com", "nytimes.com", "bbc.co.uk", "bbc.com"];
        const TRADE: &[&str] = &[
            "variety.com",
            "hollywoodreporter.com",
            "deadline.com",
            "wikidata.org",
        ];

        let Some(host) = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
        else {
            return ReliabilityTier::Secondary;
        };
        let matches = |domains: &[&str]| {
            domains
                .iter()
                .any(|d| host == *d || host.ends_with(&format!(".{d}")))
        };
        if matches(PRIMARY) {
            ReliabilityTier::Primary
        } else if matches(TRADE) {
            ReliabilityTier::Trade
        } else {
            ReliabilityTier::Secondary
        }
    }
}

impl fmt::Display for ReliabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ReliabilityTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ai_inference" => Ok(ReliabilityTier::AiInference),
            "secondary" => Ok(ReliabilityTier::Secondary),
            "trade" => Ok(ReliabilityTier::Trade),
            "primary" => Ok(ReliabilityTier::Primary),
            _ => Err(format!("Unknown reliability tier: {s}")),
        }
    }
}

/// Behaviour class shared by several providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    StructuredKnowledgeBase,
    Encyclopedia,
    SiteSearch,
    WebSearch,
    AiModel,
    /// Parsers for arbitrary cited pages; only used in the link pass.
    LinkFollow,
}

impl ProviderFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderFamily::StructuredKnowledgeBase => "structured_knowledge_base",
            ProviderFamily::Encyclopedia => "encyclopedia",
            ProviderFamily::SiteSearch => "site_search",
            ProviderFamily::WebSearch => "web_search",
            ProviderFamily::AiModel => "ai_model",
            ProviderFamily::LinkFollow => "link_follow",
        }
    }
}

impl fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Static metadata for one provider instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    /// Kind tag, unique within a registry (`wikidata`, `apnews`, ...).
    pub name: String,
    pub family: ProviderFamily,
    pub tier: ReliabilityTier,
    pub paid: bool,
    /// Estimated USD per query.
    pub cost_per_query: f64,
    /// Minimum delay between two calls.
    #[serde(with = "duration_ms")]
    pub min_delay: Duration,
}

impl ProviderDescriptor {
    pub fn free(name: impl Into<String>, family: ProviderFamily, tier: ReliabilityTier) -> Self {
        Self {
            name: name.into(),
            family,
            tier,
            paid: false,
            cost_per_query: 0.0,
            min_delay: Duration::from_secs(1),
        }
    }

    pub fn paid(
        name: impl Into<String>,
        family: ProviderFamily,
        tier: ReliabilityTier,
        cost_per_query: f64,
    ) -> Self {
        Self {
            name: name.into(),
            family,
            tier,
            paid: true,
            cost_per_query,
            min_delay: Duration::from_secs(1),
        }
    }

    pub fn with_min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// What a provider found, before it is wrapped into a [`LookupResult`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderHit {
    pub data: DeathDetails,
    pub url: Option<String>,
    pub query: Option<String>,
    /// Overrides the tier's base confidence.
    pub confidence: Option<f64>,
    /// Overrides the descriptor's cost estimate (token-priced providers).
    pub cost: Option<f64>,
    /// Overrides the descriptor's tier (link parsers rank by page host).
    pub tier: Option<ReliabilityTier>,
    pub raw: Option<serde_json::Value>,
}

impl ProviderHit {
    pub fn new(data: DeathDetails) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

/// One external source of death facts.
#[async_trait]
pub trait Provider: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Local configuration check only. Never touches the network.
    fn is_available(&self) -> bool {
        true
    }

    /// The limiter shared by every call to this provider instance.
    fn rate_limiter(&self) -> &RateLimiter;

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    /// Ask the source. Return `AppError::NotFound` when it has nothing, and
    /// `AppError::AccessBlocked` when it refuses access.
    async fn perform_lookup(&self, subject: &Subject) -> Result<ProviderHit, AppError>;

    /// Whether [`Provider::parse_page`] understands pages recovered by the
    /// fallback fetch chain. Blocked results of other providers stay blocked.
    fn supports_recovery(&self) -> bool {
        false
    }

    /// Parse a page recovered by the fallback fetch chain.
    async fn parse_page(
        &self,
        subject: &Subject,
        page: &RecoveredPage,
    ) -> Result<ProviderHit, AppError> {
        let _ = (subject, page);
        Err(AppError::Generic(format!(
            "{} cannot parse recovered pages",
            self.descriptor().name
        )))
    }

    /// Re-parse a raw payload kept from an earlier failed call.
    fn parse_payload(&self, subject: &Subject, raw: &str) -> Result<ProviderHit, AppError> {
        let _ = subject;
        Err(AppError::Parse {
            kind: ParseErrorKind::UnexpectedMarkup,
            message: format!("{} does not support payload replay", self.descriptor().name),
            raw: raw.to_string(),
        })
    }

    /// Rate-limited, deadline-bounded lookup that never fails.
    async fn lookup(&self, subject: &Subject) -> LookupResult {
        let limiter = self.rate_limiter();
        limiter.wait().await;

        let deadline = self.timeout();
        let started = Instant::now();
        let outcome = match tokio::time::timeout(deadline, self.perform_lookup(subject)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AppError::Timeout(deadline.as_secs())),
        };

        match &outcome {
            Ok(_) => limiter.record_success().await,
            Err(AppError::RateLimitExceeded) => limiter.record_rate_limited().await,
            Err(_) => {}
        }

        let source = SourceEntry::new(self.descriptor());
        let result = finish_lookup(self.descriptor(), source, started, outcome);
        log_result(subject, &result);
        result
    }

    /// Lookup against a recovered page instead of the live source.
    async fn recover(&self, subject: &Subject, page: &RecoveredPage) -> LookupResult {
        let started = Instant::now();
        let outcome = self.parse_page(subject, page).await.map(|mut hit| {
            if hit.url.is_none() {
                hit.url = Some(page.requested_url.clone());
            }
            hit
        });
        let mut source = SourceEntry::new(self.descriptor());
        source.fetch_method = Some(page.method);
        let result = finish_lookup(self.descriptor(), source, started, outcome);
        log_result(subject, &result);
        result
    }

    /// Rebuild a result from a stored raw payload. No network access.
    fn replay(&self, subject: &Subject, raw: &str) -> LookupResult {
        let started = Instant::now();
        let outcome = self.parse_payload(subject, raw);
        let mut result = finish_lookup(
            self.descriptor(),
            SourceEntry::new(self.descriptor()),
            started,
            outcome,
        );
        // Replays cost nothing; the original call was already paid for.
        result.source.cost = 0.0;
        result
    }
}

/// Wrap a raw provider outcome into a [`LookupResult`].
fn finish_lookup(
    descriptor: &ProviderDescriptor,
    mut source: SourceEntry,
    started: Instant,
    outcome: Result<ProviderHit, AppError>,
) -> LookupResult {
    source.elapsed_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(hit) if hit.data.is_empty() => {
            source.url = hit.url;
            source.query = hit.query;
            source.raw = hit.raw;
            source.cost = charged_cost(descriptor, hit.cost);
            LookupResult::failed(
                source,
                LookupFailure::new(FailureKind::NotFound, "provider returned no death details"),
            )
        }
        Ok(hit) => {
            if let Some(tier) = hit.tier {
                source.tier = tier;
                source.confidence = tier.base_confidence();
            }
            if let Some(confidence) = hit.confidence {
                source.confidence = clamp_confidence(confidence);
            }
            source.url = hit.url;
            source.query = hit.query;
            source.raw = hit.raw;
            source.cost = charged_cost(descriptor, hit.cost);
            LookupResult::succeeded(source, hit.data)
        }
        Err(err) => {
            let failure = LookupFailure::from_error(&err);
            // The upstream answered, so a paid call is billed.
            if matches!(failure.kind, FailureKind::NotFound | FailureKind::Parse) {
                source.cost = charged_cost(descriptor, None);
            }
            if let Some(url) = &failure.blocked_url {
                source.url = Some(url.clone());
            }
            LookupResult::failed(source, failure)
        }
    }
}

fn charged_cost(descriptor: &ProviderDescriptor, reported: Option<f64>) -> f64 {
    if !descriptor.paid {
        return 0.0;
    }
    reported.unwrap_or(descriptor.cost_per_query).max(0.0)
}

fn log_result(subject: &Subject, result: &LookupResult) {
    let source = &result.source;
    match &result.outcome {
        Ok(_) => tracing::debug!(
            subject_id = subject.id,
            provider = %source.provider,
            elapsed_ms = source.elapsed_ms,
            confidence = source.confidence,
            "Provider returned data"
        ),
        Err(failure) => tracing::debug!(
            subject_id = subject.id,
            provider = %source.provider,
            elapsed_ms = source.elapsed_ms,
            kind = %failure.kind,
            error = %failure.message,
            "Provider lookup failed"
        ),
    }
}

/// The set of configured providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider. A provider with the same name replaces the earlier one.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let name = provider.descriptor().name.clone();
        self.providers.retain(|p| p.descriptor().name != name);
        self.providers.push(provider);
    }

    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .iter()
            .find(|p| p.descriptor().name == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.providers
            .iter()
            .map(|p| p.descriptor().clone())
            .collect()
    }

    /// Available lookup providers in invocation order: free before paid,
    /// then ascending cost, then descending tier. Ties keep registration order.
    pub fn prioritized(&self, config: &RunConfig) -> Vec<Arc<dyn Provider>> {
        self.select(config, |family| family != ProviderFamily::LinkFollow)
    }

    /// Available link parsers for the second pass, in the same order.
    pub fn link_parsers(&self, config: &RunConfig) -> Vec<Arc<dyn Provider>> {
        self.select(config, |family| family == ProviderFamily::LinkFollow)
    }

    fn select(
        &self,
        config: &RunConfig,
        family_filter: impl Fn(ProviderFamily) -> bool,
    ) -> Vec<Arc<dyn Provider>> {
        let mut selected: Vec<Arc<dyn Provider>> = self
            .providers
            .iter()
            .filter(|p| {
                let d = p.descriptor();
                family_filter(d.family)
                    && p.is_available()
                    && !(config.free_only && d.paid)
                    && (config.use_ai || !is_ai(d))
            })
            .cloned()
            .collect();

        selected.sort_by(|a, b| {
            let (a, b) = (a.descriptor(), b.descriptor());
            a.paid
                .cmp(&b.paid)
                .then(a.cost_per_query.total_cmp(&b.cost_per_query))
                .then(b.tier.cmp(&a.tier))
        });
        selected
    }
}

fn is_ai(descriptor: &ProviderDescriptor) -> bool {
    descriptor.family == ProviderFamily::AiModel || descriptor.tier == ReliabilityTier::AiInference
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.providers.iter().map(|p| &p.descriptor().name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FetchMethod;
    use crate::testutil::{MockProvider, sample_details, sample_subject};

    fn names(providers: &[Arc<dyn Provider>]) -> Vec<String> {
        providers
            .iter()
            .map(|p| p.descriptor().name.clone())
            .collect()
    }

    #[test]
    fn tier_ordering() {
        assert!(ReliabilityTier::Primary > ReliabilityTier::Trade);
        assert!(ReliabilityTier::Trade > ReliabilityTier::Secondary);
        assert!(ReliabilityTier::Secondary > ReliabilityTier::AiInference);
    }

    #[test]
    fn tier_for_url_uses_host() {
        assert_eq!(
            ReliabilityTier::for_url("https://apnews.com/article/x"),
            ReliabilityTier::Primary
        );
        assert_eq!(
            ReliabilityTier::for_url("https://www.variety.com/2020/obit"),
            ReliabilityTier::Trade
        );
        assert_eq!(
            ReliabilityTier::for_url("https://someblog.net/post"),
            ReliabilityTier::Secondary
        );
        assert_eq!(ReliabilityTier::for_url("garbage"), ReliabilityTier::Secondary);
    }

    #[tokio::test]
    async fn lookup_wraps_success() {
        let provider = MockProvider::succeeding("wikidata", sample_details());
        let result = provider.lookup(&sample_subject(1)).await;
        assert!(result.success());
        assert_eq!(result.source.provider, "wikidata");
        assert_eq!(result.source.cost, 0.0);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn lookup_turns_empty_data_into_not_found() {
        let provider = MockProvider::succeeding("wikidata", DeathDetails::default());
        let result = provider.lookup(&sample_subject(1)).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::NotFound));
        assert!(!result.error().unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn lookup_times_out_as_transient() {
        let provider = MockProvider::succeeding("slow", sample_details())
            .with_latency(Duration::from_millis(200))
            .with_timeout(Duration::from_millis(20));
        let result = provider.lookup(&sample_subject(1)).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::Transient));
    }

    #[tokio::test]
    async fn access_denied_is_never_not_found() {
        let provider = MockProvider::failing(
            "variety",
            AppError::AccessBlocked {
                url: "https://variety.com/obit".into(),
                status: 403,
            },
        );
        let result = provider.lookup(&sample_subject(1)).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::AccessBlocked));
        assert_eq!(result.blocked_url(), Some("https://variety.com/obit"));
        assert_eq!(result.source.url.as_deref(), Some("https://variety.com/obit"));
    }

    #[tokio::test]
    async fn paid_provider_charges_on_not_found() {
        let provider = MockProvider::failing("brave", AppError::NotFound("nothing".into()))
            .paid(0.005);
        let result = provider.lookup(&sample_subject(1)).await;
        assert_eq!(result.source.cost, 0.005);

        let provider = MockProvider::failing("brave", AppError::Timeout(10)).paid(0.005);
        let result = provider.lookup(&sample_subject(1)).await;
        assert_eq!(result.source.cost, 0.0);
    }

    #[tokio::test]
    async fn recover_notes_fetch_method() {
        let provider = MockProvider::succeeding("variety", sample_details());
        let page = RecoveredPage {
            method: FetchMethod::Wayback,
            requested_url: "https://variety.com/obit".into(),
            resolved_url: "https://web.archive.org/web/2020id_/https://variety.com/obit".into(),
            title: None,
            text: "text".into(),
            html: String::new(),
        };
        let result = provider.recover(&sample_subject(1), &page).await;
        assert!(result.success());
        assert_eq!(result.source.fetch_method, Some(FetchMethod::Wayback));
        assert_eq!(result.source.url.as_deref(), Some("https://variety.com/obit"));
    }

    #[test]
    fn prioritized_orders_free_then_cost_then_tier() {
        let registry = ProviderRegistry::new()
            .with(Arc::new(MockProvider::succeeding("openai", sample_details()).ai(0.01)))
            .with(Arc::new(MockProvider::succeeding("brave", sample_details()).paid(0.005)))
            .with(Arc::new(
                MockProvider::succeeding("wikipedia", sample_details())
                    .with_tier(ReliabilityTier::Secondary),
            ))
            .with(Arc::new(
                MockProvider::succeeding("apnews", sample_details())
                    .with_tier(ReliabilityTier::Primary),
            ))
            .with(Arc::new(
                MockProvider::succeeding("links", sample_details())
                    .with_family(ProviderFamily::LinkFollow),
            ));

        let free = RunConfig::default();
        assert_eq!(names(&registry.prioritized(&free)), vec!["apnews", "wikipedia"]);

        let paid = RunConfig {
            free_only: false,
            use_ai: true,
            ..RunConfig::default()
        };
        assert_eq!(
            names(&registry.prioritized(&paid)),
            vec!["apnews", "wikipedia", "brave", "openai"]
        );

        let no_ai = RunConfig {
            free_only: false,
            use_ai: false,
            ..RunConfig::default()
        };
        assert_eq!(
            names(&registry.prioritized(&no_ai)),
            vec!["apnews", "wikipedia", "brave"]
        );
        assert_eq!(names(&registry.link_parsers(&free)), vec!["links"]);
    }

    #[test]
    fn unavailable_providers_are_excluded() {
        let registry = ProviderRegistry::new().with(Arc::new(
            MockProvider::succeeding("brave", sample_details()).unavailable(),
        ));
        assert!(registry.prioritized(&RunConfig::default()).is_empty());
        assert!(registry.get("brave").is_some());
    }

    #[test]
    fn register_replaces_same_name() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MockProvider::succeeding("wikidata", sample_details())));
        registry.register(Arc::new(MockProvider::succeeding("wikidata", sample_details())));
        assert_eq!(registry.len(), 1);
    }
}

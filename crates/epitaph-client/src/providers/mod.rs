//! Concrete providers and the registry built from environment configuration.

pub mod ai;
pub mod brave;
pub mod links;
pub mod site_search;
pub mod wikidata;
pub mod wikipedia;

use std::sync::Arc;
use std::time::Duration;

use epitaph_core::error::AppError;
use epitaph_core::provider::{ProviderDescriptor, ProviderRegistry};
use epitaph_core::throttle::{RateLimiter, ThrottleConfig};
use epitaph_core::traits::{Cleaner, Fetcher};

use crate::llm::OpenAiExtractor;

pub use ai::{AiProvider, TokenPricing, death_details_schema};
pub use brave::BraveSearchProvider;
pub use links::HeuristicLinkParser;
pub use site_search::{SiteDefinition, SiteSearchProvider, builtin_sites};
pub use wikidata::WikidataProvider;
pub use wikipedia::WikipediaProvider;

const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Credentials and knobs for the provider set.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Provider names removed from the registry.
    pub disabled: Vec<String>,
    pub brave_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: Option<String>,
    pub pricing: TokenPricing,
    pub twocaptcha_api_key: Option<String>,
    /// Deadline for one provider lookup.
    pub provider_timeout: Duration,
    pub llm_timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            disabled: Vec::new(),
            brave_api_key: None,
            openai_api_key: None,
            openai_model: DEFAULT_MODEL.to_string(),
            openai_base_url: None,
            pricing: TokenPricing::default(),
            twocaptcha_api_key: None,
            provider_timeout: Duration::from_secs(30),
            llm_timeout: Duration::from_secs(120),
        }
    }
}

impl ProviderConfig {
    /// Read configuration from environment variables.
    ///
    /// - `EPITAPH_DISABLED_PROVIDERS` (comma list)
    /// - `BRAVE_SEARCH_API_KEY`, `OPENAI_API_KEY`, `TWOCAPTCHA_API_KEY`
    /// - `EPITAPH_MODEL` (defaults to gpt-4o-mini), `EPITAPH_BASE_URL`
    /// - `EPITAPH_PROVIDER_TIMEOUT_SECS`, `EPITAPH_LLM_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let non_empty = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let disabled = non_empty("EPITAPH_DISABLED_PROVIDERS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            disabled,
            brave_api_key: non_empty("BRAVE_SEARCH_API_KEY"),
            openai_api_key: non_empty("OPENAI_API_KEY"),
            openai_model: non_empty("EPITAPH_MODEL").unwrap_or(defaults.openai_model),
            openai_base_url: non_empty("EPITAPH_BASE_URL"),
            pricing: defaults.pricing,
            twocaptcha_api_key: non_empty("TWOCAPTCHA_API_KEY"),
            provider_timeout: secs(&non_empty, "EPITAPH_PROVIDER_TIMEOUT_SECS")?
                .unwrap_or(defaults.provider_timeout),
            llm_timeout: secs(&non_empty, "EPITAPH_LLM_TIMEOUT_SECS")?
                .unwrap_or(defaults.llm_timeout),
        })
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        !self.disabled.iter().any(|d| d == name)
    }
}

fn secs(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>, AppError> {
    let Some(raw) = get(key) else {
        return Ok(None);
    };
    let parsed: u64 = raw.parse().map_err(|_| {
        AppError::ConfigError(format!("Invalid {key} '{raw}': must be a positive integer"))
    })?;
    if parsed == 0 {
        return Err(AppError::ConfigError(format!("{key} must be at least 1")));
    }
    Ok(Some(Duration::from_secs(parsed)))
}

/// The limiter a provider gets from its descriptor: the minimum delay with
/// a little jitter, doubling on 429 up to thirty times the base.
pub fn limiter_for(descriptor: &ProviderDescriptor) -> RateLimiter {
    let delay = descriptor.min_delay;
    RateLimiter::new(
        ThrottleConfig::new(delay)
            .with_jitter(delay / 4)
            .with_backoff(2, delay * 30),
    )
}

/// Build every enabled provider whose credentials are present.
pub fn build_registry<F, C>(
    config: &ProviderConfig,
    fetcher: F,
    cleaner: C,
) -> Result<ProviderRegistry, AppError>
where
    F: Fetcher + 'static,
    C: Cleaner + 'static,
{
    let mut registry = ProviderRegistry::new();
    let timeout = config.provider_timeout;

    if config.is_enabled("wikidata") {
        registry.register(Arc::new(
            WikidataProvider::new(fetcher.clone()).with_timeout(timeout),
        ));
    }
    if config.is_enabled("wikipedia") {
        registry.register(Arc::new(
            WikipediaProvider::new(fetcher.clone()).with_timeout(timeout),
        ));
    }
    for site in builtin_sites() {
        if config.is_enabled(site.name) {
            registry.register(Arc::new(
                SiteSearchProvider::new(site, fetcher.clone(), cleaner.clone()).with_timeout(timeout),
            ));
        }
    }
    if config.is_enabled("page_heuristics") {
        registry.register(Arc::new(HeuristicLinkParser::new()));
    }

    if config.is_enabled("brave_search")
        && let Some(key) = &config.brave_api_key
    {
        registry.register(Arc::new(BraveSearchProvider::new(key)?.with_timeout(timeout)));
    }

    if let Some(key) = &config.openai_api_key {
        let extractor = match &config.openai_base_url {
            Some(base) => OpenAiExtractor::with_base_url(key, &config.openai_model, base)?,
            None => OpenAiExtractor::new(key, &config.openai_model)?,
        }
        .with_timeout(config.llm_timeout)?;

        if config.is_enabled("openai") {
            registry.register(Arc::new(
                AiProvider::knowledge(extractor.clone(), config.pricing).with_timeout(config.llm_timeout),
            ));
        }
        if config.is_enabled("openai_reader") {
            registry.register(Arc::new(
                AiProvider::link_reader(extractor, config.pricing).with_timeout(config.llm_timeout),
            ));
        }
    }

    tracing::info!(providers = ?registry, "Provider registry built");
    Ok(registry)
}

use std::time::Duration;

use async_trait::async_trait;
use epitaph_core::error::{AppError, ParseErrorKind};
use epitaph_core::models::Subject;
use epitaph_core::provider::{
    Provider, ProviderDescriptor, ProviderFamily, ProviderHit, ReliabilityTier,
};
use epitaph_core::throttle::RateLimiter;
use reqwest::Client;
use scraper::Html;
use serde::Deserialize;

use super::limiter_for;
use crate::fetcher::map_transport_error;
use crate::heuristics::extract_details;

pub const BRAVE_SEARCH_URL: &str = "https://api.search.brave.com/res/v1/web/search";

/// USD per query on the paid plan.
const COST_PER_QUERY: f64 = 0.005;
const MAX_CITATIONS: usize = 5;

/// Brave Search API: snippets feed the heuristics, result links become
/// citations for the link pass.
#[derive(Clone)]
pub struct BraveSearchProvider {
    client: Client,
    api_key: String,
    base_url: String,
    descriptor: ProviderDescriptor,
    limiter: RateLimiter,
    timeout: Duration,
}

impl BraveSearchProvider {
    pub fn new(api_key: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, BRAVE_SEARCH_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;
        let descriptor = ProviderDescriptor::paid(
            "brave_search",
            ProviderFamily::WebSearch,
            ReliabilityTier::Secondary,
            COST_PER_QUERY,
        )
        .with_min_delay(Duration::from_millis(1100));
        Ok(Self {
            client,
            api_key: api_key.trim().to_string(),
            base_url: base_url.to_string(),
            limiter: limiter_for(&descriptor),
            descriptor,
            timeout: Duration::from_secs(30),
        })
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    web: Option<WebResults>,
}

#[derive(Debug, Deserialize)]
struct WebResults {
    #[serde(default)]
    results: Vec<WebResult>,
}

#[derive(Debug, Deserialize)]
struct WebResult {
    title: String,
    url: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    extra_snippets: Vec<String>,
}

/// Death details from a search response, citing the results that name the
/// subject.
pub fn parse_results(subject: &Subject, raw: &str) -> Result<ProviderHit, AppError> {
    let response: SearchResponse = serde_json::from_str(raw).map_err(|e| AppError::Parse {
        kind: ParseErrorKind::InvalidJson,
        message: format!("Brave returned invalid JSON: {e}"),
        raw: raw.to_string(),
    })?;

    let surname = subject.surname().to_lowercase();
    let relevant: Vec<WebResult> = response
        .web
        .map(|w| w.results)
        .unwrap_or_default()
        .into_iter()
        .filter(|r| {
            r.title.to_lowercase().contains(&surname)
                || r.description.to_lowercase().contains(&surname)
        })
        .collect();
    if relevant.is_empty() {
        return Err(AppError::NotFound(format!("no search results for {}", subject.name)));
    }

    let snippets = relevant
        .iter()
        .flat_map(|r| std::iter::once(&r.description).chain(r.extra_snippets.iter()))
        .map(|s| strip_markup(s))
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut details = extract_details(subject, &snippets);
    details.citations = relevant
        .iter()
        .take(MAX_CITATIONS)
        .map(|r| r.url.clone())
        .collect();

    let top = relevant[0].url.clone();
    Ok(ProviderHit::new(details).with_url(top))
}

/// Brave highlights query terms with `<strong>` and escapes entities.
fn strip_markup(snippet: &str) -> String {
    Html::parse_fragment(snippet).root_element().text().collect()
}

#[async_trait]
impl Provider for BraveSearchProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn perform_lookup(&self, subject: &Subject) -> Result<ProviderHit, AppError> {
        let query = subject.search_query();
        let response = self
            .client
            .get(&self.base_url)
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .query(&[("q", query.as_str()), ("count", "10")])
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout.as_secs()))?;

        let status = response.status().as_u16();
        match status {
            401 | 403 => {
                return Err(AppError::ConfigError(format!(
                    "Brave rejected the API key (HTTP {status})"
                )));
            }
            429 => return Err(AppError::RateLimitExceeded),
            500..=599 => {
                return Err(AppError::ServerError {
                    status,
                    message: "Brave Search unavailable".into(),
                });
            }
            200..=299 => {}
            _ => return Err(AppError::HttpError(format!("Brave returned HTTP {status}"))),
        }

        let body = response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))?;
        Ok(parse_results(subject, &body)?.with_query(query))
    }

    fn parse_payload(&self, subject: &Subject, raw: &str) -> Result<ProviderHit, AppError> {
        parse_results(subject, raw)
    }
}

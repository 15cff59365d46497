//! News and obituary sites driven by a declarative definition: a search URL
//! template, a selector for result links, and a selector for article text.

use std::time::Duration;

use async_trait::async_trait;
use epitaph_core::error::AppError;
use epitaph_core::models::{RecoveredPage, Subject};
use epitaph_core::provider::{
    Provider, ProviderDescriptor, ProviderFamily, ProviderHit, ReliabilityTier,
};
use epitaph_core::throttle::RateLimiter;
use epitaph_core::traits::{Cleaner, Fetcher};
use scraper::{Html, Selector};
use url::Url;

use super::limiter_for;
use crate::cleaner::article_html;
use crate::heuristics::extract_details;

/// How to search one site and read its articles.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteDefinition {
    pub name: &'static str,
    pub tier: ReliabilityTier,
    /// `{query}` is replaced with the URL-encoded search query.
    pub search_url: &'static str,
    pub result_selector: &'static str,
    pub article_selector: &'static str,
    pub min_delay: Duration,
}

/// The sites configured out of the box.
pub fn builtin_sites() -> Vec<SiteDefinition> {
    vec![
        SiteDefinition {
            name: "apnews",
            tier: ReliabilityTier::Primary,
            search_url: "https://apnews.com/search?q={query}",
            result_selector: ".PagePromo-title a",
            article_selector: ".RichTextStoryBody",
            min_delay: Duration::from_secs(2),
        },
        SiteDefinition {
            name: "reuters",
            tier: ReliabilityTier::Primary,
            search_url: "https://www.reuters.com/site-search/?query={query}",
            result_selector: "a[data-testid=\"TitleLink\"]",
            article_selector: "[data-testid=\"ArticleBody\"]",
            min_delay: Duration::from_secs(2),
        },
        SiteDefinition {
            name: "variety",
            tier: ReliabilityTier::Trade,
            search_url: "https://variety.com/?s={query}",
            result_selector: "h3.c-title a",
            article_selector: ".vy-cx-page-content",
            min_delay: Duration::from_secs(3),
        },
        SiteDefinition {
            name: "hollywood_reporter",
            tier: ReliabilityTier::Trade,
            search_url: "https://www.hollywoodreporter.com/?s={query}",
            result_selector: "h3.c-title a",
            article_selector: ".a-content",
            min_delay: Duration::from_secs(3),
        },
        SiteDefinition {
            name: "deadline",
            tier: ReliabilityTier::Trade,
            search_url: "https://deadline.com/?s={query}",
            result_selector: "h3.c-title a",
            article_selector: ".a-content",
            min_delay: Duration::from_secs(3),
        },
        SiteDefinition {
            name: "legacy",
            tier: ReliabilityTier::Secondary,
            search_url: "https://www.legacy.com/search?query={query}",
            result_selector: "a[href*=\"/obituaries/\"]",
            article_selector: "[data-component=\"ObituaryText\"]",
            min_delay: Duration::from_secs(2),
        },
    ]
}

#[derive(Clone)]
pub struct SiteSearchProvider<F, C> {
    site: SiteDefinition,
    fetcher: F,
    cleaner: C,
    descriptor: ProviderDescriptor,
    limiter: RateLimiter,
    timeout: Duration,
}

impl<F: Fetcher, C: Cleaner> SiteSearchProvider<F, C> {
    pub fn new(site: SiteDefinition, fetcher: F, cleaner: C) -> Self {
        let descriptor = ProviderDescriptor::free(site.name, ProviderFamily::SiteSearch, site.tier)
            .with_min_delay(site.min_delay);
        Self {
            limiter: limiter_for(&descriptor),
            site,
            fetcher,
            cleaner,
            descriptor,
            timeout: Duration::from_secs(45),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn search_url(&self, query: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
        self.site.search_url.replace("{query}", &encoded)
    }

    /// Readable article text: the configured container, else the generic
    /// article body, else the whole page.
    fn article_text(&self, html: &str) -> Result<String, AppError> {
        if let Some(text) = select_text(html, self.site.article_selector) {
            return Ok(text);
        }
        let body = article_html(html).unwrap_or_else(|| html.to_string());
        self.cleaner.clean(&body)
    }

    fn parse_article(
        &self,
        subject: &Subject,
        html: &str,
        url: &str,
    ) -> Result<ProviderHit, AppError> {
        let text = self.article_text(html)?;
        if !text.to_lowercase().contains(&subject.surname().to_lowercase()) {
            return Err(AppError::NotFound(format!("{url} does not mention {}", subject.name)));
        }
        let mut details = extract_details(subject, &text);
        details.citations.clear();
        Ok(ProviderHit::new(details).with_url(url))
    }
}

/// Joined paragraph text under the first element matching `css`.
fn select_text(html: &str, css: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let container = Selector::parse(css).ok()?;
    let paragraphs = Selector::parse("p").ok()?;
    let element = document.select(&container).next()?;
    let mut parts: Vec<String> = element
        .select(&paragraphs)
        .map(|p| p.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if parts.is_empty() {
        parts.push(element.text().collect::<String>().trim().to_string());
    }
    let text = parts.join("\n\n");
    (!text.is_empty()).then_some(text)
}

/// First result link whose anchor text names the subject, made absolute.
pub fn pick_result(html: &str, base_url: &str, css: &str, subject: &Subject) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(css).ok()?;
    let base = Url::parse(base_url).ok()?;
    let surname = subject.surname().to_lowercase();

    document
        .select(&selector)
        .filter(|a| a.text().collect::<String>().to_lowercase().contains(&surname))
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .find(|u| matches!(u.scheme(), "http" | "https"))
        .map(|u| u.to_string())
}

#[async_trait]
impl<F, C> Provider for SiteSearchProvider<F, C>
where
    F: Fetcher + 'static,
    C: Cleaner + 'static,
{
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn perform_lookup(&self, subject: &Subject) -> Result<ProviderHit, AppError> {
        let query = subject.search_query();
        let search_url = self.search_url(&query);
        let results = self.fetcher.fetch(&search_url).await?;

        let Some(article_url) =
            pick_result(&results.body, &results.final_url, self.site.result_selector, subject)
        else {
            return Err(AppError::NotFound(format!(
                "{} has no result for {}",
                self.site.name, subject.name
            )));
        };
        tracing::debug!(provider = self.site.name, url = %article_url, "Following search result");

        // A blocked article surfaces as AccessBlocked carrying its URL.
        let article = self.fetcher.fetch(&article_url).await?;
        Ok(self
            .parse_article(subject, &article.body, &article_url)?
            .with_query(query))
    }

    fn supports_recovery(&self) -> bool {
        true
    }

    async fn parse_page(
        &self,
        subject: &Subject,
        page: &RecoveredPage,
    ) -> Result<ProviderHit, AppError> {
        self.parse_article(subject, &page.html, &page.requested_url)
    }
}

#[cfg(test)]
mod tests {
    use epitaph_core::error::FailureKind;
    use epitaph_core::models::FetchMethod;
    use epitaph_core::testutil::{MockCleaner, MockFetcher};

    use super::*;

    const ARTICLE_URL: &str = "https://variety.com/2021/film/news/jane-doe-dead-1234/";

    fn subject() -> Subject {
        Subject::new(7, "Jane Doe")
            .with_deathday(chrono::NaiveDate::from_ymd_opt(2021, 3, 4).unwrap())
    }

    fn variety() -> SiteDefinition {
        builtin_sites()
            .into_iter()
            .find(|s| s.name == "variety")
            .unwrap()
    }

    fn provider(fetcher: MockFetcher) -> SiteSearchProvider<MockFetcher, MockCleaner> {
        SiteSearchProvider::new(variety(), fetcher, MockCleaner::passthrough())
            .with_rate_limiter(RateLimiter::unlimited())
    }

    fn results_page() -> String {
        r#"<html><body>
<h3 class="c-title"><a href="/2020/tv/news/unrelated-show-renewed/">Show Renewed</a></h3>
<h3 class="c-title"><a href="/2021/film/news/jane-doe-dead-1234/">Jane Doe, Star of Westerns, Dies at 81</a></h3>
</body></html>"#
            .to_string()
    }

    fn article_page() -> String {
        r#"<html><body><div class="vy-cx-page-content">
<p>Jane Doe, who starred in a string of westerns, died of heart failure on March 4 at her home in Santa Fe. She was 81.</p>
<p>Her death was confirmed by her publicist.</p>
</div></body></html>"#
            .to_string()
    }

    #[test]
    fn test_search_url_encodes_query() {
        let provider = provider(MockFetcher::default());
        assert_eq!(
            provider.search_url("Jane Doe death 2021"),
            "https://variety.com/?s=Jane+Doe+death+2021"
        );
    }

    #[test]
    fn test_pick_result_matches_subject_and_resolves() {
        let url = pick_result(&results_page(), "https://variety.com/?s=x", "h3.c-title a", &subject());
        assert_eq!(url.as_deref(), Some(ARTICLE_URL));
    }

    #[test]
    fn test_builtin_sites_cover_every_tier() {
        let sites = builtin_sites();
        assert_eq!(sites.len(), 6);
        assert!(sites.iter().all(|s| s.search_url.contains("{query}")));
        assert_eq!(
            sites.iter().filter(|s| s.tier == ReliabilityTier::Primary).count(),
            2
        );
    }

    #[tokio::test]
    async fn lookup_follows_result_and_extracts() {
        let fetcher = MockFetcher::default()
            .route("https://variety.com/?s=", &results_page())
            .route(ARTICLE_URL, &article_page());
        let result = provider(fetcher).lookup(&subject()).await;

        let data = result.data().unwrap();
        assert_eq!(data.cause_of_death.as_deref(), Some("heart failure"));
        assert_eq!(data.location_of_death.as_deref(), Some("Santa Fe"));
        assert_eq!(result.source.url.as_deref(), Some(ARTICLE_URL));
        assert_eq!(result.source.tier, ReliabilityTier::Trade);
    }

    #[tokio::test]
    async fn blocked_article_reports_its_url() {
        let fetcher = MockFetcher::default()
            .route("https://variety.com/?s=", &results_page())
            .route_error(
                ARTICLE_URL,
                AppError::AccessBlocked {
                    url: ARTICLE_URL.into(),
                    status: 403,
                },
            );
        let result = provider(fetcher).lookup(&subject()).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::AccessBlocked));
        assert_eq!(result.blocked_url(), Some(ARTICLE_URL));
    }

    #[tokio::test]
    async fn no_matching_result_is_not_found() {
        let fetcher = MockFetcher::default()
            .route("https://variety.com/?s=", "<html><body>No results</body></html>");
        let result = provider(fetcher).lookup(&subject()).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::NotFound));
    }

    #[tokio::test]
    async fn recovered_page_is_parsed() {
        let page = RecoveredPage {
            method: FetchMethod::ArchiveToday,
            requested_url: ARTICLE_URL.into(),
            resolved_url: "https://archive.ph/Ab3dE".into(),
            title: None,
            text: String::new(),
            html: article_page(),
        };
        let result = provider(MockFetcher::default()).recover(&subject(), &page).await;
        assert!(result.success());
        assert_eq!(result.source.fetch_method, Some(FetchMethod::ArchiveToday));
        assert_eq!(result.source.url.as_deref(), Some(ARTICLE_URL));
    }
}

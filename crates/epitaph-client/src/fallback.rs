//! Ordered recovery of blocked pages: direct, Wayback, archive.today, and
//! (with the `browser` feature) an interactive archive search.

use std::time::Duration;

use epitaph_core::models::{FallbackAttempt, FallbackOutcome, FetchMethod, RecoveredPage};
use epitaph_core::throttle::{RateLimiter, ThrottleConfig, ThrottledFetcher};
use epitaph_core::traits::{Cleaner, FallbackFetcher, Fetcher};
use moka::future::Cache;

use crate::archive::{ArchiveTodayClient, WaybackClient};
use crate::cleaner::{article_html, page_title};

#[cfg(feature = "browser")]
use crate::browser::ArchiveSearch;
#[cfg(feature = "browser")]
use crate::captcha::TwoCaptchaSolver;

/// Pacing, thresholds and caching for a [`FallbackFetchChain`].
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Extracted text shorter than this counts as a failed step.
    pub min_content_length: usize,
    /// Per-domain pacing for direct fetches.
    pub direct: ThrottleConfig,
    pub wayback: ThrottleConfig,
    /// Stricter, with adaptive backoff on 429.
    pub archive_today: ThrottleConfig,
    pub browser: ThrottleConfig,
    pub cache_ttl: Duration,
    pub cache_capacity: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            min_content_length: 500,
            direct: ThrottleConfig::new(Duration::from_secs(1))
                .with_jitter(Duration::from_millis(500)),
            wayback: ThrottleConfig::new(Duration::from_secs(1)),
            archive_today: ThrottleConfig::new(Duration::from_secs(5))
                .with_backoff(2, Duration::from_secs(120)),
            browser: ThrottleConfig::new(Duration::from_secs(10)),
            cache_ttl: Duration::from_secs(3600),
            cache_capacity: 1_000,
        }
    }
}

impl FallbackConfig {
    /// No pacing at all; for tests.
    pub fn unthrottled() -> Self {
        Self {
            direct: ThrottleConfig::unlimited(),
            wayback: ThrottleConfig::unlimited(),
            archive_today: ThrottleConfig::unlimited(),
            browser: ThrottleConfig::unlimited(),
            ..Self::default()
        }
    }
}

/// The production [`FallbackFetcher`].
///
/// Every step gets its own limiter. Outcomes, including `Unavailable`, are
/// cached per URL so link following and repeated subjects do not refetch.
#[derive(Clone)]
pub struct FallbackFetchChain<F, C> {
    direct: ThrottledFetcher<F>,
    wayback: WaybackClient<F>,
    archive_today: ArchiveTodayClient<F>,
    #[cfg(feature = "browser")]
    interactive: Option<(ArchiveSearch<TwoCaptchaSolver>, RateLimiter)>,
    #[cfg(feature = "browser")]
    browser_throttle: ThrottleConfig,
    cleaner: C,
    min_content_length: usize,
    cache: Cache<String, FallbackOutcome>,
}

impl<F, C> FallbackFetchChain<F, C>
where
    F: Fetcher + 'static,
    C: Cleaner + 'static,
{
    pub fn new(fetcher: F, cleaner: C, config: FallbackConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl)
            .build();
        Self {
            direct: ThrottledFetcher::new(fetcher.clone(), config.direct),
            wayback: WaybackClient::new(fetcher.clone(), RateLimiter::new(config.wayback)),
            archive_today: ArchiveTodayClient::new(fetcher, RateLimiter::new(config.archive_today)),
            #[cfg(feature = "browser")]
            interactive: None,
            #[cfg(feature = "browser")]
            browser_throttle: config.browser,
            cleaner,
            min_content_length: config.min_content_length,
            cache,
        }
    }

    /// Enable the CAPTCHA-solving browser step.
    #[cfg(feature = "browser")]
    pub fn with_interactive(mut self, search: ArchiveSearch<TwoCaptchaSolver>) -> Self {
        let limiter = RateLimiter::new(self.browser_throttle.clone());
        self.interactive = Some((search, limiter));
        self
    }

    async fn run_chain(&self, url: &str) -> FallbackOutcome {
        let mut attempts = Vec::new();

        match self.direct.fetch(url).await {
            Ok(page) => match self.usable(FetchMethod::Direct, url, &page.final_url, &page.body) {
                Ok(recovered) => return FallbackOutcome::Recovered(recovered),
                Err(reason) => attempts.push(attempt(FetchMethod::Direct, reason)),
            },
            Err(e) => attempts.push(attempt(FetchMethod::Direct, e.to_string())),
        }

        match self.wayback.fetch(url).await {
            Ok(Some(snapshot)) => {
                match self.usable(FetchMethod::Wayback, url, &snapshot.url, &snapshot.html) {
                    Ok(recovered) => return FallbackOutcome::Recovered(recovered),
                    Err(reason) => attempts.push(attempt(FetchMethod::Wayback, reason)),
                }
            }
            Ok(None) => attempts.push(attempt(FetchMethod::Wayback, "no snapshot".into())),
            Err(e) => attempts.push(attempt(FetchMethod::Wayback, e.to_string())),
        }

        let mut challenged = false;
        match self.archive_today.fetch(url).await {
            Ok(Some(snapshot)) => {
                match self.usable(FetchMethod::ArchiveToday, url, &snapshot.url, &snapshot.html) {
                    Ok(recovered) => return FallbackOutcome::Recovered(recovered),
                    Err(reason) => attempts.push(attempt(FetchMethod::ArchiveToday, reason)),
                }
            }
            Ok(None) => attempts.push(attempt(FetchMethod::ArchiveToday, "no snapshot".into())),
            Err(e) => {
                challenged = matches!(e, epitaph_core::error::AppError::AccessBlocked { .. });
                attempts.push(attempt(FetchMethod::ArchiveToday, e.to_string()));
            }
        }

        if challenged && let Some(recovered) = self.interactive_step(url, &mut attempts).await {
            return FallbackOutcome::Recovered(recovered);
        }

        tracing::info!(url, steps = attempts.len(), "No route recovered the page");
        FallbackOutcome::Unavailable { attempts }
    }

    #[cfg(feature = "browser")]
    async fn interactive_step(
        &self,
        url: &str,
        attempts: &mut Vec<FallbackAttempt>,
    ) -> Option<RecoveredPage> {
        let (search, limiter) = self.interactive.as_ref()?;
        limiter.wait().await;
        let outcome = match search.recover(url).await {
            Ok(page) => self.usable(FetchMethod::Browser, url, &page.final_url, &page.body),
            Err(e) => Err(e.to_string()),
        };
        match outcome {
            Ok(recovered) => Some(recovered),
            Err(reason) => {
                attempts.push(attempt(FetchMethod::Browser, reason));
                None
            }
        }
    }

    #[cfg(not(feature = "browser"))]
    async fn interactive_step(
        &self,
        url: &str,
        _attempts: &mut Vec<FallbackAttempt>,
    ) -> Option<RecoveredPage> {
        tracing::debug!(url, "archive.today challenged; browser step not compiled in");
        None
    }

    /// A recovered page if the HTML carries enough article text.
    fn usable(
        &self,
        method: FetchMethod,
        requested_url: &str,
        resolved_url: &str,
        html: &str,
    ) -> Result<RecoveredPage, String> {
        let body = article_html(html).unwrap_or_else(|| html.to_string());
        let text = self.cleaner.clean(&body).map_err(|e| e.to_string())?;
        let length = text.chars().count();
        if length < self.min_content_length {
            return Err(format!(
                "thin content ({length} chars, need {})",
                self.min_content_length
            ));
        }
        tracing::debug!(url = requested_url, method = %method, chars = length, "Recovered page");
        Ok(RecoveredPage {
            method,
            requested_url: requested_url.to_string(),
            resolved_url: resolved_url.to_string(),
            title: page_title(html),
            text,
            html: html.to_string(),
        })
    }
}

fn attempt(method: FetchMethod, reason: String) -> FallbackAttempt {
    FallbackAttempt { method, reason }
}

impl<F, C> FallbackFetcher for FallbackFetchChain<F, C>
where
    F: Fetcher + 'static,
    C: Cleaner + 'static,
{
    async fn fetch_with_fallback(&self, url: &str) -> FallbackOutcome {
        if let Some(cached) = self.cache.get(url).await {
            return cached;
        }
        let outcome = self.run_chain(url).await;
        self.cache.insert(url.to_string(), outcome.clone()).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use epitaph_core::error::AppError;
    use epitaph_core::testutil::MockFetcher;

    use super::*;
    use crate::archive::{ARCHIVE_TODAY_NEWEST_URL, WAYBACK_AVAILABILITY_URL};
    use crate::cleaner::HtmdCleaner;

    const ORIGINAL: &str = "https://variety.com/2021/obit/jane-doe";

    fn article(marker: &str) -> String {
        let paragraph = format!(
            "<p>Jane Doe, the actress, died of lung cancer at her home in Santa Monica. {marker}</p>"
        );
        format!(
            "<html><head><title>Jane Doe obituary</title></head><body><article>{}</article></body></html>",
            paragraph.repeat(10)
        )
    }

    fn chain(fetcher: MockFetcher) -> FallbackFetchChain<MockFetcher, HtmdCleaner> {
        FallbackFetchChain::new(fetcher, HtmdCleaner::new(), FallbackConfig::unthrottled())
    }

    fn blocked() -> AppError {
        AppError::AccessBlocked {
            url: ORIGINAL.into(),
            status: 403,
        }
    }

    #[tokio::test]
    async fn direct_content_short_circuits() {
        let fetcher = MockFetcher::default().route(ORIGINAL, &article("direct"));
        let outcome = chain(fetcher.clone()).fetch_with_fallback(ORIGINAL).await;

        let page = outcome.page().unwrap();
        assert_eq!(page.method, FetchMethod::Direct);
        assert_eq!(page.title.as_deref(), Some("Jane Doe obituary"));
        assert!(page.text.contains("died of lung cancer"));
        assert_eq!(fetcher.requested(), vec![ORIGINAL.to_string()]);
    }

    #[tokio::test]
    async fn no_wayback_snapshot_then_archive_today_redirect() {
        let fetcher = MockFetcher::default()
            .route_error(ORIGINAL, blocked())
            .route(WAYBACK_AVAILABILITY_URL, r#"{"url":"x","archived_snapshots":{}}"#)
            .route_redirect(
                ARCHIVE_TODAY_NEWEST_URL,
                "https://archive.ph/Ab3dE",
                &article("archived"),
            );

        let outcome = chain(fetcher).fetch_with_fallback(ORIGINAL).await;
        let page = outcome.page().expect("page should be recovered");
        assert_eq!(page.method, FetchMethod::ArchiveToday);
        assert_eq!(page.requested_url, ORIGINAL);
        assert_eq!(page.resolved_url, "https://archive.ph/Ab3dE");
    }

    #[tokio::test]
    async fn thin_direct_page_falls_through_to_wayback() {
        let toolbar = "<!-- BEGIN WAYBACK TOOLBAR INSERT --><div>Wayback toolbar</div><!-- END WAYBACK TOOLBAR INSERT -->";
        let snapshot = article("snapshot").replace("<body>", &format!("<body>{toolbar}"));
        let fetcher = MockFetcher::default()
            .route(ORIGINAL, "<html><body><p>Subscribe to read</p></body></html>")
            .route(
                WAYBACK_AVAILABILITY_URL,
                r#"{"archived_snapshots":{"closest":{"available":true,"url":"u","timestamp":"20210305000000","status":"200"}}}"#,
            )
            .route("https://web.archive.org/web/", &snapshot);

        let outcome = chain(fetcher).fetch_with_fallback(ORIGINAL).await;
        let page = outcome.page().unwrap();
        assert_eq!(page.method, FetchMethod::Wayback);
        assert!(!page.html.contains("Wayback toolbar"));
        assert!(page.text.contains("snapshot"));
    }

    #[tokio::test]
    async fn exhausted_chain_lists_every_step() {
        let fetcher = MockFetcher::default()
            .route_error(ORIGINAL, blocked())
            .route(WAYBACK_AVAILABILITY_URL, r#"{"archived_snapshots":{}}"#)
            .route_redirect(ARCHIVE_TODAY_NEWEST_URL, "https://archive.ph/submit/", "<form></form>");

        match chain(fetcher).fetch_with_fallback(ORIGINAL).await {
            FallbackOutcome::Unavailable { attempts } => {
                let methods: Vec<FetchMethod> = attempts.iter().map(|a| a.method).collect();
                assert_eq!(
                    methods,
                    vec![FetchMethod::Direct, FetchMethod::Wayback, FetchMethod::ArchiveToday]
                );
                assert!(attempts[0].reason.contains("403"));
                assert_eq!(attempts[1].reason, "no snapshot");
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn outcomes_are_cached_per_url() {
        let fetcher = MockFetcher::default().route(ORIGINAL, &article("direct"));
        let chain = chain(fetcher.clone());
        chain.fetch_with_fallback(ORIGINAL).await;
        chain.fetch_with_fallback(ORIGINAL).await;
        assert_eq!(fetcher.requested().len(), 1);
    }
}

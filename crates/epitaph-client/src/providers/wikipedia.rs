use std::time::Duration;

use async_trait::async_trait;
use epitaph_core::error::AppError;
use epitaph_core::models::{RecoveredPage, Subject};
use epitaph_core::provider::{
    Provider, ProviderDescriptor, ProviderFamily, ProviderHit, ReliabilityTier,
};
use epitaph_core::throttle::RateLimiter;
use epitaph_core::traits::Fetcher;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::limiter_for;
use crate::heuristics::{extract_details, mentions_subject};

pub const WIKIPEDIA_REST_URL: &str = "https://en.wikipedia.org/api/rest_v1/page/html/";

const DEATH_HEADINGS: &[&str] = &["death", "illness", "final years", "later life"];

/// English Wikipedia article HTML, read from the death section when the
/// article has one.
#[derive(Clone)]
pub struct WikipediaProvider<F> {
    fetcher: F,
    descriptor: ProviderDescriptor,
    limiter: RateLimiter,
    timeout: Duration,
}

impl<F: Fetcher> WikipediaProvider<F> {
    pub fn new(fetcher: F) -> Self {
        let descriptor = ProviderDescriptor::free(
            "wikipedia",
            ProviderFamily::Encyclopedia,
            ReliabilityTier::Secondary,
        )
        .with_min_delay(Duration::from_millis(200));
        Self {
            fetcher,
            limiter: limiter_for(&descriptor),
            descriptor,
            timeout: Duration::from_secs(30),
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
}

pub fn article_url(subject: &Subject) -> Result<String, AppError> {
    let mut url = Url::parse(WIKIPEDIA_REST_URL)
        .map_err(|e| AppError::ConfigError(format!("Invalid Wikipedia URL: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| AppError::ConfigError("Wikipedia URL cannot be a base".into()))?
        .pop_if_empty()
        .push(&subject.name.trim().replace(' ', "_"));
    Ok(url.to_string())
}

/// Paragraph text of the article's death-related sections, or of every
/// paragraph when no such section exists.
pub fn death_text(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let sections = Selector::parse("section").ok()?;
    let headings = Selector::parse("h2, h3").ok()?;
    let paragraphs = Selector::parse("p").ok()?;

    let text_of = |root: ElementRef<'_>| {
        root.select(&paragraphs)
            .map(|p| p.text().collect::<String>())
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    let from_sections: Vec<String> = document
        .select(&sections)
        .filter(|section| {
            section
                .select(&headings)
                .next()
                .map(|h| h.text().collect::<String>().to_lowercase())
                .is_some_and(|h| DEATH_HEADINGS.iter().any(|k| h.contains(k)))
        })
        .map(text_of)
        .collect();

    let text = if from_sections.is_empty() {
        text_of(document.root_element())
    } else {
        from_sections.join("\n\n")
    };
    (!text.trim().is_empty()).then_some(text)
}

fn is_disambiguation(html: &str) -> bool {
    html.contains("mw:PageProp/disambiguation")
}

fn parse_article(subject: &Subject, html: &str, url: &str) -> Result<ProviderHit, AppError> {
    if is_disambiguation(html) {
        return Err(AppError::NotFound(format!("{url} is a disambiguation page")));
    }
    let document_text = Html::parse_document(html)
        .root_element()
        .text()
        .collect::<String>();
    if !mentions_subject(subject, &document_text) {
        return Err(AppError::NotFound(format!("{url} does not describe this subject")));
    }
    let text = death_text(html)
        .ok_or_else(|| AppError::NotFound(format!("{url} has no article text")))?;
    let mut details = extract_details(subject, &text);
    details.citations.clear();
    Ok(ProviderHit::new(details).with_url(url))
}

#[async_trait]
impl<F: Fetcher + 'static> Provider for WikipediaProvider<F> {
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
        let url = article_url(subject)?;
        let page = self.fetcher.fetch(&url).await?;
        parse_article(subject, &page.body, &url)
    }

    fn supports_recovery(&self) -> bool {
        true
    }

    async fn parse_page(
        &self,
        subject: &Subject,
        page: &RecoveredPage,
    ) -> Result<ProviderHit, AppError> {
        parse_article(subject, &page.html, &page.requested_url)
    }
}

#[cfg(test)]
mod tests {
    use epitaph_core::error::FailureKind;
    use epitaph_core::testutil::{MockFetcher, sample_subject};

    use super::*;

    fn article() -> String {
        r#"<html><body>
<section><p><b>Subject 1</b> (1950 – 2020) was an American actor.</p></section>
<section><h2>Career</h2><p>Subject 1 appeared in forty films and died young in many of them.</p></section>
<section><h2>Illness and death</h2>
<p>In 2019 Subject 1 was diagnosed with pancreatic cancer.</p>
<p>Subject 1 died of pancreatic cancer at his home in Malibu, California, on January 1, 2020.</p>
</section></body></html>"#
            .to_string()
    }

    fn provider(fetcher: MockFetcher) -> WikipediaProvider<MockFetcher> {
        WikipediaProvider::new(fetcher).with_rate_limiter(RateLimiter::unlimited())
    }

    #[test]
    fn test_article_url_encodes_title() {
        let subject = Subject::new(1, "Jean Dupré");
        assert_eq!(
            article_url(&subject).unwrap(),
            "https://en.wikipedia.org/api/rest_v1/page/html/Jean_Dupr%C3%A9"
        );
    }

    #[test]
    fn test_death_text_prefers_death_section() {
        let text = death_text(&article()).unwrap();
        assert!(text.contains("pancreatic cancer"));
        assert!(!text.contains("forty films"));
    }

    #[tokio::test]
    async fn lookup_reads_death_section() {
        let fetcher = MockFetcher::default().route(WIKIPEDIA_REST_URL, &article());
        let result = provider(fetcher.clone()).lookup(&sample_subject(1)).await;
        let data = result.data().unwrap();
        assert_eq!(data.cause_of_death.as_deref(), Some("pancreatic cancer"));
        assert_eq!(data.location_of_death.as_deref(), Some("Malibu, California"));
        assert_eq!(fetcher.requested()[0], format!("{WIKIPEDIA_REST_URL}Subject_1"));
    }

    #[tokio::test]
    async fn disambiguation_page_is_not_found() {
        let html = r#"<html><head><meta property="mw:PageProp/disambiguation"></head>
<body><p>Subject 1 may refer to several people who died in 2020.</p></body></html>"#;
        let fetcher = MockFetcher::default().route(WIKIPEDIA_REST_URL, html);
        let result = provider(fetcher).lookup(&sample_subject(1)).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::NotFound));
    }

    #[tokio::test]
    async fn wrong_person_is_not_found() {
        let html = "<html><body><p>Subject 1 (1890 – 1951) died of influenza.</p></body></html>";
        let fetcher = MockFetcher::default().route(WIKIPEDIA_REST_URL, html);
        let result = provider(fetcher).lookup(&sample_subject(1)).await;
        assert_eq!(result.failure_kind(), Some(FailureKind::NotFound));
    }
}

//! Clients for the two web archives the fallback chain consults.

use epitaph_core::error::AppError;
use epitaph_core::throttle::RateLimiter;
use epitaph_core::traits::Fetcher;
use scraper::{Html, Selector};
use serde::Deserialize;
use url::Url;

pub const WAYBACK_AVAILABILITY_URL: &str = "https://archive.org/wayback/available";
pub const ARCHIVE_TODAY_NEWEST_URL: &str = "https://archive.ph/newest/";

const ARCHIVE_TODAY_HOSTS: &[&str] = &[
    "archive.ph",
    "archive.today",
    "archive.is",
    "archive.li",
    "archive.md",
    "archive.vn",
];

/// Path segments that are archive.today endpoints rather than snapshot ids.
const ARCHIVE_TODAY_RESERVED: &[&str] = &[
    "newest", "oldest", "submit", "wip", "search", "timegate", "timemap", "faq",
];

/// A snapshot pulled from an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Where the snapshot was served from.
    pub url: String,
    pub html: String,
}

#[derive(Debug, Deserialize)]
struct Availability {
    #[serde(default)]
    archived_snapshots: ArchivedSnapshots,
}

#[derive(Debug, Default, Deserialize)]
struct ArchivedSnapshots {
    closest: Option<ClosestSnapshot>,
}

#[derive(Debug, Deserialize)]
struct ClosestSnapshot {
    #[serde(default)]
    available: bool,
    timestamp: String,
}

// ---------------------------------------------------------------------------
// Wayback Machine
// ---------------------------------------------------------------------------

/// Internet Archive client: availability lookup, then the raw snapshot.
#[derive(Clone)]
pub struct WaybackClient<F> {
    fetcher: F,
    limiter: RateLimiter,
}

impl<F: Fetcher> WaybackClient<F> {
    pub fn new(fetcher: F, limiter: RateLimiter) -> Self {
        Self { fetcher, limiter }
    }

    /// Timestamp of the closest available snapshot of `url`.
    pub async fn closest_timestamp(&self, url: &str) -> Result<Option<String>, AppError> {
        let query = Url::parse_with_params(WAYBACK_AVAILABILITY_URL, &[("url", url)])
            .map_err(|e| AppError::Generic(format!("Invalid availability URL: {e}")))?;

        self.limiter.wait().await;
        let page = self.fetcher.fetch(query.as_str()).await?;
        let availability: Availability = serde_json::from_str(&page.body)?;

        Ok(availability
            .archived_snapshots
            .closest
            .filter(|c| c.available && !c.timestamp.is_empty())
            .map(|c| c.timestamp))
    }

    /// The archived page with archive chrome removed, or `None` when the
    /// Wayback Machine has no snapshot.
    pub async fn fetch(&self, url: &str) -> Result<Option<Snapshot>, AppError> {
        let Some(timestamp) = self.closest_timestamp(url).await? else {
            return Ok(None);
        };
        let snapshot_url = raw_snapshot_url(&timestamp, url);

        self.limiter.wait().await;
        let page = self.fetcher.fetch(&snapshot_url).await?;
        tracing::debug!(url, snapshot = %snapshot_url, "Fetched Wayback snapshot");

        Ok(Some(Snapshot {
            url: snapshot_url,
            html: strip_wayback_chrome(&page.body),
        }))
    }
}

/// The `id_` form serves the original bytes without rewritten links.
pub fn raw_snapshot_url(timestamp: &str, original: &str) -> String {
    format!("https://web.archive.org/web/{timestamp}id_/{original}")
}

/// Elements the Wayback Machine injects into archived pages.
const WAYBACK_CHROME_SELECTORS: &[&str] = &[
    r#"[id^="wm-ipp"]"#,
    r#"script[src*="/_static/"]"#,
    r#"link[href*="/_static/"]"#,
];

/// Remove the Wayback toolbar and `/_static/` assets.
pub fn strip_wayback_chrome(html: &str) -> String {
    if !html.contains("/_static/") && !html.contains("wm-ipp") && !html.contains("WAYBACK TOOLBAR") {
        return html.to_string();
    }

    let mut document = Html::parse_document(html);
    let mut doomed: Vec<_> = WAYBACK_CHROME_SELECTORS
        .iter()
        .filter_map(|css| Selector::parse(css).ok())
        .flat_map(|selector| document.select(&selector).map(|el| el.id()).collect::<Vec<_>>())
        .collect();
    doomed.extend(
        document
            .tree
            .nodes()
            .filter(|node| {
                node.value()
                    .as_comment()
                    .is_some_and(|c| c.contains("WAYBACK TOOLBAR"))
            })
            .map(|node| node.id()),
    );

    for id in doomed {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }
    document.html()
}

// ---------------------------------------------------------------------------
// archive.today
// ---------------------------------------------------------------------------

/// archive.today client using the redirecting `newest` endpoint.
///
/// The limiter should carry adaptive backoff: archive.today answers bursts
/// with 429 long before it blocks outright.
#[derive(Clone)]
pub struct ArchiveTodayClient<F> {
    fetcher: F,
    limiter: RateLimiter,
}

impl<F: Fetcher> ArchiveTodayClient<F> {
    pub fn new(fetcher: F, limiter: RateLimiter) -> Self {
        Self { fetcher, limiter }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The newest snapshot of `url`, or `None` when archive.today has none.
    ///
    /// A challenge page surfaces as [`AppError::AccessBlocked`] so the caller
    /// can escalate to an interactive session.
    pub async fn fetch(&self, url: &str) -> Result<Option<Snapshot>, AppError> {
        let newest_url = format!("{ARCHIVE_TODAY_NEWEST_URL}{url}");

        self.limiter.wait().await;
        match self.fetcher.fetch(&newest_url).await {
            Ok(page) => {
                self.limiter.record_success().await;
                if is_snapshot_url(&page.final_url) {
                    Ok(Some(Snapshot {
                        url: page.final_url,
                        html: page.body,
                    }))
                } else {
                    tracing::debug!(url, landed = %page.final_url, "archive.today has no snapshot");
                    Ok(None)
                }
            }
            Err(AppError::RateLimitExceeded) => {
                self.limiter.record_rate_limited().await;
                Err(AppError::RateLimitExceeded)
            }
            Err(AppError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// True for `https://archive.ph/<id>` style snapshot URLs.
pub fn is_snapshot_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    if !ARCHIVE_TODAY_HOSTS.contains(&host.trim_start_matches("www.")) {
        return false;
    }
    let mut segments = parsed.path_segments().into_iter().flatten();
    let Some(id) = segments.next() else {
        return false;
    };
    segments.all(str::is_empty)
        && (4..=12).contains(&id.len())
        && id.chars().all(|c| c.is_ascii_alphanumeric())
        && !ARCHIVE_TODAY_RESERVED.contains(&id)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use epitaph_core::testutil::MockFetcher;
    use epitaph_core::throttle::ThrottleConfig;

    use super::*;

    const ORIGINAL: &str = "https://variety.com/2021/obit/jane-doe";

    #[test]
    fn test_strip_wayback_chrome() {
        let html = r#"<html><head><script src="/_static/js/wombat.js"></script>
<link rel="stylesheet" href="/_static/css/banner.css"><link rel="canonical" href="https://variety.com/x">
</head><body><!-- BEGIN WAYBACK TOOLBAR INSERT --><div id="wm-ipp">toolbar</div><!-- END WAYBACK TOOLBAR INSERT --><p>Obituary</p></body></html>"#;
        let stripped = strip_wayback_chrome(html);
        assert!(!stripped.contains("wombat"));
        assert!(!stripped.contains("banner.css"));
        assert!(!stripped.contains("wm-ipp"));
        assert!(stripped.contains("rel=\"canonical\""));
        assert!(stripped.contains("<p>Obituary</p>"));
        assert!(!stripped.contains("WAYBACK TOOLBAR"));
    }

    #[test]
    fn test_strip_wayback_chrome_keeps_nested_toolbar_lookalikes() {
        let html = r#"<html><body><div id="wm-ipp-base"><div id="wm-ipp-inside"><script>var x = "</div>";</script></div></div>
<script src="https://cdn.variety.com/app.js"></script><p>Died at 81.</p></body></html>"#;
        let stripped = strip_wayback_chrome(html);
        assert!(!stripped.contains("wm-ipp"));
        assert!(stripped.contains("cdn.variety.com/app.js"));
        assert!(stripped.contains("<p>Died at 81.</p>"));
    }

    #[test]
    fn test_snapshot_url_detection() {
        assert!(is_snapshot_url("https://archive.ph/Ab3dE"));
        assert!(is_snapshot_url("https://archive.today/xYz12"));
        assert!(!is_snapshot_url("https://archive.ph/newest/https://variety.com/x"));
        assert!(!is_snapshot_url("https://archive.ph/submit/"));
        assert!(!is_snapshot_url("https://archive.ph/wip/Ab3dE"));
        assert!(!is_snapshot_url("https://variety.com/Ab3dE"));
    }

    #[tokio::test]
    async fn wayback_fetches_raw_snapshot() {
        let fetcher = MockFetcher::default()
            .route(
                WAYBACK_AVAILABILITY_URL,
                r#"{"url":"x","archived_snapshots":{"closest":{"available":true,"status":"200","url":"http://web.archive.org/web/20210305000000/https://variety.com/2021/obit/jane-doe","timestamp":"20210305000000"}}}"#,
            )
            .route("https://web.archive.org/web/", "<p>archived</p>");
        let client = WaybackClient::new(fetcher.clone(), RateLimiter::unlimited());

        let snapshot = client.fetch(ORIGINAL).await.unwrap().unwrap();
        assert_eq!(
            snapshot.url,
            format!("https://web.archive.org/web/20210305000000id_/{ORIGINAL}")
        );
        assert_eq!(snapshot.html, "<p>archived</p>");
        assert!(fetcher.requested()[0].contains("url=https%3A%2F%2Fvariety.com"));
    }

    #[tokio::test]
    async fn wayback_without_snapshot_is_none() {
        let fetcher = MockFetcher::default().route(
            WAYBACK_AVAILABILITY_URL,
            r#"{"url":"x","archived_snapshots":{}}"#,
        );
        let client = WaybackClient::new(fetcher.clone(), RateLimiter::unlimited());
        assert!(client.fetch(ORIGINAL).await.unwrap().is_none());
        assert_eq!(fetcher.requested().len(), 1);
    }

    #[tokio::test]
    async fn archive_today_follows_redirect_to_snapshot() {
        let fetcher = MockFetcher::default().route_redirect(
            ARCHIVE_TODAY_NEWEST_URL,
            "https://archive.ph/Ab3dE",
            "<p>snapshot</p>",
        );
        let client = ArchiveTodayClient::new(fetcher, RateLimiter::unlimited());
        let snapshot = client.fetch(ORIGINAL).await.unwrap().unwrap();
        assert_eq!(snapshot.url, "https://archive.ph/Ab3dE");
    }

    #[tokio::test]
    async fn archive_today_without_redirect_is_none() {
        let fetcher = MockFetcher::default().route_redirect(
            ARCHIVE_TODAY_NEWEST_URL,
            "https://archive.ph/submit/",
            "<form>archive this page</form>",
        );
        let client = ArchiveTodayClient::new(fetcher, RateLimiter::unlimited());
        assert!(client.fetch(ORIGINAL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn archive_today_backs_off_on_429_and_resets() {
        let config = ThrottleConfig::new(Duration::from_millis(1))
            .with_backoff(2, Duration::from_millis(8));
        let fetcher = MockFetcher::with_responses(vec![
            Err(AppError::RateLimitExceeded),
            Err(AppError::RateLimitExceeded),
            Ok("<p>snapshot</p>".to_string()),
        ]);
        let client = ArchiveTodayClient::new(fetcher, RateLimiter::new(config));

        assert!(client.fetch(ORIGINAL).await.is_err());
        assert_eq!(client.limiter().current_delay().await, Duration::from_millis(2));
        assert!(client.fetch(ORIGINAL).await.is_err());
        assert_eq!(client.limiter().current_delay().await, Duration::from_millis(4));
        let _ = client.fetch(ORIGINAL).await.unwrap();
        assert_eq!(client.limiter().current_delay().await, Duration::from_millis(1));
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::{Browser, BrowserConfig, Page};
use epitaph_core::error::AppError;
use epitaph_core::models::FetchedPage;
use epitaph_core::traits::Fetcher;
use futures::StreamExt;

use crate::captcha::{CaptchaSolver, detect_challenge};

const ARCHIVE_SEARCH_URL: &str = "https://archive.ph/search/";

/// Selectors for the first search hit on archive.today, most specific first.
const RESULT_LINK_SELECTORS: &[&str] = &["#row0 .TEXT-BLOCK a", "#CONTENT .TEXT-BLOCK a", ".TEXT-BLOCK a"];

/// Headless-browser fetcher using Chromium via the Chrome DevTools Protocol.
///
/// A single Chromium process is shared across all clones of this struct;
/// each [`Fetcher::fetch`] call opens a new tab, grabs the rendered HTML,
/// and closes the tab.
#[derive(Clone)]
pub struct BrowserFetcher {
    browser: Arc<Browser>,
    timeout: Duration,
}

impl BrowserFetcher {
    /// Launches a headless Chromium browser with a **30 s** navigation timeout.
    pub async fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30)).await
    }

    pub async fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        if let Some(bin) = Self::find_chrome_binary() {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }

        let config = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::ConfigError(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::Generic(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled for the connection to stay alive.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
            timeout,
        })
    }

    /// `CHROME_BIN` first, then well-known install paths. Snap's wrapper
    /// strips headless flags, so the binary inside the snap is preferred.
    fn find_chrome_binary() -> Option<PathBuf> {
        let candidates: &[&str] = &[
            "/snap/chromium/current/usr/lib/chromium-browser/chrome",
            "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
        ];

        if let Ok(p) = std::env::var("CHROME_BIN") {
            let path = PathBuf::from(&p);
            if path.exists() {
                return Some(path);
            }
        }

        candidates.iter().map(PathBuf::from).find(|p| p.exists())
    }

    async fn open(&self, url: &str) -> Result<Page, AppError> {
        let page = self
            .browser
            .new_page(url)
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to navigate to {url}: {e}")))?;
        page.find_element("body")
            .await
            .map_err(|e| AppError::HttpError(format!("Page did not render body: {e}")))?;
        Ok(page)
    }
}

async fn snapshot(page: &Page, requested: &str) -> Result<FetchedPage, AppError> {
    let body = page
        .content()
        .await
        .map_err(|e| AppError::HttpError(format!("Failed to read page content: {e}")))?;
    let final_url = page
        .url()
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| requested.to_string());
    Ok(FetchedPage::ok(final_url, body))
}

impl Fetcher for BrowserFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, AppError> {
        let result = tokio::time::timeout(self.timeout, async {
            let page = self.open(url).await?;
            let fetched = snapshot(&page, url).await;
            let _ = page.close().await;
            fetched
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(AppError::Timeout(self.timeout.as_secs())),
        }
    }
}

/// Interactive archive.today search for when the redirect endpoint is
/// behind a CAPTCHA: solve the widget, take the first hit, read it.
#[derive(Clone)]
pub struct ArchiveSearch<S> {
    browser: BrowserFetcher,
    solver: S,
    clearance_wait: Duration,
}

impl<S: CaptchaSolver> ArchiveSearch<S> {
    pub fn new(browser: BrowserFetcher, solver: S) -> Self {
        Self {
            browser,
            solver,
            clearance_wait: Duration::from_secs(20),
        }
    }

    /// The archived page for `url`, as (snapshot URL, HTML).
    pub async fn recover(&self, url: &str) -> Result<FetchedPage, AppError> {
        let search_url = search_url(url);
        let page = self.browser.open(&search_url).await?;
        let outcome = self.drive(&page, &search_url).await;
        let _ = page.close().await;
        outcome
    }

    async fn drive(&self, page: &Page, search_url: &str) -> Result<FetchedPage, AppError> {
        let html = snapshot(page, search_url).await?.body;

        if let Some(challenge) = detect_challenge(&html, search_url) {
            tracing::info!(url = search_url, kind = ?challenge.kind, "Solving archive CAPTCHA");
            let token = self.solver.solve(&challenge).await?;
            page.evaluate(inject_token_script(&token)?)
                .await
                .map_err(|e| AppError::Generic(format!("Token injection failed: {e}")))?;
            self.wait_for_clearance(page, search_url).await?;
        }

        let href = first_result_link(page).await.ok_or_else(|| {
            AppError::NotFound(format!("archive search returned no results for {search_url}"))
        })?;
        page.goto(href.as_str())
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to open {href}: {e}")))?;
        let _ = page.wait_for_navigation().await;
        snapshot(page, &href).await
    }

    async fn wait_for_clearance(&self, page: &Page, search_url: &str) -> Result<(), AppError> {
        let deadline = tokio::time::Instant::now() + self.clearance_wait;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let html = snapshot(page, search_url).await?.body;
            if detect_challenge(&html, search_url).is_none() {
                return Ok(());
            }
        }
        Err(AppError::AccessBlocked {
            url: search_url.to_string(),
            status: 200,
        })
    }
}

async fn first_result_link(page: &Page) -> Option<String> {
    for css in RESULT_LINK_SELECTORS {
        let Ok(element) = page.find_element(*css).await else {
            continue;
        };
        if let Ok(Some(href)) = element.attribute("href").await {
            return Some(href);
        }
    }
    None
}

pub fn search_url(url: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(url.as_bytes()).collect();
    format!("{ARCHIVE_SEARCH_URL}?q={encoded}")
}

/// Script that fills every CAPTCHA response field and submits the form.
pub fn inject_token_script(token: &str) -> Result<String, AppError> {
    let literal = serde_json::to_string(token)?;
    Ok(format!(
        r#"(function(token) {{
  document.querySelectorAll('textarea[name="g-recaptcha-response"], textarea[name="h-captcha-response"]')
    .forEach(function(el) {{ el.value = token; el.innerHTML = token; }});
  var form = document.querySelector('form');
  if (form) {{ form.submit(); }}
  return true;
}})({literal})"#
    ))
}

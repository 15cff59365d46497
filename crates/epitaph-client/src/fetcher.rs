use std::net::IpAddr;
use std::time::Duration;

use epitaph_core::error::AppError;
use epitaph_core::models::FetchedPage;
use epitaph_core::traits::Fetcher;
use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use url::Url;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Markers that only appear on bot walls served with a 200.
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-challenge",
    "cf_chl_opt",
    "challenge-platform",
    "captcha-delivery.com",
    "px-captcha",
    "please verify you are a human",
    "access to this page has been denied",
];

/// Embeddable captcha widgets. Comment and signup forms carry these too.
const WIDGET_MARKERS: &[&str] = &["g-recaptcha", "h-captcha"];

/// Titles of interstitial pages, lowercased.
const CHALLENGE_TITLES: &[&str] = &[
    "just a moment",
    "attention required",
    "are you a robot",
    "are you a human",
    "security check",
    "access denied",
    "verify you are human",
];

/// HTTP fetcher using reqwest.
///
/// Sends browser-like headers and maps upstream refusals onto the error
/// taxonomy: 401/403 and challenge pages become [`AppError::AccessBlocked`],
/// 404/410 [`AppError::NotFound`], 429 [`AppError::RateLimitExceeded`] and
/// 5xx [`AppError::ServerError`].
///
/// By default, SSRF protection is **enabled**: requests to private/reserved
/// IP ranges are blocked. Use [`allow_private_urls`](Self::allow_private_urls)
/// to disable this (e.g., for CLI usage where the user controls the machine).
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    timeout_secs: u64,
    ssrf_protection: bool,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
            ssrf_protection: true,
        })
    }

    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    ///
    /// Only use this for CLI usage where the user controls the machine.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, AppError> {
        if self.ssrf_protection {
            validate_url(url).await?;
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))?;

        classify_response(url, final_url, status, body)
    }
}

pub(crate) fn map_transport_error(e: reqwest::Error, timeout_secs: u64) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout_secs)
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::HttpError(e.to_string())
    }
}

/// Turn a raw response into a page or a classified error.
pub fn classify_response(
    requested_url: &str,
    final_url: String,
    status: u16,
    body: String,
) -> Result<FetchedPage, AppError> {
    match status {
        401 | 403 => Err(AppError::AccessBlocked {
            url: requested_url.to_string(),
            status,
        }),
        404 | 410 => Err(AppError::NotFound(format!("HTTP {status} for {requested_url}"))),
        429 => Err(AppError::RateLimitExceeded),
        500..=599 => Err(AppError::ServerError {
            status,
            message: format!("HTTP {status} for {requested_url}"),
        }),
        200..=299 if looks_like_challenge(&body) => Err(AppError::AccessBlocked {
            url: requested_url.to_string(),
            status,
        }),
        200..=299 => Ok(FetchedPage {
            final_url,
            status,
            body,
        }),
        _ => Err(AppError::HttpError(format!("HTTP {status} for {requested_url}"))),
    }
}

/// True if the HTML is a bot wall or CAPTCHA interstitial rather than content.
pub fn looks_like_challenge(html: &str) -> bool {
    // Challenge pages are small; real articles that merely mention a
    // captcha widget are not.
    if html.len() > 200_000 {
        return false;
    }
    let lower = html.to_ascii_lowercase();
    if CHALLENGE_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    WIDGET_MARKERS.iter().any(|m| lower.contains(m)) && has_challenge_title(html)
}

fn has_challenge_title(html: &str) -> bool {
    let doc = scraper::Html::parse_document(html);
    let Ok(selector) = scraper::Selector::parse("title") else {
        return false;
    };
    doc.select(&selector).any(|title| {
        let text = title.text().collect::<String>().to_lowercase();
        CHALLENGE_TITLES.iter().any(|t| text.contains(t))
    })
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
async fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::HttpError(format!("Invalid URL: {e}")))?;

    // 1. Scheme check
    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::HttpError(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    // 2. Extract host
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::HttpError("URL has no host".to_string()))?;

    // 3. If the host is already an IP literal, check it directly
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::HttpError(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }

    // 4. DNS resolve and check all addresses
    let port = parsed.port().unwrap_or(match parsed.scheme() {
        "https" => 443,
        _ => 80,
    });
    let addr = format!("{host}:{port}");
    let addrs: Vec<_> = tokio::net::lookup_host(&addr)
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    for socket_addr in &addrs {
        if is_private_ip(socket_addr.ip()) {
            return Err(AppError::HttpError(format!(
                "SSRF blocked: {host} resolves to private/reserved IP {}",
                socket_addr.ip()
            )));
        }
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()           // 127.0.0.0/8
                || v4.is_private()     // 10/8, 172.16/12, 192.168/16
                || v4.is_link_local()  // 169.254.0.0/16 (cloud metadata!)
                || v4.is_unspecified() // 0.0.0.0
                || v4.is_broadcast()   // 255.255.255.255
                || v4.is_documentation() // 192.0.2.0/24, 198.51.100.0/24, 203.0.113.0/24
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()       // ::1
                || v6.is_unspecified() // ::
                // fe80::/10 (link-local)
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
                // fc00::/7 (unique local)
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                // IPv4-mapped IPv6 (::ffff:x.x.x.x): check the embedded v4
                || match v6.to_ipv4_mapped() {
                    Some(v4) => is_private_ip(IpAddr::V4(v4)),
                    None => false,
                }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_ipv4() {
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(is_private_ip("10.0.0.1".parse().unwrap()));
        assert!(is_private_ip("172.16.0.1".parse().unwrap()));
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(is_private_ip("169.254.169.254".parse().unwrap())); // cloud metadata
        assert!(is_private_ip("0.0.0.0".parse().unwrap()));
        assert!(is_private_ip("100.64.0.1".parse().unwrap())); // CGN
    }

    #[test]
    fn test_public_ipv4() {
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
        assert!(!is_private_ip("1.1.1.1".parse().unwrap()));
        assert!(!is_private_ip("93.184.216.34".parse().unwrap())); // example.com
    }

    #[test]
    fn test_private_ipv6() {
        assert!(is_private_ip("::1".parse().unwrap()));
        assert!(is_private_ip("::".parse().unwrap()));
        assert!(is_private_ip("fe80::1".parse().unwrap()));
        assert!(is_private_ip("fc00::1".parse().unwrap()));
        assert!(is_private_ip("::ffff:127.0.0.1".parse().unwrap())); // v4-mapped loopback
        assert!(is_private_ip("::ffff:169.254.169.254".parse().unwrap())); // v4-mapped metadata
    }

    #[test]
    fn test_public_ipv6() {
        assert!(!is_private_ip("2001:4860:4860::8888".parse().unwrap())); // Google DNS
    }

    #[tokio::test]
    async fn test_validate_url_rejects_private_ip() {
        let result = validate_url("http://127.0.0.1/admin").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("SSRF blocked"));
    }

    #[tokio::test]
    async fn test_validate_url_rejects_metadata_ip() {
        let result = validate_url("http://169.254.169.254/latest/meta-data/").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("SSRF blocked"));
    }

    #[tokio::test]
    async fn test_validate_url_rejects_bad_scheme() {
        let result = validate_url("file:///etc/passwd").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not allowed"));
    }

    #[test]
    fn test_classify_forbidden_is_access_blocked() {
        let err = classify_response("https://variety.com/x", "https://variety.com/x".into(), 403, String::new())
            .unwrap_err();
        assert!(matches!(err, AppError::AccessBlocked { status: 403, .. }));
        assert_eq!(err.blocked_url(), Some("https://variety.com/x"));
    }

    #[test]
    fn test_classify_status_codes() {
        let page = |status| classify_response("https://a.com", "https://a.com".into(), status, "<p>ok</p>".into());
        assert!(matches!(page(404), Err(AppError::NotFound(_))));
        assert!(matches!(page(410), Err(AppError::NotFound(_))));
        assert!(matches!(page(429), Err(AppError::RateLimitExceeded)));
        assert!(matches!(page(503), Err(AppError::ServerError { status: 503, .. })));
        assert!(matches!(page(418), Err(AppError::HttpError(_))));
        assert_eq!(page(200).unwrap().body, "<p>ok</p>");
    }

    #[test]
    fn test_challenge_page_with_200_is_blocked() {
        let html = "<html><head><title>Just a moment...</title></head><body><div id=\"cf-challenge\"></div></body></html>";
        assert!(looks_like_challenge(html));
        let err = classify_response("https://a.com", "https://a.com".into(), 200, html.into()).unwrap_err();
        assert!(matches!(err, AppError::AccessBlocked { status: 200, .. }));
    }

    #[test]
    fn test_plain_article_is_not_challenge() {
        assert!(!looks_like_challenge("<article><p>The actor died on Tuesday.</p></article>"));
    }

    #[test]
    fn test_article_with_recaptcha_comment_form_is_not_challenge() {
        let html = r#"<html><head><title>Actor dies at 81 | Variety</title></head><body>
            <article><p>The actor died at home on Tuesday.</p></article>
            <form id="comments"><div class="g-recaptcha" data-sitekey="6Lc-abc"></div></form>
            </body></html>"#;
        assert!(!looks_like_challenge(html));
        let page = classify_response("https://variety.com/x", "https://variety.com/x".into(), 200, html.into()).unwrap();
        assert_eq!(page.status, 200);
    }

    #[test]
    fn test_recaptcha_interstitial_is_challenge() {
        let html = r#"<html><head><title>Are you a robot?</title></head><body>
            <form><div class="g-recaptcha" data-sitekey="6Lc-abc"></div></form></body></html>"#;
        assert!(looks_like_challenge(html));
    }

    #[test]
    fn test_redirect_keeps_final_url() {
        let page = classify_response(
            "https://archive.ph/newest/https://a.com",
            "https://archive.ph/Xy12Z".into(),
            200,
            "<p>snapshot</p>".into(),
        )
        .unwrap();
        assert_eq!(page.final_url, "https://archive.ph/Xy12Z");
    }
}

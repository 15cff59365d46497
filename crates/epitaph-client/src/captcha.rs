//! CAPTCHA widget detection and the 2Captcha solving service.

use std::future::Future;
use std::time::{Duration, Instant};

use epitaph_core::error::AppError;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Deserialize;

use crate::fetcher::map_transport_error;

const TWOCAPTCHA_BASE_URL: &str = "https://2captcha.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaKind {
    ReCaptchaV2,
    HCaptcha,
}

impl CaptchaKind {
    fn method(&self) -> &'static str {
        match self {
            CaptchaKind::ReCaptchaV2 => "userrecaptcha",
            CaptchaKind::HCaptcha => "hcaptcha",
        }
    }

    fn key_param(&self) -> &'static str {
        match self {
            CaptchaKind::ReCaptchaV2 => "googlekey",
            CaptchaKind::HCaptcha => "sitekey",
        }
    }
}

/// A widget found on a page, ready to be sent to a solver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaChallenge {
    pub kind: CaptchaKind,
    pub site_key: String,
    pub page_url: String,
}

/// Locate a reCAPTCHA or hCaptcha widget and its site key.
pub fn detect_challenge(html: &str, page_url: &str) -> Option<CaptchaChallenge> {
    let document = Html::parse_document(html);
    let candidates = [
        (".h-captcha[data-sitekey]", CaptchaKind::HCaptcha),
        (".g-recaptcha[data-sitekey]", CaptchaKind::ReCaptchaV2),
        ("[data-sitekey]", CaptchaKind::ReCaptchaV2),
    ];
    candidates.into_iter().find_map(|(css, kind)| {
        let selector = Selector::parse(css).ok()?;
        let site_key = document
            .select(&selector)
            .find_map(|el| el.value().attr("data-sitekey"))
            .filter(|k| !k.trim().is_empty())?;
        Some(CaptchaChallenge {
            kind,
            site_key: site_key.trim().to_string(),
            page_url: page_url.to_string(),
        })
    })
}

/// Turns a challenge into a response token.
pub trait CaptchaSolver: Send + Sync + Clone {
    fn solve(
        &self,
        challenge: &CaptchaChallenge,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

#[derive(Debug, Deserialize)]
struct SolverResponse {
    status: u8,
    request: String,
}

/// 2Captcha client: submit via `in.php`, poll `res.php` until solved.
#[derive(Clone)]
pub struct TwoCaptchaSolver {
    client: Client,
    api_key: String,
    base_url: String,
    poll_interval: Duration,
    max_wait: Duration,
}

impl TwoCaptchaSolver {
    pub fn new(api_key: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, TWOCAPTCHA_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(180),
        })
    }

    pub fn with_polling(mut self, interval: Duration, max_wait: Duration) -> Self {
        self.poll_interval = interval;
        self.max_wait = max_wait;
        self
    }

    async fn call(&self, path: &str, params: &[(&str, &str)]) -> Result<SolverResponse, AppError> {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("key", self.api_key.as_str()), ("json", "1")])
            .query(params)
            .send()
            .await
            .map_err(|e| map_transport_error(e, 30))?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Err(AppError::ServerError {
                status,
                message: format!("2Captcha {path} returned HTTP {status}"),
            });
        }
        let body = response
            .text()
            .await
            .map_err(|e| AppError::HttpError(e.to_string()))?;
        Ok(serde_json::from_str(&body)?)
    }
}

impl CaptchaSolver for TwoCaptchaSolver {
    async fn solve(&self, challenge: &CaptchaChallenge) -> Result<String, AppError> {
        let submitted = self
            .call(
                "in.php",
                &[
                    ("method", challenge.kind.method()),
                    (challenge.kind.key_param(), challenge.site_key.as_str()),
                    ("pageurl", challenge.page_url.as_str()),
                ],
            )
            .await?;
        let task_id = match interpret(submitted)? {
            Some(id) => id,
            None => return Err(AppError::Generic("2Captcha accepted no task".into())),
        };
        tracing::info!(task_id = %task_id, kind = ?challenge.kind, "Submitted CAPTCHA");

        let started = Instant::now();
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let polled = self
                .call(
                    "res.php",
                    &[("action", "get"), ("id", task_id.as_str())],
                )
                .await?;
            if let Some(token) = interpret(polled)? {
                tracing::info!(task_id = %task_id, elapsed_s = started.elapsed().as_secs(), "CAPTCHA solved");
                return Ok(token);
            }
            if started.elapsed() >= self.max_wait {
                return Err(AppError::Timeout(self.max_wait.as_secs()));
            }
        }
    }
}

/// `Some(value)` when done, `None` while the task is still pending.
fn interpret(response: SolverResponse) -> Result<Option<String>, AppError> {
    match (response.status, response.request.as_str()) {
        (1, value) => Ok(Some(value.to_string())),
        (_, "CAPCHA_NOT_READY") => Ok(None),
        (_, "ERROR_ZERO_BALANCE" | "ERROR_WRONG_USER_KEY" | "ERROR_KEY_DOES_NOT_EXIST") => Err(
            AppError::ConfigError(format!("2Captcha rejected the account: {}", response.request)),
        ),
        (_, "ERROR_NO_SLOT_AVAILABLE") => Err(AppError::RateLimitExceeded),
        (_, other) => Err(AppError::Generic(format!("2Captcha error: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u8, request: &str) -> SolverResponse {
        SolverResponse {
            status,
            request: request.into(),
        }
    }

    #[test]
    fn test_detect_recaptcha() {
        let html = r#"<form><div class="g-recaptcha" data-sitekey="6Lc-abc"></div></form>"#;
        let challenge = detect_challenge(html, "https://archive.ph/search/?q=x").unwrap();
        assert_eq!(challenge.kind, CaptchaKind::ReCaptchaV2);
        assert_eq!(challenge.site_key, "6Lc-abc");
    }

    #[test]
    fn test_detect_hcaptcha() {
        let html = r#"<div class="h-captcha" data-sitekey="10000000-ffff"></div>"#;
        let challenge = detect_challenge(html, "https://archive.ph/").unwrap();
        assert_eq!(challenge.kind, CaptchaKind::HCaptcha);
    }

    #[test]
    fn test_no_widget() {
        assert!(detect_challenge("<p>welcome</p>", "https://archive.ph/").is_none());
        assert!(detect_challenge(r#"<div data-sitekey=" "></div>"#, "https://archive.ph/").is_none());
    }

    #[test]
    fn test_interpret_responses() {
        assert_eq!(interpret(response(1, "token123")).unwrap().as_deref(), Some("token123"));
        assert_eq!(interpret(response(0, "CAPCHA_NOT_READY")).unwrap(), None);
        assert!(matches!(
            interpret(response(0, "ERROR_ZERO_BALANCE")),
            Err(AppError::ConfigError(_))
        ));
        assert!(matches!(
            interpret(response(0, "ERROR_NO_SLOT_AVAILABLE")),
            Err(AppError::RateLimitExceeded)
        ));
    }
}

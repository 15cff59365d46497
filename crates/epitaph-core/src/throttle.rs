//! Request pacing for providers and fetch steps.
//!
//! A [`RateLimiter`] is a cheap `Clone` handle over shared state: every clone
//! paces against the same clock, so one limiter per provider instance is
//! enough to keep concurrent callers from bypassing the delay.
//! [`ThrottledFetcher`] applies the same pacing per domain to any
//! [`Fetcher`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use epitaph_core::throttle::{RateLimiter, ThrottleConfig};
//!
//! # async fn run() {
//! let limiter = RateLimiter::new(
//!     ThrottleConfig::new(Duration::from_secs(2)).with_jitter(Duration::from_millis(250)),
//! );
//! limiter.wait().await;
//! // ... call the provider ...
//! limiter.wait().await; // sleeps until at least 2s after the first call
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use url::Url;

use crate::error::AppError;
use crate::models::FetchedPage;
use crate::traits::Fetcher;

/// Pacing parameters for a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleConfig {
    /// Minimum delay between consecutive calls.
    pub delay: Duration,

    /// Maximum random jitter added on top of the delay (uniform [0, jitter]).
    pub jitter: Duration,

    /// Ceiling for the delay after repeated rate-limit responses.
    pub max_delay: Duration,

    /// Factor applied to the current delay on a rate-limit response.
    /// `1` disables adaptive backoff.
    pub backoff_multiplier: u32,
}

impl ThrottleConfig {
    /// Fixed delay, no jitter, no adaptive backoff.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            jitter: Duration::ZERO,
            max_delay: delay,
            backoff_multiplier: 1,
        }
    }

    /// A limiter that never sleeps. Used by tests and unthrottled steps.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Double (or multiply) the delay on every rate-limit response, up to `max_delay`.
    pub fn with_backoff(mut self, multiplier: u32, max_delay: Duration) -> Self {
        self.backoff_multiplier = multiplier.max(1);
        self.max_delay = max_delay.max(self.delay);
        self
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.jitter.is_zero() {
            return base;
        }
        base + Duration::from_millis(rand_jitter_ms(self.jitter.as_millis() as u64))
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            jitter: Duration::from_millis(500),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1,
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    last_call: Option<Instant>,
    current_delay: Duration,
}

/// Shared pacing handle.
///
/// The state lock is held across the sleep, so concurrent `wait` calls on
/// the same limiter are served one after another, each a full delay apart.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: ThrottleConfig,
    state: Arc<Mutex<LimiterState>>,
}

impl RateLimiter {
    pub fn new(config: ThrottleConfig) -> Self {
        let state = LimiterState {
            last_call: None,
            current_delay: config.delay,
        };
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(ThrottleConfig::unlimited())
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Sleep until the configured delay has passed since the previous call,
    /// then record this call.
    pub async fn wait(&self) {
        let mut state = self.state.lock().await;
        if let Some(last) = state.last_call {
            let required = self.config.jittered(state.current_delay);
            let elapsed = last.elapsed();
            if elapsed < required {
                let sleep_for = required - elapsed;
                tracing::debug!(sleep_ms = %sleep_for.as_millis(), "Rate limiting");
                tokio::time::sleep(sleep_for).await;
            }
        }
        state.last_call = Some(Instant::now());
    }

    /// The upstream answered 429: grow the delay, capped at `max_delay`.
    pub async fn record_rate_limited(&self) {
        let mut state = self.state.lock().await;
        let grown = state
            .current_delay
            .max(Duration::from_millis(1))
            .saturating_mul(self.config.backoff_multiplier);
        state.current_delay = grown.min(self.config.max_delay);
        tracing::debug!(
            delay_ms = %state.current_delay.as_millis(),
            "Rate limited, backing off"
        );
    }

    /// A call went through: return to the base delay.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.current_delay = self.config.delay;
    }

    pub async fn current_delay(&self) -> Duration {
        self.state.lock().await.current_delay
    }
}

/// A [`Fetcher`] wrapper that paces requests per domain.
///
/// Each domain (scheme + host + port) gets its own [`RateLimiter`]; requests
/// to different domains never wait on each other.
#[derive(Clone)]
pub struct ThrottledFetcher<F> {
    inner: F,
    config: ThrottleConfig,
    limiters: Arc<Mutex<HashMap<String, RateLimiter>>>,
}

impl<F: Fetcher> ThrottledFetcher<F> {
    pub fn new(inner: F, config: ThrottleConfig) -> Self {
        Self {
            inner,
            config,
            limiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Extract the domain key from a URL (scheme://host:port).
    fn domain_key(url_str: &str) -> Option<String> {
        let url = Url::parse(url_str).ok()?;
        let host = url.host_str()?;
        let port = url
            .port_or_known_default()
            .map(|p| format!(":{p}"))
            .unwrap_or_default();
        Some(format!("{}://{}{}", url.scheme(), host, port))
    }

    async fn limiter_for(&self, domain: &str) -> RateLimiter {
        let mut map = self.limiters.lock().await;
        map.entry(domain.to_string())
            .or_insert_with(|| RateLimiter::new(self.config.clone()))
            .clone()
    }
}

impl<F: Fetcher> Fetcher for ThrottledFetcher<F> {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, AppError> {
        let Some(domain) = Self::domain_key(url) else {
            return self.inner.fetch(url).await;
        };
        let limiter = self.limiter_for(&domain).await;
        limiter.wait().await;
        let result = self.inner.fetch(url).await;
        match &result {
            Ok(_) => limiter.record_success().await,
            Err(AppError::RateLimitExceeded) => limiter.record_rate_limited().await,
            Err(_) => {}
        }
        result
    }
}

// xorshift seeded from the clock; enough for jitter, keeps `rand` out of the tree.
fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockFetcher;

    #[test]
    fn domain_key_extracts_correctly() {
        assert_eq!(
            ThrottledFetcher::<MockFetcher>::domain_key("https://apnews.com/search?q=1"),
            Some("https://apnews.com:443".to_string())
        );
        assert_eq!(
            ThrottledFetcher::<MockFetcher>::domain_key("http://localhost:8080/page"),
            Some("http://localhost:8080".to_string())
        );
        assert_eq!(
            ThrottledFetcher::<MockFetcher>::domain_key("not-a-url"),
            None
        );
    }

    #[test]
    fn jitter_is_bounded() {
        let config =
            ThrottleConfig::new(Duration::from_millis(100)).with_jitter(Duration::from_millis(50));
        for _ in 0..100 {
            let d = config.jittered(config.delay);
            assert!(d >= Duration::from_millis(100));
            assert!(d < Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn limiter_enforces_delay_between_calls() {
        let limiter = RateLimiter::new(ThrottleConfig::new(Duration::from_millis(80)));
        let start = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn concurrent_clones_share_the_same_clock() {
        let limiter = RateLimiter::new(ThrottleConfig::new(Duration::from_millis(60)));
        let start = Instant::now();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let l = limiter.clone();
                tokio::spawn(async move { l.wait().await })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        // Three calls need two full gaps.
        assert!(
            start.elapsed() >= Duration::from_millis(120),
            "elapsed: {:?}",
            start.elapsed()
        );
    }

    #[tokio::test]
    async fn rate_limited_doubles_delay_up_to_cap_and_success_resets() {
        let limiter = RateLimiter::new(
            ThrottleConfig::new(Duration::from_secs(5)).with_backoff(2, Duration::from_secs(15)),
        );
        limiter.record_rate_limited().await;
        assert_eq!(limiter.current_delay().await, Duration::from_secs(10));
        limiter.record_rate_limited().await;
        assert_eq!(limiter.current_delay().await, Duration::from_secs(15));
        limiter.record_success().await;
        assert_eq!(limiter.current_delay().await, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unlimited_never_sleeps() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        for _ in 0..10 {
            limiter.wait().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn throttled_fetcher_delays_same_domain_only() {
        let inner = MockFetcher::new("<html>ok</html>");
        let fetcher = ThrottledFetcher::new(inner, ThrottleConfig::new(Duration::from_millis(100)));

        let start = Instant::now();
        fetcher.fetch("http://example.com/a").await.unwrap();
        fetcher.fetch("http://other.com/a").await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(90));

        fetcher.fetch("http://example.com/b").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn throttled_fetcher_passes_through_errors() {
        let inner = MockFetcher::with_error(AppError::HttpError("fail".into()));
        let fetcher = ThrottledFetcher::new(inner, ThrottleConfig::unlimited());
        let err = fetcher.fetch("http://example.com").await.unwrap_err();
        assert!(matches!(err, AppError::HttpError(_)));
    }
}

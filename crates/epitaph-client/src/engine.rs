//! Production wiring shared by the CLI and the server.

use std::sync::Arc;

use epitaph_core::error::AppError;
use epitaph_core::orchestrator::EnrichmentOrchestrator;

use crate::cleaner::HtmdCleaner;
use crate::fallback::{FallbackConfig, FallbackFetchChain};
use crate::fetcher::ReqwestFetcher;
use crate::providers::{ProviderConfig, build_registry};

pub type DefaultFallback = FallbackFetchChain<ReqwestFetcher, HtmdCleaner>;
pub type DefaultOrchestrator = EnrichmentOrchestrator<DefaultFallback>;

/// Registry of every configured provider plus the fallback chain.
pub async fn build_orchestrator(
    config: &ProviderConfig,
) -> Result<Arc<DefaultOrchestrator>, AppError> {
    let fetcher = ReqwestFetcher::with_timeout(config.provider_timeout)?;
    let cleaner = HtmdCleaner::new();
    let registry = Arc::new(build_registry(config, fetcher.clone(), cleaner.clone())?);
    let fallback = FallbackFetchChain::new(fetcher, cleaner, FallbackConfig::default());

    #[cfg(feature = "browser")]
    let fallback = with_browser(fallback, config).await;

    Ok(Arc::new(EnrichmentOrchestrator::new(registry, fallback)))
}

/// Enables the interactive archive step when a solver key is configured and
/// a browser can be launched. Either missing only disables the step.
#[cfg(feature = "browser")]
async fn with_browser(chain: DefaultFallback, config: &ProviderConfig) -> DefaultFallback {
    use crate::browser::{ArchiveSearch, BrowserFetcher};
    use crate::captcha::TwoCaptchaSolver;

    let Some(key) = &config.twocaptcha_api_key else {
        return chain;
    };
    let solver = match TwoCaptchaSolver::new(key) {
        Ok(solver) => solver,
        Err(e) => {
            tracing::warn!(error = %e, "CAPTCHA solver unavailable, browser step disabled");
            return chain;
        }
    };
    match BrowserFetcher::new().await {
        Ok(browser) => {
            tracing::info!("Interactive archive step enabled");
            chain.with_interactive(ArchiveSearch::new(browser, solver))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Browser launch failed, browser step disabled");
            chain
        }
    }
}

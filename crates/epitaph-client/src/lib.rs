pub mod archive;
#[cfg(feature = "browser")]
pub mod browser;
pub mod captcha;
pub mod cleaner;
pub mod engine;
pub mod fallback;
pub mod fetcher;
pub mod heuristics;
pub mod llm;
pub mod providers;

#[cfg(feature = "browser")]
pub use browser::{ArchiveSearch, BrowserFetcher};
pub use cleaner::HtmdCleaner;
pub use engine::{DefaultFallback, DefaultOrchestrator, build_orchestrator};
pub use fallback::{FallbackConfig, FallbackFetchChain};
pub use fetcher::ReqwestFetcher;
pub use llm::OpenAiExtractor;
pub use providers::{ProviderConfig, build_registry};

pub mod aggregate;
pub mod batch;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod control;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod provenance;
pub mod provider;
pub mod rating;
pub mod replay;
pub mod retry;
pub mod run;
pub mod throttle;
pub mod traits;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use error::{AppError, FailureKind, ParseErrorKind};
pub use models::{DeathDetails, LookupResult, Subject, compute_hash};
pub use provider::{Provider, ProviderDescriptor, ProviderFamily, ProviderRegistry, ReliabilityTier};
pub use traits::{Cleaner, Extractor, FallbackFetcher, Fetcher};

use std::time::Duration;

use async_trait::async_trait;
use epitaph_core::error::AppError;
use epitaph_core::models::{RecoveredPage, Subject};
use epitaph_core::provider::{
    Provider, ProviderDescriptor, ProviderFamily, ProviderHit, ReliabilityTier,
};
use epitaph_core::throttle::RateLimiter;

use crate::heuristics::{extract_details, mentions_subject};

/// Keyword extraction over pages cited by earlier results. Free, and ranked
/// by the host of the page it read.
#[derive(Clone)]
pub struct HeuristicLinkParser {
    descriptor: ProviderDescriptor,
    limiter: RateLimiter,
}

impl HeuristicLinkParser {
    pub fn new() -> Self {
        Self {
            descriptor: ProviderDescriptor::free(
                "page_heuristics",
                ProviderFamily::LinkFollow,
                ReliabilityTier::Secondary,
            )
            .with_min_delay(Duration::ZERO),
            limiter: RateLimiter::unlimited(),
        }
    }
}

impl Default for HeuristicLinkParser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for HeuristicLinkParser {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    async fn perform_lookup(&self, _subject: &Subject) -> Result<ProviderHit, AppError> {
        Err(AppError::NotFound("page heuristics need a cited page".into()))
    }

    fn supports_recovery(&self) -> bool {
        true
    }

    async fn parse_page(
        &self,
        subject: &Subject,
        page: &RecoveredPage,
    ) -> Result<ProviderHit, AppError> {
        if !mentions_subject(subject, &page.text) {
            return Err(AppError::NotFound(format!(
                "{} does not mention {}",
                page.requested_url, subject.name
            )));
        }
        let mut details = extract_details(subject, &page.text);
        details.citations = vec![page.requested_url.clone()];
        let mut hit = ProviderHit::new(details).with_url(page.requested_url.clone());
        hit.tier = Some(ReliabilityTier::for_url(&page.requested_url));
        Ok(hit)
    }
}

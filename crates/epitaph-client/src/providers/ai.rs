//! LLM-backed providers.
//!
//! One extractor serves two roles: a knowledge lookup that asks the model
//! what it knows about a death, and a link reader that extracts facts from
//! a cited page during the link pass.

use std::time::Duration;

use async_trait::async_trait;
use epitaph_core::error::{AppError, ParseErrorKind};
use epitaph_core::models::{DeathDetails, RecoveredPage, Subject};
use epitaph_core::provider::{
    Provider, ProviderDescriptor, ProviderFamily, ProviderHit, ReliabilityTier,
};
use epitaph_core::throttle::RateLimiter;
use epitaph_core::traits::{Extractor, TokenUsage};

use super::limiter_for;
use crate::llm::parse_model_output;

/// Characters of page text handed to the link reader.
const MAX_PAGE_CHARS: usize = 12_000;

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Default for TokenPricing {
    fn default() -> Self {
        Self {
            input_per_million: 0.15,
            output_per_million: 0.60,
        }
    }
}

impl TokenPricing {
    pub fn cost(&self, usage: TokenUsage) -> f64 {
        (f64::from(usage.prompt_tokens) * self.input_per_million
            + f64::from(usage.completion_tokens) * self.output_per_million)
            / 1_000_000.0
    }
}

/// JSON schema the model's answer must satisfy.
pub fn death_details_schema() -> serde_json::Value {
    let nullable_string = serde_json::json!({"type": ["string", "null"]});
    let project = serde_json::json!({
        "type": "object",
        "properties": {
            "title": {"type": "string"},
            "year": {"type": ["integer", "null"]},
            "kind": {"type": ["string", "null"]}
        },
        "required": ["title"]
    });
    serde_json::json!({
        "type": "object",
        "properties": {
            "cause_of_death": nullable_string,
            "cause_of_death_details": nullable_string,
            "circumstances": nullable_string,
            "rumored_circumstances": nullable_string,
            "location_of_death": nullable_string,
            "career_status_at_death": nullable_string,
            "notable_factors": {"type": "array", "items": {"type": "string"}},
            "related_people": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": {"type": "string"},
                        "relationship": {"type": "string"},
                        "details": {"type": ["string", "null"]}
                    },
                    "required": ["name", "relationship"]
                }
            },
            "last_project": {"anyOf": [project.clone(), {"type": "null"}]},
            "posthumous_releases": {"type": "array", "items": project},
            "citations": {"type": "array", "items": {"type": "string"}},
            "confidence": {"type": ["number", "null"], "minimum": 0, "maximum": 1}
        },
        "required": ["cause_of_death"]
    })
}

const KNOWLEDGE_INSTRUCTIONS: &str = "You research how notable people died. \
Answer only from what you know with reasonable certainty. Use null for unknown \
fields and never guess. Put unverified claims in rumored_circumstances. \
Report your overall confidence between 0 and 1.";

const READER_INSTRUCTIONS: &str = "Extract how the named person died from the \
article below. Use only facts stated in the article. Use null for anything the \
article does not say. Report your overall confidence between 0 and 1.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Knowledge,
    LinkReader,
}

/// An [`Extractor`] exposed as a provider.
#[derive(Clone)]
pub struct AiProvider<E> {
    extractor: E,
    pricing: TokenPricing,
    mode: Mode,
    descriptor: ProviderDescriptor,
    limiter: RateLimiter,
    timeout: Duration,
}

impl<E: Extractor> AiProvider<E> {
    /// Ask the model directly. Lowest tier, ranked last among paid sources.
    pub fn knowledge(extractor: E, pricing: TokenPricing) -> Self {
        let descriptor = ProviderDescriptor::paid(
            "openai",
            ProviderFamily::AiModel,
            ReliabilityTier::AiInference,
            0.01,
        );
        Self::build(extractor, pricing, Mode::Knowledge, descriptor)
    }

    /// Read pages cited by earlier results.
    pub fn link_reader(extractor: E, pricing: TokenPricing) -> Self {
        let descriptor = ProviderDescriptor::paid(
            "openai_reader",
            ProviderFamily::LinkFollow,
            ReliabilityTier::AiInference,
            0.01,
        );
        Self::build(extractor, pricing, Mode::LinkReader, descriptor)
    }

    fn build(extractor: E, pricing: TokenPricing, mode: Mode, descriptor: ProviderDescriptor) -> Self {
        let descriptor = descriptor.with_min_delay(Duration::from_millis(500));
        Self {
            extractor,
            pricing,
            mode,
            limiter: limiter_for(&descriptor),
            descriptor,
            timeout: Duration::from_secs(120),
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

    async fn ask(&self, instructions: &str, content: &str) -> Result<ProviderHit, AppError> {
        let extraction = self
            .extractor
            .extract(instructions, content, &death_details_schema())
            .await?;
        let cost = self.pricing.cost(extraction.usage);
        tracing::debug!(
            provider = %self.descriptor.name,
            prompt_tokens = extraction.usage.prompt_tokens,
            completion_tokens = extraction.usage.completion_tokens,
            cost,
            "LLM extraction finished"
        );
        Ok(hit_from_value(extraction.data, &extraction.raw)?.with_cost(cost))
    }
}

/// Typed details from validated model output. The model's own confidence,
/// when given, replaces the tier default.
fn hit_from_value(data: serde_json::Value, raw: &str) -> Result<ProviderHit, AppError> {
    let confidence = data.get("confidence").and_then(serde_json::Value::as_f64);
    let details: DeathDetails =
        serde_json::from_value(data.clone()).map_err(|e| AppError::Parse {
            kind: ParseErrorKind::SchemaMismatch,
            message: format!("Model output does not match death details: {e}"),
            raw: raw.to_string(),
        })?;
    let mut hit = ProviderHit::new(details).with_raw(data);
    if let Some(confidence) = confidence {
        hit = hit.with_confidence(confidence);
    }
    Ok(hit)
}

fn knowledge_prompt(subject: &Subject) -> String {
    let died = subject
        .deathday
        .map(|d| format!(" who died on {d}"))
        .unwrap_or_default();
    format!("How did {}{died} die?", subject.name)
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl<E: Extractor + 'static> Provider for AiProvider<E> {
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
        match self.mode {
            Mode::Knowledge => {
                let prompt = knowledge_prompt(subject);
                Ok(self.ask(KNOWLEDGE_INSTRUCTIONS, &prompt).await?.with_query(prompt))
            }
            Mode::LinkReader => Err(AppError::NotFound(
                "the link reader only parses cited pages".into(),
            )),
        }
    }

    fn supports_recovery(&self) -> bool {
        true
    }

    async fn parse_page(
        &self,
        subject: &Subject,
        page: &RecoveredPage,
    ) -> Result<ProviderHit, AppError> {
        let content = format!(
            "Person: {}\nArticle: {}\n\n{}",
            subject.name,
            page.title.as_deref().unwrap_or(&page.requested_url),
            truncate_chars(&page.text, MAX_PAGE_CHARS)
        );
        let mut hit = self.ask(READER_INSTRUCTIONS, &content).await?;
        hit.tier = Some(ReliabilityTier::for_url(&page.requested_url));
        Ok(hit.with_url(page.requested_url.clone()))
    }

    fn parse_payload(&self, _subject: &Subject, raw: &str) -> Result<ProviderHit, AppError> {
        let data = parse_model_output(raw, &death_details_schema())?;
        hit_from_value(data, raw)
    }
}

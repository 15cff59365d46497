use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use epitaph_core::error::{AppError, ParseErrorKind};
use epitaph_core::models::{DeathDetails, Subject};
use epitaph_core::provider::{
    Provider, ProviderDescriptor, ProviderFamily, ProviderHit, ReliabilityTier,
};
use epitaph_core::throttle::RateLimiter;
use epitaph_core::traits::Fetcher;
use serde::Deserialize;
use url::Url;

use super::limiter_for;

pub const WIKIDATA_SPARQL_URL: &str = "https://query.wikidata.org/sparql";

/// Structured death facts from Wikidata: cause (P509), manner (P1196) and
/// place (P20) of death, matched on English label and year of death.
#[derive(Clone)]
pub struct WikidataProvider<F> {
    fetcher: F,
    descriptor: ProviderDescriptor,
    limiter: RateLimiter,
    timeout: Duration,
}

impl<F: Fetcher> WikidataProvider<F> {
    pub fn new(fetcher: F) -> Self {
        let descriptor = ProviderDescriptor::free(
            "wikidata",
            ProviderFamily::StructuredKnowledgeBase,
            ReliabilityTier::Trade,
        )
        .with_min_delay(Duration::from_millis(500));
        Self {
            fetcher,
            limiter: limiter_for(&descriptor),
            descriptor,
            timeout: Duration::from_secs(30),
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
}

/// SPARQL selecting people with this English label who died in the
/// subject's death year.
pub fn sparql_query(subject: &Subject) -> String {
    let label = subject.name.replace('\\', "\\\\").replace('"', "\\\"");
    let year_filter = subject
        .death_year()
        .map(|y| format!("FILTER(YEAR(?death) = {y})"))
        .unwrap_or_default();
    format!(
        r#"SELECT ?person ?causeLabel ?mannerLabel ?placeLabel WHERE {{
  ?person rdfs:label "{label}"@en ;
          wdt:P31 wd:Q5 ;
          wdt:P570 ?death .
  {year_filter}
  OPTIONAL {{ ?person wdt:P509 ?cause . }}
  OPTIONAL {{ ?person wdt:P1196 ?manner . }}
  OPTIONAL {{ ?person wdt:P20 ?place . }}
  SERVICE wikibase:label {{ bd:serviceParam wikibase:language "en". }}
}} LIMIT 20"#
    )
}

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    results: SparqlResults,
}

#[derive(Debug, Deserialize)]
struct SparqlResults {
    bindings: Vec<HashMap<String, SparqlValue>>,
}

#[derive(Debug, Deserialize)]
struct SparqlValue {
    value: String,
}

/// Turn a SPARQL JSON response into death details for the first entity.
pub fn parse_bindings(raw: &str) -> Result<ProviderHit, AppError> {
    let response: SparqlResponse = serde_json::from_str(raw).map_err(|e| AppError::Parse {
        kind: ParseErrorKind::InvalidJson,
        message: format!("Wikidata returned invalid JSON: {e}"),
        raw: raw.to_string(),
    })?;

    let bindings = response.results.bindings;
    let Some(person) = bindings
        .first()
        .and_then(|b| b.get("person"))
        .map(|v| v.value.clone())
    else {
        return Err(AppError::NotFound("no matching Wikidata entity".into()));
    };

    let mut causes: Vec<String> = Vec::new();
    let mut manners: Vec<String> = Vec::new();
    let mut places: Vec<String> = Vec::new();
    for row in bindings
        .iter()
        .filter(|b| b.get("person").is_some_and(|p| p.value == person))
    {
        push_label(&mut causes, row.get("causeLabel"));
        push_label(&mut manners, row.get("mannerLabel"));
        push_label(&mut places, row.get("placeLabel"));
    }

    let details = DeathDetails {
        cause_of_death: causes.first().cloned(),
        cause_of_death_details: (causes.len() > 1)
            .then(|| format!("Contributing causes: {}", causes[1..].join(", "))),
        location_of_death: places.first().cloned(),
        notable_factors: manners,
        citations: vec![person.clone()],
        ..Default::default()
    };

    Ok(ProviderHit::new(details)
        .with_url(person.clone())
        .with_raw(serde_json::json!({
            "entity": person,
            "causes": causes,
            "places": places,
        })))
}

/// Labels the label service could not resolve come back as bare Q-ids.
fn push_label(into: &mut Vec<String>, value: Option<&SparqlValue>) {
    let Some(label) = value.map(|v| v.value.trim()) else {
        return;
    };
    let unresolved = label.starts_with('Q') && label[1..].chars().all(|c| c.is_ascii_digit());
    if label.is_empty() || unresolved || into.iter().any(|l| l == label) {
        return;
    }
    into.push(label.to_string());
}

#[async_trait]
impl<F: Fetcher + 'static> Provider for WikidataProvider<F> {
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
        let query = sparql_query(subject);
        let url = Url::parse_with_params(WIKIDATA_SPARQL_URL, &[("format", "json"), ("query", &query)])
            .map_err(|e| AppError::Generic(format!("Invalid SPARQL URL: {e}")))?;
        let page = self.fetcher.fetch(url.as_str()).await?;
        Ok(parse_bindings(&page.body)?.with_query(query))
    }

    fn parse_payload(&self, _subject: &Subject, raw: &str) -> Result<ProviderHit, AppError> {
        parse_bindings(raw)
    }
}

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{FailureKind, ParseErrorKind};
use crate::provider::{ProviderDescriptor, ProviderFamily, ReliabilityTier};

/// A deceased person whose death is being documented.
///
/// Subjects are owned by the catalog; the engine only reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: i64,
    pub name: String,
    pub birthday: Option<NaiveDate>,
    pub deathday: Option<NaiveDate>,
    pub cause_of_death: Option<String>,
    pub cause_of_death_details: Option<String>,
    pub death_location: Option<String>,
    pub enrichment_attempts: u32,
    pub last_enrichment_attempt: Option<DateTime<Utc>>,
    pub enrichment_permanently_failed: bool,
}

impl Subject {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            birthday: None,
            deathday: None,
            cause_of_death: None,
            cause_of_death_details: None,
            death_location: None,
            enrichment_attempts: 0,
            last_enrichment_attempt: None,
            enrichment_permanently_failed: false,
        }
    }

    pub fn with_birthday(mut self, date: NaiveDate) -> Self {
        self.birthday = Some(date);
        self
    }

    pub fn with_deathday(mut self, date: NaiveDate) -> Self {
        self.deathday = Some(date);
        self
    }

    pub fn with_cause_of_death(mut self, cause: impl Into<String>) -> Self {
        self.cause_of_death = Some(cause.into());
        self
    }

    pub fn death_year(&self) -> Option<i32> {
        use chrono::Datelike;
        self.deathday.map(|d| d.year())
    }

    /// Last whitespace-separated token of the name.
    pub fn surname(&self) -> &str {
        self.name.split_whitespace().last().unwrap_or(&self.name)
    }

    /// Free-text query used by search-style providers.
    pub fn search_query(&self) -> String {
        match self.death_year() {
            Some(year) => format!("{} death {}", self.name, year),
            None => format!("{} death", self.name),
        }
    }

    /// The value currently stored for a primary field.
    pub fn known_value(&self, field: ClaimField) -> Option<&str> {
        let value = match field {
            ClaimField::CauseOfDeath => self.cause_of_death.as_deref(),
            ClaimField::CauseOfDeathDetails => self.cause_of_death_details.as_deref(),
            ClaimField::DeathLocation => self.death_location.as_deref(),
            _ => None,
        };
        value.filter(|v| !v.trim().is_empty())
    }

    /// Check the subject carries enough identity to be enriched.
    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.name.trim().is_empty() {
            return Err(crate::error::AppError::ValidationError(format!(
                "subject {} has no name",
                self.id
            )));
        }
        if self.deathday.is_none() {
            return Err(crate::error::AppError::ValidationError(format!(
                "subject {} ({}) has no death date",
                self.id, self.name
            )));
        }
        Ok(())
    }
}

/// Fields a provider can make a claim about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimField {
    CauseOfDeath,
    CauseOfDeathDetails,
    DeathLocation,
    Circumstances,
    RumoredCircumstances,
    CareerStatus,
    LastProject,
}

impl ClaimField {
    pub const ALL: [ClaimField; 7] = [
        ClaimField::CauseOfDeath,
        ClaimField::CauseOfDeathDetails,
        ClaimField::DeathLocation,
        ClaimField::Circumstances,
        ClaimField::RumoredCircumstances,
        ClaimField::CareerStatus,
        ClaimField::LastProject,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimField::CauseOfDeath => "cause_of_death",
            ClaimField::CauseOfDeathDetails => "cause_of_death_details",
            ClaimField::DeathLocation => "death_location",
            ClaimField::Circumstances => "circumstances",
            ClaimField::RumoredCircumstances => "rumored_circumstances",
            ClaimField::CareerStatus => "career_status_at_death",
            ClaimField::LastProject => "last_project",
        }
    }

    /// Primary fields live on the subject row and are written fill-if-empty.
    pub fn is_primary(&self) -> bool {
        matches!(
            self,
            ClaimField::CauseOfDeath | ClaimField::CauseOfDeathDetails | ClaimField::DeathLocation
        )
    }

    /// Narrative fields may require structured corroboration.
    pub fn is_narrative(&self) -> bool {
        matches!(
            self,
            ClaimField::CauseOfDeathDetails
                | ClaimField::Circumstances
                | ClaimField::RumoredCircumstances
        )
    }
}

impl fmt::Display for ClaimField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ClaimField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClaimField::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| format!("Unknown claim field: {s}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedPerson {
    pub name: String,
    pub relationship: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.year {
            Some(year) => write!(f, "{} ({year})", self.title),
            None => write!(f, "{}", self.title),
        }
    }
}

/// Typed payload of a successful lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeathDetails {
    pub cause_of_death: Option<String>,
    pub cause_of_death_details: Option<String>,
    pub circumstances: Option<String>,
    pub rumored_circumstances: Option<String>,
    pub location_of_death: Option<String>,
    pub notable_factors: Vec<String>,
    pub related_people: Vec<RelatedPerson>,
    pub career_status_at_death: Option<String>,
    pub last_project: Option<Project>,
    pub posthumous_releases: Vec<Project>,
    pub citations: Vec<String>,
}

impl DeathDetails {
    /// The claim this payload makes for `field`, if any.
    pub fn field(&self, field: ClaimField) -> Option<String> {
        let value = match field {
            ClaimField::CauseOfDeath => self.cause_of_death.clone(),
            ClaimField::CauseOfDeathDetails => self.cause_of_death_details.clone(),
            ClaimField::DeathLocation => self.location_of_death.clone(),
            ClaimField::Circumstances => self.circumstances.clone(),
            ClaimField::RumoredCircumstances => self.rumored_circumstances.clone(),
            ClaimField::CareerStatus => self.career_status_at_death.clone(),
            ClaimField::LastProject => self.last_project.as_ref().map(ToString::to_string),
        };
        value.filter(|v| !v.trim().is_empty())
    }

    pub fn has_citations(&self) -> bool {
        !self.citations.is_empty()
    }

    /// True when no field and no list carries anything.
    pub fn is_empty(&self) -> bool {
        ClaimField::ALL.iter().all(|f| self.field(*f).is_none())
            && self.notable_factors.is_empty()
            && self.related_people.is_empty()
            && self.posthumous_releases.is_empty()
    }
}

/// Provenance of one provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub provider: String,
    pub family: ProviderFamily,
    pub tier: ReliabilityTier,
    pub url: Option<String>,
    pub query: Option<String>,
    pub retrieved_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub confidence: f64,
    pub cost: f64,
    pub fetch_method: Option<FetchMethod>,
    pub raw: Option<serde_json::Value>,
}

impl SourceEntry {
    pub fn new(descriptor: &ProviderDescriptor) -> Self {
        Self {
            provider: descriptor.name.clone(),
            family: descriptor.family,
            tier: descriptor.tier,
            url: None,
            query: None,
            retrieved_at: Utc::now(),
            elapsed_ms: 0,
            confidence: descriptor.tier.base_confidence(),
            cost: 0.0,
            fetch_method: None,
            raw: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = clamp_confidence(confidence);
        self
    }
}

/// Why a lookup did not produce data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupFailure {
    pub kind: FailureKind,
    pub message: String,
    pub blocked_url: Option<String>,
    pub raw_payload: Option<String>,
    pub parse_kind: Option<ParseErrorKind>,
}

impl LookupFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind,
            message: if message.trim().is_empty() {
                format!("{kind} (no message)")
            } else {
                message
            },
            blocked_url: None,
            raw_payload: None,
            parse_kind: None,
        }
    }

    pub fn from_error(err: &crate::error::AppError) -> Self {
        let mut failure = Self::new(err.failure_kind(), err.to_string());
        failure.blocked_url = err.blocked_url().map(str::to_string);
        failure.raw_payload = err.raw_payload().map(str::to_string);
        if let crate::error::AppError::Parse { kind, .. } = err {
            failure.parse_kind = Some(*kind);
        }
        failure
    }
}

/// Envelope of one provider call.
///
/// The outcome is either typed data or a failure with a non-empty message,
/// so a success without data cannot be represented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupResult {
    pub source: SourceEntry,
    pub outcome: Result<DeathDetails, LookupFailure>,
}

impl LookupResult {
    pub fn succeeded(source: SourceEntry, data: DeathDetails) -> Self {
        Self {
            source,
            outcome: Ok(data),
        }
    }

    pub fn failed(source: SourceEntry, failure: LookupFailure) -> Self {
        Self {
            source,
            outcome: Err(failure),
        }
    }

    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn data(&self) -> Option<&DeathDetails> {
        self.outcome.as_ref().ok()
    }

    pub fn failure(&self) -> Option<&LookupFailure> {
        self.outcome.as_ref().err()
    }

    pub fn error(&self) -> Option<&str> {
        self.failure().map(|f| f.message.as_str())
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure().map(|f| f.kind)
    }

    pub fn blocked_url(&self) -> Option<&str> {
        self.failure().and_then(|f| f.blocked_url.as_deref())
    }
}

/// Raw page as returned by a [`crate::traits::Fetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    /// URL after redirects.
    pub final_url: String,
    pub status: u16,
    pub body: String,
}

impl FetchedPage {
    pub fn ok(final_url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            final_url: final_url.into(),
            status: 200,
            body: body.into(),
        }
    }
}

/// Which step of the fallback chain produced a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMethod {
    Direct,
    Wayback,
    ArchiveToday,
    Browser,
}

impl FetchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMethod::Direct => "direct",
            FetchMethod::Wayback => "wayback",
            FetchMethod::ArchiveToday => "archive_today",
            FetchMethod::Browser => "browser",
        }
    }

    pub fn is_archive(&self) -> bool {
        !matches!(self, FetchMethod::Direct)
    }
}

impl fmt::Display for FetchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Page content recovered by the fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveredPage {
    pub method: FetchMethod,
    pub requested_url: String,
    pub resolved_url: String,
    pub title: Option<String>,
    pub text: String,
    /// Raw HTML, kept for parsers that need markup.
    #[serde(skip)]
    pub html: String,
}

/// One fallback step that did not yield usable content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackAttempt {
    pub method: FetchMethod,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FallbackOutcome {
    Recovered(RecoveredPage),
    Unavailable { attempts: Vec<FallbackAttempt> },
}

impl FallbackOutcome {
    pub fn page(&self) -> Option<&RecoveredPage> {
        match self {
            FallbackOutcome::Recovered(page) => Some(page),
            FallbackOutcome::Unavailable { .. } => None,
        }
    }
}

/// Append-only audit row for one field mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub subject_id: i64,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub source: String,
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A raw provider response awaiting replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub subject_id: i64,
    pub provider: String,
    pub raw_payload: String,
    pub payload_hash: String,
    pub error_kind: FailureKind,
    pub parse_kind: Option<ParseErrorKind>,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub reprocessed_at: Option<DateTime<Utc>>,
    pub reprocess_result: Option<String>,
    /// Replays that still failed to parse; the row stays queued.
    pub replay_attempts: u32,
    pub last_replay_error: Option<String>,
}

/// DTO for inserting a failure record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewFailureRecord {
    pub run_id: Uuid,
    pub subject_id: i64,
    pub provider: String,
    pub raw_payload: String,
    pub payload_hash: String,
    pub error_kind: FailureKind,
    pub parse_kind: Option<ParseErrorKind>,
    pub error_message: String,
}

impl NewFailureRecord {
    /// Build a record from a failed lookup, if it carries a replayable payload.
    pub fn from_result(run_id: Uuid, subject_id: i64, result: &LookupResult) -> Option<Self> {
        let failure = result.failure()?;
        if failure.kind != FailureKind::Parse {
            return None;
        }
        let raw = failure.raw_payload.as_ref()?;
        Some(Self {
            run_id,
            subject_id,
            provider: result.source.provider.clone(),
            raw_payload: raw.clone(),
            payload_hash: compute_hash(raw),
            error_kind: failure.kind,
            parse_kind: failure.parse_kind,
            error_message: failure.message.clone(),
        })
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Clamp a confidence into [0, 1]; NaN becomes 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    fn descriptor() -> ProviderDescriptor {
        ProviderDescriptor::free("wikidata", ProviderFamily::StructuredKnowledgeBase, ReliabilityTier::Trade)
    }

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(compute_hash("hello"), compute_hash("world"));
    }

    #[test]
    fn test_confidence_is_clamped() {
        let source = SourceEntry::new(&descriptor()).with_confidence(1.7);
        assert_eq!(source.confidence, 1.0);
        let source = SourceEntry::new(&descriptor()).with_confidence(-0.2);
        assert_eq!(source.confidence, 0.0);
        assert_eq!(clamp_confidence(f64::NAN), 0.0);
    }

    #[test]
    fn test_failure_message_never_empty() {
        let failure = LookupFailure::new(FailureKind::NotFound, "   ");
        assert!(!failure.message.trim().is_empty());
    }

    #[test]
    fn test_failure_from_blocked_error_keeps_url() {
        let err = AppError::AccessBlocked {
            url: "https://variety.com/x".into(),
            status: 403,
        };
        let failure = LookupFailure::from_error(&err);
        assert_eq!(failure.kind, FailureKind::AccessBlocked);
        assert_eq!(failure.blocked_url.as_deref(), Some("https://variety.com/x"));
    }

    #[test]
    fn test_lookup_result_accessors() {
        let ok = LookupResult::succeeded(
            SourceEntry::new(&descriptor()),
            DeathDetails {
                cause_of_death: Some("heart attack".into()),
                ..Default::default()
            },
        );
        assert!(ok.success());
        assert!(ok.data().is_some());
        assert!(ok.error().is_none());

        let failed = LookupResult::failed(
            SourceEntry::new(&descriptor()),
            LookupFailure::new(FailureKind::NotFound, "no entity"),
        );
        assert!(!failed.success());
        assert_eq!(failed.error(), Some("no entity"));
    }

    #[test]
    fn test_death_details_field_ignores_blank_values() {
        let details = DeathDetails {
            cause_of_death: Some("  ".into()),
            last_project: Some(Project {
                title: "The Last Film".into(),
                year: Some(2019),
                kind: None,
            }),
            ..Default::default()
        };
        assert_eq!(details.field(ClaimField::CauseOfDeath), None);
        assert_eq!(
            details.field(ClaimField::LastProject).as_deref(),
            Some("The Last Film (2019)")
        );
        assert!(!details.is_empty());
        assert!(DeathDetails::default().is_empty());
    }

    #[test]
    fn test_subject_validation() {
        let subject = Subject::new(1, "Jane Doe");
        assert!(matches!(subject.validate(), Err(AppError::ValidationError(_))));
        let subject = subject.with_deathday(NaiveDate::from_ymd_opt(2020, 1, 2).unwrap());
        assert!(subject.validate().is_ok());
        assert_eq!(subject.search_query(), "Jane Doe death 2020");
        assert_eq!(subject.surname(), "Doe");
    }

    #[test]
    fn test_failure_record_only_for_parse_failures() {
        let run_id = Uuid::new_v4();
        let mut failure = LookupFailure::new(FailureKind::Parse, "bad json");
        failure.raw_payload = Some("{oops".into());
        let result = LookupResult::failed(SourceEntry::new(&descriptor()), failure);
        let record = NewFailureRecord::from_result(run_id, 7, &result).unwrap();
        assert_eq!(record.subject_id, 7);
        assert_eq!(record.payload_hash, compute_hash("{oops"));

        let not_found = LookupResult::failed(
            SourceEntry::new(&descriptor()),
            LookupFailure::new(FailureKind::NotFound, "none"),
        );
        assert!(NewFailureRecord::from_result(run_id, 7, &not_found).is_none());
    }
}

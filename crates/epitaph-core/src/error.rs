use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error types for Epitaph.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed (fetching a page).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// The origin refused access (401/403, bot wall, challenge page).
    #[error("Access blocked (HTTP {status}) for {url}")]
    AccessBlocked { url: String, status: u16 },

    /// The provider ran and had nothing to report.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Upstream returned a 5xx.
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// LLM API call failed.
    #[error("LLM error (HTTP {status_code}): {message}")]
    LlmError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// HTML-to-text conversion failed.
    #[error("Cleaner error: {0}")]
    CleanerError(String),

    /// A provider payload could not be parsed or validated.
    #[error("Parse error ({kind}): {message}")]
    Parse {
        kind: ParseErrorKind,
        message: String,
        raw: String,
    },

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Every provider consulted for a subject failed transiently.
    #[error("Providers unavailable: {0}")]
    ProvidersUnavailable(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input failed validation (e.g. a subject without a death date).
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A cost ceiling was reached.
    #[error("Budget exceeded: spent ${spent:.4} of ${limit:.4}")]
    BudgetExceeded { spent: f64, limit: f64 },

    /// A run with the same run type is already active.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

/// Coarse classification that drives retry, fallback and replay decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Provider ran, nothing to report. Not retried within a run.
    NotFound,
    /// Paywall or bot wall; eligible for the fallback fetch chain.
    AccessBlocked,
    /// Network, timeout or server error. Retried with backoff.
    Transient,
    /// Validation failure or confirmed absence after retries.
    Permanent,
    /// Cost ceiling reached; a normal early stop.
    BudgetExceeded,
    /// Raw payload could not be parsed; stored for replay.
    Parse,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NotFound => "not_found",
            FailureKind::AccessBlocked => "access_blocked",
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::BudgetExceeded => "budget_exceeded",
            FailureKind::Parse => "parse",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "not_found" => Ok(FailureKind::NotFound),
            "access_blocked" => Ok(FailureKind::AccessBlocked),
            "transient" => Ok(FailureKind::Transient),
            "permanent" => Ok(FailureKind::Permanent),
            "budget_exceeded" => Ok(FailureKind::BudgetExceeded),
            "parse" => Ok(FailureKind::Parse),
            _ => Err(format!("Unknown failure kind: {s}")),
        }
    }
}

/// Why a provider payload was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    InvalidJson,
    SchemaMismatch,
    EmptyResponse,
    UnexpectedMarkup,
}

impl ParseErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseErrorKind::InvalidJson => "invalid_json",
            ParseErrorKind::SchemaMismatch => "schema_mismatch",
            ParseErrorKind::EmptyResponse => "empty_response",
            ParseErrorKind::UnexpectedMarkup => "unexpected_markup",
        }
    }
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ParseErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invalid_json" => Ok(ParseErrorKind::InvalidJson),
            "schema_mismatch" => Ok(ParseErrorKind::SchemaMismatch),
            "empty_response" => Ok(ParseErrorKind::EmptyResponse),
            "unexpected_markup" => Ok(ParseErrorKind::UnexpectedMarkup),
            _ => Err(format!("Unknown parse error kind: {s}")),
        }
    }
}

impl AppError {
    /// Map this error onto the failure taxonomy.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AppError::NotFound(_) => FailureKind::NotFound,
            AppError::AccessBlocked { .. } => FailureKind::AccessBlocked,
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::ServerError { .. }
            | AppError::ProvidersUnavailable(_)
            | AppError::DatabaseError(_) => FailureKind::Transient,
            AppError::LlmError { retryable, .. } => {
                if *retryable {
                    FailureKind::Transient
                } else {
                    FailureKind::Permanent
                }
            }
            AppError::HttpError(msg) => {
                if msg.contains("timeout") || msg.contains("connect") || msg.contains("reset") {
                    FailureKind::Transient
                } else {
                    FailureKind::Permanent
                }
            }
            AppError::Parse { .. } | AppError::SerializationError(_) => FailureKind::Parse,
            AppError::BudgetExceeded { .. } => FailureKind::BudgetExceeded,
            AppError::CleanerError(_)
            | AppError::ConfigError(_)
            | AppError::ValidationError(_)
            | AppError::Conflict(_)
            | AppError::Generic(_) => FailureKind::Permanent,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }

    /// Returns true if this error counts towards the run-level circuit breaker.
    pub fn should_trip_circuit(&self) -> bool {
        match self {
            AppError::LlmError { status_code, .. } => *status_code == 429 || *status_code >= 500,
            other => other.is_retryable(),
        }
    }

    /// The blocked URL, when this is an access denial.
    pub fn blocked_url(&self) -> Option<&str> {
        match self {
            AppError::AccessBlocked { url, .. } => Some(url),
            _ => None,
        }
    }

    /// The raw payload carried by a parse failure, for the replay store.
    pub fn raw_payload(&self) -> Option<&str> {
        match self {
            AppError::Parse { raw, .. } if !raw.is_empty() => Some(raw),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(AppError::NetworkError("reset".into()).is_retryable());
        assert!(AppError::Timeout(30).is_retryable());
        assert!(AppError::RateLimitExceeded.is_retryable());
        assert!(
            AppError::ServerError {
                status: 502,
                message: "bad gateway".into()
            }
            .is_retryable()
        );
        assert!(
            AppError::LlmError {
                message: "server error".into(),
                status_code: 500,
                retryable: true,
            }
            .is_retryable()
        );
        assert!(!AppError::CleanerError("bad html".into()).is_retryable());
        assert!(!AppError::NotFound("nothing".into()).is_retryable());
    }

    #[test]
    fn test_access_blocked_is_not_not_found() {
        let err = AppError::AccessBlocked {
            url: "https://example.com/obit".into(),
            status: 403,
        };
        assert_eq!(err.failure_kind(), FailureKind::AccessBlocked);
        assert_ne!(err.failure_kind(), FailureKind::NotFound);
        assert_eq!(err.blocked_url(), Some("https://example.com/obit"));
        assert!(!err.should_trip_circuit());
    }

    #[test]
    fn test_parse_errors_carry_raw_payload() {
        let err = AppError::Parse {
            kind: ParseErrorKind::InvalidJson,
            message: "expected value".into(),
            raw: "{not json".into(),
        };
        assert_eq!(err.failure_kind(), FailureKind::Parse);
        assert_eq!(err.raw_payload(), Some("{not json"));
    }

    #[test]
    fn test_circuit_tripping() {
        assert!(AppError::RateLimitExceeded.should_trip_circuit());
        assert!(AppError::Timeout(30).should_trip_circuit());
        assert!(AppError::DatabaseError("pool closed".into()).should_trip_circuit());
        assert!(!AppError::ValidationError("no death date".into()).should_trip_circuit());
    }

    #[test]
    fn test_failure_kind_roundtrip() {
        for kind in [
            FailureKind::NotFound,
            FailureKind::AccessBlocked,
            FailureKind::Transient,
            FailureKind::Permanent,
            FailureKind::BudgetExceeded,
            FailureKind::Parse,
        ] {
            let parsed: FailureKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }
}

//! Run-level circuit breaker.
//!
//! Counts consecutive transient subject failures. Once the count reaches
//! the threshold the breaker trips and stays tripped: a batch run halts
//! rather than burning through the remaining subjects during an outage.
//!
//! ```text
//! CLOSED --[threshold consecutive transient failures]--> TRIPPED
//!   ^                                                       |
//!   +--[success resets the count]     [manual reset]--------+
//! ```

use std::sync::{Arc, Mutex};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Tripped,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Tripped => write!(f, "tripped"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures that trip the breaker.
    pub failure_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    total_failures: u64,
    last_error_message: Option<String>,
}

/// Snapshot for logging and progress reporting.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_error: Option<String>,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(CircuitBreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                total_failures: 0,
                last_error_message: None,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold(&self) -> u32 {
        self.config.failure_threshold
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    pub fn state(&self) -> CircuitState {
        self.lock_inner().state
    }

    pub fn is_tripped(&self) -> bool {
        self.state() == CircuitState::Tripped
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.lock_inner();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_failures: inner.total_failures,
            last_error: inner.last_error_message.clone(),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    /// Count a failure. Errors that are not transient are ignored.
    /// Returns true if the breaker is tripped afterwards.
    pub fn record_failure(&self, error: &AppError) -> bool {
        if !error.should_trip_circuit() {
            return self.is_tripped();
        }

        let mut inner = self.lock_inner();
        inner.total_failures += 1;
        inner.last_error_message = Some(error.to_string());

        if inner.state == CircuitState::Tripped {
            return true;
        }

        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.config.failure_threshold {
            tracing::warn!(
                circuit = %self.name,
                failures = inner.consecutive_failures,
                error = %error,
                "Circuit breaker tripped after {} consecutive transient failures",
                inner.consecutive_failures
            );
            inner.state = CircuitState::Tripped;
        }
        inner.state == CircuitState::Tripped
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_error_message = None;
    }
}

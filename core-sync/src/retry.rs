//! # Retry Policy & Circuit Breaker
//!
//! Failure-handling primitives wrapped around every remote call.
//!
//! ## Overview
//!
//! Two layers cooperate here:
//!
//! - [`RetryPolicy`] retries an individual call with configurable backoff,
//!   giving up immediately on non-retryable errors.
//! - [`CircuitBreaker`] tracks consecutive failures per named operation and
//!   fails fast while the remote is known to be unhealthy, so a dead server
//!   does not cost a full retry ladder per change.
//!
//! [`RetryExecutor`] combines both: it consults the breaker before each
//! attempt, feeds outcomes back into it, and sleeps the backoff delay
//! between attempts. Cancellation is honored at every wait point and is
//! never counted as a failure.
//!
//! ## Breaker States
//!
//! ```text
//!         failures >= threshold
//! CLOSED ----------------------> OPEN
//!    ^                            |
//!    | trial succeeds             | cooldown elapsed
//!    |                            v
//!    +--------------------- HALF_OPEN
//!         trial fails: back to OPEN
//! ```

use bridge_traits::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

// ============================================================================
// Backoff
// ============================================================================

/// How the delay between attempts grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BackoffStrategy {
    /// Same delay before every attempt
    Fixed,
    /// Delay grows linearly with the attempt number
    Linear,
    /// Delay doubles per attempt, capped at the policy maximum
    #[default]
    Exponential,
}

/// Retry behavior for one category of remote operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts before giving up (first attempt included)
    pub max_attempts: u32,
    /// Base delay for backoff computation
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Delay growth strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given zero-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let raw_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => base_ms.saturating_mul(attempt as u64 + 1),
            BackoffStrategy::Exponential => {
                let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
                base_ms.saturating_mul(factor)
            }
        };

        Duration::from_millis(raw_ms.min(max_ms))
    }
}

// ============================================================================
// Circuit breaker
// ============================================================================

/// Breaker state for one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls fail fast until the cooldown elapses
    Open,
    /// One trial call is allowed through
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of one operation's breaker, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When an open breaker will admit a trial call
    pub next_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
}

impl BreakerEntry {
    fn closed() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            next_attempt_at: None,
        }
    }
}

/// Per-operation failure tracker that fails fast while the remote is down.
///
/// Operations are keyed by name (e.g. `"update:event"`); each key gets an
/// independent state machine, so a broken endpoint for one entity type does
/// not block syncing the others.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: chrono::Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, BreakerEntry>>,
}

impl CircuitBreaker {
    /// Create a breaker that opens after `threshold` consecutive failures
    /// and admits a trial call `cooldown` after opening.
    pub fn new(threshold: u32, cooldown: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown: chrono::Duration::milliseconds(cooldown.as_millis() as i64),
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Admission check, run before every attempt.
    ///
    /// Moves an open breaker to half-open when its cooldown has elapsed.
    /// Returns `CircuitOpen` while calls must not be made.
    pub fn check(&self, operation: &str) -> Result<()> {
        let mut entries = self.lock_entries();
        let entry = entries
            .entry(operation.to_string())
            .or_insert_with(BreakerEntry::closed);

        match entry.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let due = entry
                    .next_attempt_at
                    .map(|at| self.clock.now() >= at)
                    .unwrap_or(true);

                if due {
                    debug!(operation, "Circuit breaker half-open; admitting trial call");
                    entry.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(SyncError::CircuitOpen {
                        operation: operation.to_string(),
                    })
                }
            }
        }
    }

    /// Record a successful call, closing the breaker
    pub fn record_success(&self, operation: &str) {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.get_mut(operation) {
            if entry.state != BreakerState::Closed {
                debug!(operation, "Circuit breaker closed after successful call");
            }
            *entry = BreakerEntry::closed();
        }
    }

    /// Record a failed call.
    ///
    /// Opens the breaker when the threshold is reached, and re-opens it
    /// immediately when a half-open trial fails.
    pub fn record_failure(&self, operation: &str) {
        let now = self.clock.now();
        let mut entries = self.lock_entries();
        let entry = entries
            .entry(operation.to_string())
            .or_insert_with(BreakerEntry::closed);

        entry.consecutive_failures += 1;
        entry.last_failure_at = Some(now);

        let tripped = entry.state == BreakerState::HalfOpen
            || entry.consecutive_failures >= self.threshold;

        if tripped {
            entry.state = BreakerState::Open;
            entry.next_attempt_at = Some(now + self.cooldown);
            warn!(
                operation,
                consecutive_failures = entry.consecutive_failures,
                "Circuit breaker opened"
            );
        }
    }

    /// Current state for one operation, `None` if it has never been seen
    pub fn snapshot(&self, operation: &str) -> Option<BreakerSnapshot> {
        let entries = self.lock_entries();
        entries.get(operation).map(|entry| BreakerSnapshot {
            state: entry.state,
            consecutive_failures: entry.consecutive_failures,
            last_failure_at: entry.last_failure_at,
            next_attempt_at: entry.next_attempt_at,
        })
    }

    /// Forget all recorded failures for one operation
    pub fn reset(&self, operation: &str) {
        let mut entries = self.lock_entries();
        entries.remove(operation);
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, BreakerEntry>> {
        // The map is only touched in short critical sections with no await
        // points; a poisoned lock means a panic mid-update, and continuing
        // with the last written state is acceptable for breaker bookkeeping.
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ============================================================================
// Retry executor
// ============================================================================

/// Runs remote calls through the breaker with backoff between attempts
#[derive(Clone)]
pub struct RetryExecutor {
    breaker: Arc<CircuitBreaker>,
}

impl RetryExecutor {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }

    /// The breaker this executor reports into
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `action` until it succeeds, fails terminally, or the policy's
    /// attempt budget is spent.
    ///
    /// Every attempt is gated on the circuit breaker for `operation` and its
    /// outcome is fed back into it. Cancellation is honored between attempts
    /// and during backoff (an in-flight call completes first) and never
    /// counts as a failure.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        policy: &RetryPolicy,
        token: &CancellationToken,
        mut action: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            if token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            self.breaker.check(operation)?;

            // An attempt already in flight runs to completion; cancellation
            // is honored before the next attempt and during backoff, never
            // by tearing a remote call.
            match action().await {
                Ok(value) => {
                    self.breaker.record_success(operation);
                    return Ok(value);
                }
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(err) => {
                    self.breaker.record_failure(operation);

                    let failed_attempt = attempt;
                    attempt += 1;

                    if !err.is_retryable() || attempt >= policy.max_attempts {
                        return Err(err);
                    }

                    let delay = policy.delay_for(failed_attempt);
                    debug!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed; backing off before retry"
                    );

                    tokio::select! {
                        _ = token.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

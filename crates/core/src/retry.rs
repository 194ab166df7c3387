//! Fixed-schedule retry combinator.
//!
//! [`retry`] runs a fallible async operation up to
//! [`RetryPolicy::max_attempts`] times, sleeping the scheduled delay before
//! each attempt. Sleeping goes through the [`Sleeper`] trait so tests can
//! record the schedule instead of waiting it out.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Default delay schedule in seconds: first attempt immediately, then 1s,
/// 2s and 4s before the three retries.
pub const DEFAULT_RETRY_DELAYS_SECS: [u64; 4] = [0, 1, 2, 4];

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Explicit delay sequence. Entry `i` is slept before attempt `i + 1`, so
/// the number of entries is the attempt budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl RetryPolicy {
    /// Build a policy from an explicit schedule. An empty schedule still
    /// allows a single, immediate attempt.
    pub fn new(delays: Vec<Duration>) -> Self {
        if delays.is_empty() {
            return Self {
                delays: vec![Duration::ZERO],
            };
        }
        Self { delays }
    }

    pub fn from_secs(delays: &[u64]) -> Self {
        Self::new(delays.iter().copied().map(Duration::from_secs).collect())
    }

    /// Total number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.delays.len() as u32
    }

    /// Delay slept before the given 1-based attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        attempt
            .checked_sub(1)
            .and_then(|i| self.delays.get(i as usize))
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    /// Sum of every scheduled delay.
    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_secs(&DEFAULT_RETRY_DELAYS_SECS)
    }
}

// ---------------------------------------------------------------------------
// Sleeper
// ---------------------------------------------------------------------------

/// Source of timed delays.
#[async_trait::async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait::async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

// ---------------------------------------------------------------------------
// Attempt bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
}

/// Record of one attempt, kept for logging and inspection only.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionAttempt {
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error_detail: Option<String>,
}

/// Final result of [`retry`] plus the per-attempt history.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// The successful value, or the error of the last attempt.
    pub result: Result<T, E>,
    pub attempts: Vec<ExecutionAttempt>,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn failed_attempts(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.outcome == AttemptOutcome::Failed)
            .count()
    }
}

// ---------------------------------------------------------------------------
// retry
// ---------------------------------------------------------------------------

/// Run `op` until it succeeds or the policy's attempt budget is spent.
///
/// `op` receives the 1-based attempt number and must be safe to repeat
/// from scratch. Zero delays are not slept. Every failure that is followed
/// by another attempt is logged at `warn`; the last error is returned
/// unchanged in [`RetryOutcome::result`].
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    mut op: F,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = policy.max_attempts();
    let mut attempts = Vec::with_capacity(max_attempts as usize);
    let mut attempt = 1;

    loop {
        let delay = policy.delay_before(attempt);
        if !delay.is_zero() {
            sleeper.sleep(delay).await;
        }

        let started_at = Utc::now();
        match op(attempt).await {
            Ok(value) => {
                attempts.push(ExecutionAttempt {
                    attempt_number: attempt,
                    started_at,
                    outcome: AttemptOutcome::Succeeded,
                    error_detail: None,
                });
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                };
            }
            Err(e) => {
                attempts.push(ExecutionAttempt {
                    attempt_number: attempt,
                    started_at,
                    outcome: AttemptOutcome::Failed,
                    error_detail: Some(e.to_string()),
                });

                if attempt >= max_attempts {
                    return RetryOutcome {
                        result: Err(e),
                        attempts,
                    };
                }

                tracing::warn!(
                    attempt,
                    max_attempts,
                    next_delay_ms = policy.delay_before(attempt + 1).as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying",
                );
                attempt += 1;
            }
        }
    }
}

//! Retry utilities with backoff and jitter.
//!
//! Used for the optimistic-concurrency loop of the spec mutator (retry only
//! on conflict), for the bulk apply retry of the CLI (retry transient
//! failures, keep every attempt's error) and for pacing watch reopens.
//!
//! # Example
//!
//! ```ignore
//! use converge_common::retry::{retry_if, RetryPolicy};
//!
//! let kyma = retry_if(
//!     &RetryPolicy::default(),
//!     "mutate_spec",
//!     |e: &Error| e.is_conflict(),
//!     || async { mutate_once().await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::Error;

/// How the delay grows between attempts
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Backoff {
    /// Same delay before every retry
    Fixed,
    /// Delay multiplied after every retry, capped at `max_backoff`
    Exponential {
        /// Growth factor per attempt
        multiplier: f64,
    },
}

/// Retry configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound for a single delay
    pub max_backoff: Duration,
    /// Delay growth strategy
    pub backoff: Backoff,
    /// Randomize each delay between 0.5x and 1.5x
    pub jitter: bool,
    /// Stop retrying once this much time has passed since the first attempt
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    /// Three attempts, 3s initial backoff, doubling.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(3),
            max_backoff: Duration::from_secs(30),
            backoff: Backoff::Exponential { multiplier: 2.0 },
            jitter: true,
            deadline: None,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Set the initial backoff
    pub fn initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    /// Set the backoff strategy
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Disable jitter (deterministic delays)
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Bound the total time spent retrying
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }

    /// The delay that follows `delay` under this policy's backoff
    pub fn next_delay(&self, delay: Duration) -> Duration {
        match self.backoff {
            Backoff::Fixed => delay,
            Backoff::Exponential { multiplier } => Duration::from_secs_f64(
                (delay.as_secs_f64() * multiplier).min(self.max_backoff.as_secs_f64()),
            ),
        }
    }

    /// `delay` randomized between 0.5x and 1.5x when jitter is on
    pub fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }

    /// Whether sleeping `delay` now would overrun the deadline
    fn past_deadline(&self, started: Instant, delay: Duration) -> bool {
        self.deadline
            .is_some_and(|deadline| started.elapsed() + delay > deadline)
    }
}

/// Execute an async operation, retrying only errors accepted by `should_retry`.
///
/// A rejected error is returned immediately without sleeping.
pub async fn retry_if<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    let mut delay = policy.initial_backoff;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&e) {
            return Err(e);
        }

        let wait = policy.jittered(delay);
        if policy.exhausted(attempt) || policy.past_deadline(started, wait) {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "Operation failed after max retries"
            );
            return Err(e);
        }

        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = wait.as_millis(),
            "Operation failed, retrying"
        );

        tokio::time::sleep(wait).await;
        delay = policy.next_delay(delay);
    }
}

/// Execute an async operation, retrying errors accepted by `should_retry`
/// and keeping them all.
///
/// On exhaustion returns `Error::RetriesExhausted` carrying the error of
/// every attempt in order. A rejected error on the first attempt is
/// returned as is; after earlier attempts it ends the retry the same way
/// exhaustion does, so no attempt's cause is lost.
pub async fn retry_collecting<F, Fut, T, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
    P: Fn(&Error) -> bool,
{
    let started = Instant::now();
    let mut errors = Vec::new();
    let mut delay = policy.initial_backoff;

    loop {
        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        let attempt = errors.len() as u32 + 1;
        if !should_retry(&e) {
            if errors.is_empty() {
                return Err(e);
            }
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "Operation failed with a permanent error"
            );
            errors.push(e);
            return Err(Error::RetriesExhausted {
                operation: operation_name.to_string(),
                attempts: attempt,
                errors,
            });
        }

        let wait = policy.jittered(delay);
        if policy.exhausted(attempt) || policy.past_deadline(started, wait) {
            error!(
                operation = %operation_name,
                attempt,
                error = %e,
                "Operation failed after max retries"
            );
            errors.push(e);
            return Err(Error::RetriesExhausted {
                operation: operation_name.to_string(),
                attempts: attempt,
                errors,
            });
        }

        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = wait.as_millis(),
            "Operation failed, retrying"
        );
        errors.push(e);

        tokio::time::sleep(wait).await;
        delay = policy.next_delay(delay);
    }
}

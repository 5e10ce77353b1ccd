//! Bounded retry with backoff
//!
//! A single [`RetryRunner`] drives both store and fetch so the attempt and
//! delay policy lives in one place.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn, Instrument, Span};

/// Errors that know whether another attempt could succeed
pub trait Retriable {
    /// `true` for transient failures local to one attempt
    fn is_retriable(&self) -> bool;
}

/// Retry policy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Delay before the second attempt (milliseconds)
    pub initial_delay_ms: u64,
    /// Maximum delay between attempts (milliseconds)
    pub max_delay_ms: u64,
    /// Backoff multiplier, 1.0 for a fixed delay
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: 500,
            max_delay_ms: 500,
            backoff_multiplier: 1.0,
        }
    }
}

impl RetryPolicy {
    /// Fixed delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let delay_ms = delay.as_millis() as u64;
        Self {
            max_attempts,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            backoff_multiplier: 1.0,
        }
    }

    /// Exponential backoff capped at `max_delay`
    pub fn exponential(max_attempts: u32, initial: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: initial.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            backoff_multiplier: 2.0,
        }
    }

    /// Delay after the failed attempt with zero-based index `attempt`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let delay = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }

    /// Validate policy
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be >= 1.0".to_string());
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err("max_delay_ms must be >= initial_delay_ms".to_string());
        }
        Ok(())
    }
}

/// Terminal outcome of a retried operation
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retriable error
    #[error("gave up after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: E,
    },
    /// An attempt failed with an error that must not be retried
    #[error("aborted on attempt {attempts}: {error}")]
    Aborted {
        /// Attempts made, including the aborting one
        attempts: u32,
        /// The non-retriable error
        error: E,
    },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Aborted { attempts, .. } => *attempts,
        }
    }

    /// Underlying error of the last attempt
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last_error, .. } => last_error,
            RetryError::Aborted { error, .. } => error,
        }
    }
}

/// Applies a [`RetryPolicy`] to fallible async operations
#[derive(Clone, Debug)]
pub struct RetryRunner {
    policy: RetryPolicy,
    span: Span,
}

impl RetryRunner {
    /// Create a runner logging into `parent`
    pub fn new(policy: RetryPolicy, operation: &'static str, parent: &Span) -> Self {
        let span = tracing::debug_span!(parent: parent, "retry", op = operation);
        Self { policy, span }
    }

    /// Policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation`, retrying errors for which [`Retriable::is_retriable`] holds
    pub async fn run<T, E, F, Fut>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        E: Retriable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with(operation, |e: &E| e.is_retriable()).await
    }

    /// Run `operation`, retrying errors accepted by `is_retriable`
    ///
    /// The operation receives the one-based attempt number. Delays happen
    /// only between attempts.
    pub async fn run_with<T, E, F, Fut, P>(
        &self,
        mut operation: F,
        is_retriable: P,
    ) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(parent: &self.span, attempt, max_attempts, "Starting attempt");

            let error = match operation(attempt).instrument(self.span.clone()).await {
                Ok(value) => {
                    debug!(parent: &self.span, attempt, "Attempt succeeded");
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !is_retriable(&error) {
                debug!(parent: &self.span, attempt, %error, "Attempt failed, not retriable");
                return Err(RetryError::Aborted { attempts: attempt, error });
            }

            warn!(parent: &self.span, attempt, max_attempts, %error, "Attempt failed");
            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }

            tokio::time::sleep(self.policy.delay_for_attempt(attempt - 1)).await;
        }
    }
}

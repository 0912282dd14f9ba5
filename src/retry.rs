//! # Retry policy
//!
//! A single retry abstraction shared by every external call (vector store, embedding
//! provider, language model): a bounded number of attempts, a delay between them
//! (fixed or exponential), and a predicate deciding which errors deserve another try.
//!
//! ```rust
//! use sigma_rag::retry::{Backoff, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(3, Duration::from_secs(1)).with_backoff(Backoff::Exponential);
//! assert_eq!(policy.delay_for(1), Duration::from_secs(1));
//! assert_eq!(policy.delay_for(2), Duration::from_secs(2));
//! ```

use serde::{Deserialize, Serialize};
use std::{fmt::Display, future::Future, time::Duration};
use tracing::{error, warn};

/// Errors that know whether they are worth retrying.
pub trait Retryable {
    /// `true` for network, timeout and 5xx-shaped failures.
    fn is_transient(&self) -> bool;
}

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// Bounded retry with a delay between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first try; zero is treated as one.
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff: Backoff::Fixed,
        }
    }

    /// Exactly one attempt, no waiting.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let exponent = attempt.saturating_sub(1).min(5);
                self.delay.saturating_mul(1 << exponent)
            }
        }
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the attempt
    /// budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, op: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with(operation, |e: &E| e.is_transient(), op).await
    }

    /// Like [`run`](Self::run) with an explicit retryable-error predicate.
    pub async fn run_with<T, E, P, F, Fut>(
        &self,
        operation: &str,
        is_retryable: P,
        mut op: F,
    ) -> Result<T, E>
    where
        E: Display,
        P: Fn(&E) -> bool,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !is_retryable(&e) => {
                    error!("{} failed with a non-retryable error: {}", operation, e);
                    return Err(e);
                }
                Err(e) if attempt >= self.max_attempts => {
                    error!(
                        "{} failed (attempt {}/{}): {}; giving up",
                        operation, attempt, self.max_attempts, e
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "{} failed (attempt {}/{}): {}",
                        operation, attempt, self.max_attempts, e
                    );
                    let delay = self.delay_for(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

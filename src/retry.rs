//! Bounded retry with exponential backoff and cooperative cancellation.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first one
    pub max_tries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_tries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn new(max_tries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_tries,
            initial_delay,
            max_delay,
        }
    }
}

/// Exponential delay sequence capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            initial: config.initial_delay,
            max: config.max_delay,
            current: config.initial_delay,
        }
    }

    /// The delay to wait now; doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// How one attempt failed.
#[derive(Debug)]
pub enum AttemptError<E> {
    /// Worth another try, optionally not before `after`.
    Retry { error: E, after: Option<Duration> },
    /// Stop retrying immediately.
    Abort(E),
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    Cancelled,
    Exhausted { attempts: u32, last: E },
    Aborted(E),
}

/// Execute an async operation with exponential backoff retry.
///
/// The operation receives the 1-based attempt number and runs at most
/// `config.max_tries` times. Cancellation is observed before each attempt and
/// while waiting between attempts.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptError<E>>>,
    E: Display,
{
    let mut backoff = Backoff::new(config);
    let max_tries = config.max_tries.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;

        let (error, after) = match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(AttemptError::Abort(e)) => return Err(RetryError::Aborted(e)),
            Err(AttemptError::Retry { error, after }) => (error, after),
        };

        if attempt >= max_tries {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        let delay = after.unwrap_or_else(|| backoff.next_delay());
        tracing::warn!(
            "Attempt {}/{} failed: {}. Retrying in {:?}...",
            attempt,
            max_tries,
            error,
            delay
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

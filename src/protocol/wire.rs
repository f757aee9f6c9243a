//! One request/response exchange with bounded transport retries.
//!
//! These retries cover transport flakiness only (dropped connections, 502/503
//! from a front end). Protocol-level retry is the pending queue's defer
//! mechanism.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::transport::{Transport, TransportError, WireRequest, WireResponse};
use crate::constants::DEFAULT_THROTTLE_DELAY_SECS;
use crate::retry::{AttemptError, RetryConfig, RetryError, with_retry};

#[derive(Debug, Clone, PartialEq)]
pub struct WirePolicy {
    pub retry: RetryConfig,
    /// Timeout of the first attempt for commands without their own.
    pub timeout: Duration,
    /// Each retry's timeout is the previous one times this factor.
    pub timeout_expander: f64,
    /// A server asking to wait longer than this is treated as throttling us.
    pub max_retry_after: Duration,
}

impl Default for WirePolicy {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            timeout: Duration::from_secs(30),
            timeout_expander: 1.2,
            max_retry_after: Duration::from_secs(120),
        }
    }
}

impl WirePolicy {
    pub fn timeout_for_attempt(&self, base: Duration, attempt: u32) -> Duration {
        let factor = self.timeout_expander.max(1.0).powi(attempt.saturating_sub(1) as i32);
        base.mul_f64(factor)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("exchange cancelled")]
    Cancelled,
    #[error("gave up after {tries} tries: {last}")]
    Exhausted { tries: u32, last: TransportError },
    #[error("server asked us to back off for {0:?}")]
    Throttled(Duration),
}

#[derive(Debug)]
enum Failure {
    Transport(TransportError),
    Throttled(Duration),
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Transport(e) => write!(f, "{}", e),
            Failure::Throttled(after) => write!(f, "throttled for {:?}", after),
        }
    }
}

pub struct WireOperation<'a> {
    transport: &'a dyn Transport,
    policy: &'a WirePolicy,
}

impl<'a> WireOperation<'a> {
    pub fn new(transport: &'a dyn Transport, policy: &'a WirePolicy) -> Self {
        Self { transport, policy }
    }

    /// Run the exchange, retrying transport failures up to the policy's limit.
    /// Cancellation is observed inside every wait, including the transport call.
    pub async fn execute(
        &self,
        request: &WireRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WireResponse, WireError> {
        let result = with_retry(&self.policy.retry, cancel, |attempt| {
            let attempt_timeout = self.policy.timeout_for_attempt(timeout, attempt);
            async move {
                tracing::debug!(
                    "{} attempt {} (timeout {:?})",
                    request.command,
                    attempt,
                    attempt_timeout
                );
                let outcome = tokio::time::timeout(
                    attempt_timeout,
                    self.transport.execute(request, attempt_timeout, cancel),
                )
                .await
                .unwrap_or(Err(TransportError::Timeout));

                match outcome {
                    Ok(response) => self.check_availability(response),
                    Err(TransportError::Cancelled) => {
                        Err(AttemptError::Abort(Failure::Transport(TransportError::Cancelled)))
                    }
                    Err(error) => Err(AttemptError::Retry {
                        error: Failure::Transport(error),
                        after: None,
                    }),
                }
            }
        })
        .await;

        match result {
            Ok(response) => Ok(response),
            Err(RetryError::Cancelled)
            | Err(RetryError::Aborted(Failure::Transport(TransportError::Cancelled))) => {
                Err(WireError::Cancelled)
            }
            Err(RetryError::Aborted(Failure::Throttled(after))) => Err(WireError::Throttled(after)),
            Err(RetryError::Aborted(Failure::Transport(last))) => Err(WireError::Exhausted {
                tries: 1,
                last,
            }),
            Err(RetryError::Exhausted { attempts, last }) => {
                let last = match last {
                    Failure::Transport(e) => e,
                    Failure::Throttled(_) => TransportError::Unavailable(503),
                };
                tracing::warn!("{} failed after {} tries: {}", request.command, attempts, last);
                Err(WireError::Exhausted {
                    tries: attempts,
                    last,
                })
            }
        }
    }

    /// 502 and 503 are the front end's, not the protocol's; retry them,
    /// honoring Retry-After and the throttling header.
    fn check_availability(
        &self,
        response: WireResponse,
    ) -> Result<WireResponse, AttemptError<Failure>> {
        if response.status != 502 && response.status != 503 {
            return Ok(response);
        }

        let retry_after = response
            .header("Retry-After")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .or_else(|| {
                response
                    .header("X-MS-ASThrottle")
                    .map(|_| Duration::from_secs(DEFAULT_THROTTLE_DELAY_SECS))
            });

        match retry_after {
            Some(after) if after > self.policy.max_retry_after => {
                Err(AttemptError::Abort(Failure::Throttled(after)))
            }
            after => Err(AttemptError::Retry {
                error: Failure::Transport(TransportError::Unavailable(response.status)),
                after,
            }),
        }
    }
}

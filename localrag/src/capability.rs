//! Uniform call contract for external capabilities.
//!
//! Embedding, generation and model-based query expansion are black-box
//! calls with external latency. Every such call goes through
//! [`CapabilityInvoker::call`], which applies:
//!
//! - an explicit per-attempt timeout (a timeout is a transient failure),
//! - bounded exponential backoff for transient failures
//!   ([`CapabilityErrorKind::ModelUnavailable`], [`CapabilityErrorKind::Timeout`]),
//! - cancellation through a [`CancellationToken`], checked while waiting on
//!   the call and between attempts.
//!
//! Index and store locks are never held while awaiting an invoker. Ingest,
//! update and retry hold the document's own lock across embedding, which
//! only serializes work on that one document.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CapabilityErrorKind, RagError, Result};

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay.
    pub max_backoff_ms: u64,
    /// Multiplier applied to the delay after each retry.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, initial_backoff_ms: 200, max_backoff_ms: 5_000, backoff_factor: 2.0 }
    }
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(RagError::ConfigError("retry.max_attempts must be at least 1".into()));
        }
        if self.backoff_factor.is_nan() || self.backoff_factor < 1.0 {
            return Err(RagError::ConfigError(format!(
                "retry.backoff_factor ({}) must be >= 1.0",
                self.backoff_factor
            )));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(RagError::ConfigError(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (0-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        // Cap the exponent; the delay saturates at max_backoff_ms long before.
        let exp = retry.min(31) as i32;
        let ms = (self.initial_backoff_ms as f64) * self.backoff_factor.powi(exp);
        Duration::from_millis(ms.min(self.max_backoff_ms as f64) as u64)
    }
}

/// Applies the timeout, retry and cancellation contract to capability calls.
#[derive(Debug, Clone)]
pub struct CapabilityInvoker {
    retry: RetryPolicy,
    timeout: Duration,
}

impl CapabilityInvoker {
    pub fn new(retry: RetryPolicy, timeout: Duration) -> Self {
        Self { retry, timeout }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `op` until it succeeds, fails permanently, exhausts the retry
    /// budget, or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns the last error from `op`, a [`CapabilityErrorKind::Timeout`]
    /// capability error if the final attempt timed out, or
    /// [`RagError::Cancelled`].
    pub async fn call<T, F, Fut>(
        &self,
        capability: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RagError::Cancelled),
                res = tokio::time::timeout(self.timeout, op()) => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(RagError::capability(
                        capability,
                        CapabilityErrorKind::Timeout,
                        format!("no response within {:?}", self.timeout),
                    )),
                },
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(capability, attempt, "capability call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for_retry(attempt - 1);
                    warn!(capability, attempt, ?delay, error = %e, "transient capability failure, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RagError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

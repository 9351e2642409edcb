//! Deadline-bounded, cancellable polling.
//!
//! A [`Poller`] repeatedly invokes a read operation until a predicate over the
//! observed value holds. It never mutates anything itself: the read closure is
//! the only remote call it makes.
//!
//! Retry policy:
//! - a successful read that does not satisfy the predicate sleeps for the
//!   poll interval and reads again
//! - a [`Retryable`] failure sleeps for an exponential backoff delay
//! - any other failure is returned unmodified
//!
//! Every sleep is capped by the remaining budget; retries never move the
//! deadline.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backoff::BackoffPolicy;
use crate::cancel::CancelSignal;
use crate::DEFAULT_POLL_INTERVAL;

/// Stand-in deadline for timeouts too large to add to an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Classifies read failures as worth retrying within a wait.
pub trait Retryable {
    /// Returns true for throttling and other transient failures.
    fn is_retryable(&self) -> bool;
}

/// Successful result of a wait.
#[derive(Debug, Clone)]
pub struct WaitOutcome<T> {
    /// The first observed value satisfying the predicate.
    pub value: T,

    /// Number of read calls issued, including failed ones.
    pub reads: u32,

    /// Time spent waiting.
    pub elapsed: Duration,
}

/// Why a wait ended without the predicate being satisfied.
#[derive(Debug, Error)]
pub enum WaitError<T, E> {
    /// The deadline passed.
    #[error("timed out after {elapsed:?} ({reads} reads)")]
    Timeout {
        elapsed: Duration,
        reads: u32,
        last: Option<T>,
    },

    /// The caller cancelled the wait.
    #[error("wait cancelled")]
    Cancelled { last: Option<T> },

    /// A read failed with a non-retryable error.
    #[error("read failed: {error}")]
    Failed { error: E, last: Option<T> },
}

impl<T, E> WaitError<T, E> {
    /// The last value observed before the wait ended, if any.
    pub fn last(&self) -> Option<&T> {
        match self {
            Self::Timeout { last, .. } | Self::Cancelled { last } | Self::Failed { last, .. } => {
                last.as_ref()
            }
        }
    }

    /// Consume the error, returning the last observed value.
    pub fn into_last(self) -> Option<T> {
        match self {
            Self::Timeout { last, .. } | Self::Cancelled { last } | Self::Failed { last, .. } => {
                last
            }
        }
    }
}

/// Polls a read operation until a predicate holds.
#[derive(Debug, Clone)]
pub struct Poller {
    /// Total budget for the wait.
    pub timeout: Duration,

    /// Delay between reads that succeed without satisfying the predicate.
    pub poll_interval: Duration,

    /// Delay schedule for retryable read failures.
    pub backoff: BackoffPolicy,
}

impl Poller {
    /// Create a poller with the default backoff policy.
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Replace the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Wait until `predicate` holds for a value returned by `read`.
    pub async fn wait_for<T, E, R, Fut, P>(
        &self,
        resource: &str,
        mut read: R,
        predicate: P,
        cancel: &mut CancelSignal,
    ) -> Result<WaitOutcome<T>, WaitError<T, E>>
    where
        R: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&T) -> bool,
        E: Retryable + Display,
    {
        let started = Instant::now();
        let deadline = started
            .checked_add(self.timeout)
            .unwrap_or(started + FAR_FUTURE);
        let mut reads = 0u32;
        let mut retry_attempt = 0u32;
        let mut last: Option<T> = None;

        loop {
            if cancel.is_cancelled() {
                debug!(resource, reads, "Wait cancelled before read");
                return Err(WaitError::Cancelled { last });
            }

            reads += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(resource, reads, "Wait cancelled during read");
                    return Err(WaitError::Cancelled { last });
                }
                result = read() => result,
            };

            let delay = match result {
                Ok(value) => {
                    retry_attempt = 0;
                    if predicate(&value) {
                        let elapsed = started.elapsed();
                        debug!(
                            resource,
                            reads,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Wait condition satisfied"
                        );
                        return Ok(WaitOutcome {
                            value,
                            reads,
                            elapsed,
                        });
                    }
                    last = Some(value);
                    self.poll_interval
                }
                Err(error) if error.is_retryable() => {
                    let delay = self.backoff.delay(retry_attempt);
                    retry_attempt += 1;
                    warn!(
                        resource,
                        reads,
                        attempt = retry_attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient read failure, backing off"
                    );
                    delay
                }
                Err(error) => {
                    debug!(resource, reads, error = %error, "Read failed, aborting wait");
                    return Err(WaitError::Failed { error, last });
                }
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout {
                    elapsed: now - started,
                    reads,
                    last,
                });
            }

            let sleep = delay.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(resource, reads, "Wait cancelled while sleeping");
                    return Err(WaitError::Cancelled { last });
                }
                _ = tokio::time::sleep(sleep) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout {
                    elapsed: now - started,
                    reads,
                    last,
                });
            }
        }
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new(Duration::from_secs(30 * 60), DEFAULT_POLL_INTERVAL)
    }
}

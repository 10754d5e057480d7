use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Bounded retry schedule with exponentially increasing delays.
///
/// After failed attempt `n` (counting from 1) the calling task sleeps for
/// `base_delay * 2^n`, optionally capped and jittered by up to 10%.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Option<Duration>,
    attempt_timeout: Option<Duration>,
    jitter: bool,
}

/// Errors returned by [`RetryPolicy::run`].
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Every attempt failed with a retriable error.
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// The last error.
        #[source]
        source: E,
    },

    /// An attempt failed with an error that is not worth retrying.
    #[error(transparent)]
    Rejected(E),

    /// The final attempt exceeded the per-attempt timeout.
    #[error("timed out after {attempts} attempts of {timeout:?}")]
    TimedOut {
        /// Attempts made.
        attempts: u32,
        /// The per-attempt timeout.
        timeout: Duration,
    },

    /// The cancellation token fired.
    #[error("cancelled")]
    Cancelled,
}

impl<E> RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The last operation error, if one was observed.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Exhausted { source, .. } | Self::Rejected(source) => Some(source),
            Self::TimedOut { .. } | Self::Cancelled => None,
        }
    }
}

impl RetryPolicy {
    /// At most `max_attempts` attempts (clamped to one) with delays derived
    /// from `base_delay`. Jitter is on.
    #[must_use]
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
            attempt_timeout: None,
            jitter: true,
        }
    }

    /// Caps a single delay.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Option<Duration>) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Bounds each attempt.
    #[must_use]
    pub const fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Maximum number of attempts.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The wait after failed attempt `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let mut delay = self.base_delay.saturating_mul(factor);

        if let Some(max_delay) = self.max_delay {
            delay = delay.min(max_delay);
        }

        if self.jitter {
            delay = delay.mul_f64(fastrand::f64().mul_add(0.1, 1.0));
        }

        delay
    }

    /// Runs `op` until it succeeds, fails with an error `is_retriable`
    /// rejects, runs out of attempts, or `cancel` fires.
    ///
    /// `op` receives the 1-based attempt number.
    ///
    /// # Errors
    ///
    /// See [`RetryError`].
    pub async fn run<T, E, F, Fut, P>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        is_retriable: P,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = tokio::select! {
                () = cancel.cancelled() => return Err(RetryError::Cancelled),
                outcome = self.attempt(op(attempt)) => outcome,
            };

            match outcome {
                Some(Ok(value)) => {
                    if attempt > 1 {
                        debug!(operation, attempts = attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Some(Err(e)) if !is_retriable(&e) => {
                    debug!(operation, error = %e, "Operation failed with non-retriable error");
                    return Err(RetryError::Rejected(e));
                }
                Some(Err(e)) if attempt >= self.max_attempts => {
                    error!(operation, attempts = attempt, error = %e, "Operation failed after maximum retries");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        source: e,
                    });
                }
                Some(Err(e)) => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Operation failed, retrying"
                    );
                }
                None if attempt >= self.max_attempts => {
                    let timeout = self.attempt_timeout.unwrap_or_default();
                    error!(operation, attempts = attempt, ?timeout, "Operation timed out after maximum retries");
                    return Err(RetryError::TimedOut {
                        attempts: attempt,
                        timeout,
                    });
                }
                None => {
                    warn!(
                        operation,
                        attempt,
                        timeout = ?self.attempt_timeout,
                        "Operation timed out, retrying"
                    );
                }
            }

            let delay = self.delay_for(attempt);

            tokio::select! {
                () = cancel.cancelled() => return Err(RetryError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// `None` when the attempt timed out.
    async fn attempt<T, E, Fut>(&self, fut: Fut) -> Option<Result<T, E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        match self.attempt_timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut).await.ok(),
            None => Some(fut.await),
        }
    }
}

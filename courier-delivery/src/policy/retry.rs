//! Retry policy for dispatch operations.
//!
//! The policy knows nothing about mail: it runs an async operation, waits
//! `base_delay * 2^attempt` after each failed attempt, and hands back the
//! last error unchanged once the attempt budget is spent.

use std::{fmt::Display, future::Future, time::Duration};

use courier_common::{Cancelled, tracing};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Bounded exponential-backoff retry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    ///
    /// Default: 3 attempts
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff (in milliseconds).
    ///
    /// The wait after failed attempt `n` (1-indexed) is `base * 2^n`.
    ///
    /// Default: 1000 ms, giving waits of 2 s and 4 s
    #[serde(default = "defaults::base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
            base_delay_ms: defaults::base_delay_ms(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Wait that follows failed attempt `attempt` (1-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay().saturating_mul(factor)
    }

    /// Check if another attempt may follow attempt `attempt` (1-indexed).
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `operation` until it succeeds or the attempt budget is spent.
    ///
    /// Each failed attempt that will be retried is logged with its attempt
    /// number and the delay before the next one.
    ///
    /// # Errors
    /// The error of the final attempt, unmodified, or `E::from(Cancelled)`
    /// if `cancel` fires before an attempt or during a wait.
    pub async fn execute<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, E>
    where
        E: From<Cancelled> + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts;
        self.execute_observed(cancel, operation, |attempt, delay, error| {
            tracing::warn!(
                attempt,
                max_attempts,
                ?delay,
                %error,
                "Attempt {attempt} failed, retrying after {delay:?}"
            );
        })
        .await
    }

    /// As [`Self::execute`], but reports each retry to `observer` instead of
    /// logging it.
    ///
    /// `observer` receives the failed attempt number, the delay about to be
    /// waited and the error, before the wait starts.
    ///
    /// # Errors
    /// See [`Self::execute`].
    pub async fn execute_observed<T, E, F, Fut, O>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
        mut observer: O,
    ) -> Result<T, E>
    where
        E: From<Cancelled>,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        O: FnMut(u32, Duration, &E),
    {
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled.into());
            }

            let error = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !self.should_retry(attempt) {
                return Err(error);
            }

            let delay = self.delay_for(attempt);
            observer(attempt, delay, &error);

            tokio::select! {
                () = cancel.cancelled() => return Err(Cancelled.into()),
                () = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}

mod defaults {
    pub const fn max_attempts() -> u32 {
        3
    }

    pub const fn base_delay_ms() -> u64 {
        1000
    }
}

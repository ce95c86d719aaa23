//! Bounded retry with a fixed delay between attempts.

use crate::config::RetrySettings;
use crate::server::metrics;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Retries a whole operation up to `max_attempts` times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Time waited after a failed attempt before the next one.
    pub delay: Duration,
}

/// Result of [`RetryPolicy::run_with_retry`].
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Succeeded { value: T, attempts: u32 },
    /// Every attempt failed.
    Exhausted { last_error: E, attempts: u32 },
    /// Shutdown was requested while waiting for the next attempt.
    Cancelled { last_error: E, attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            delay: Duration::from_millis(settings.delay_ms),
        }
    }

    /// Runs `operation` until it succeeds or attempts run out.
    ///
    /// `operation` receives the 1-based attempt number. After a failure the
    /// loop sleeps for `delay` before trying again; the sleep is cut short
    /// only if `cancel` fires, in which case no further attempt is made.
    /// Failures are logged and returned, never propagated as panics.
    pub async fn run_with_retry<T, E, F, Fut>(
        &self,
        mut operation: F,
        cancel: &CancellationToken,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => {
                    metrics::record_cycle_attempt("success");
                    if attempt > 1 {
                        info!("Succeeded on attempt {}/{}", attempt, max_attempts);
                    }
                    return RetryOutcome::Succeeded {
                        value,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    metrics::record_cycle_attempt("failure");
                    error!("Error: {} (attempt {}/{})", e, attempt, max_attempts);

                    if attempt >= max_attempts {
                        error!("Retries exhausted after {} attempt(s), giving up: {}", attempt, e);
                        return RetryOutcome::Exhausted {
                            last_error: e,
                            attempts: attempt,
                        };
                    }

                    warn!("Retrying in {}ms: {}", self.delay.as_millis(), e);
                    tokio::select! {
                        _ = tokio::time::sleep(self.delay) => {}
                        _ = cancel.cancelled() => {
                            warn!("Shutdown requested, abandoning remaining retries");
                            return RetryOutcome::Cancelled {
                                last_error: e,
                                attempts: attempt,
                            };
                        }
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetrySettings::default())
    }
}

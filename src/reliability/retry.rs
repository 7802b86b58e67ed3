//! Retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetrySettings;
use crate::error::{Error, Result};
use crate::task::CancellationToken;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay applied as +/- jitter.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            jitter_ratio: settings.jitter_ratio.clamp(0.0, 1.0),
        }
    }
}

/// Final outcome of a retried operation.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_ratio: 0.0,
        }
    }

    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`,
    /// jittered, never above `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let capped = self.base_delay.saturating_mul(factor).min(self.max_delay);

        if self.jitter_ratio <= 0.0 || capped.is_zero() {
            return capped;
        }

        let secs = capped.as_secs_f64();
        let spread = secs * self.jitter_ratio;
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((secs + offset).clamp(0.0, self.max_delay.as_secs_f64()))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out
    /// of attempts, or `cancel` fires. `on_failure` sees every failed attempt
    /// together with the delay before the next one (`None` when giving up).
    pub async fn run<T, F, Fut, O>(
        &self,
        cancel: Option<&CancellationToken>,
        mut op: F,
        mut on_failure: O,
    ) -> Attempted<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        O: FnMut(u32, &Error, Option<Duration>),
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op(attempt).await {
                Ok(value) => {
                    return Attempted {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) => e,
            };

            let cancelled = cancel.map_or(false, |c| c.is_cancelled());
            let delay = (err.is_retryable() && attempt < self.max_attempts && !cancelled)
                .then(|| self.backoff(attempt));
            on_failure(attempt, &err, delay);

            let Some(delay) = delay else {
                return Attempted {
                    result: Err(err),
                    attempts: attempt,
                };
            };

            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {
                            return Attempted {
                                result: Err(err),
                                attempts: attempt,
                            };
                        }
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

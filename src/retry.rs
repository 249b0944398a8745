//! Retry policy with exponential backoff and jitter for provider calls.

use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::traits::ProviderError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Growth factor applied to the delay after every failed attempt.
    pub multiplier: f64,
    /// Fraction of each delay that is randomized away, in `[0, 1]`.
    pub jitter: f64,
    /// Stop retrying once the next wait would cross this bound.
    pub max_elapsed_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.5,
            max_elapsed_ms: Some(180_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryError {
    /// Non-transient failure; no retry was attempted after it.
    Permanent(ProviderError),
    /// Transient failures used up the attempt or time budget.
    Exhausted { attempts: u32, last_error: ProviderError },
}

impl RetryPolicy {
    /// A policy that retries without waiting; handy for tests and offline runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: 0.0,
            max_elapsed_ms: None,
        }
    }

    /// Backoff before the retry following failed attempt number `attempt`
    /// (1-based).
    pub fn delay_for<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 - jitter * rng.gen_range(0.0..1.0)
        } else {
            1.0
        };

        Duration::from_millis((capped * factor).round() as u64)
    }

    /// Runs `call` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// `call` receives the 1-based attempt number.
    pub fn run<T, F>(&self, operation: &str, mut call: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Result<T, ProviderError>,
    {
        let started = Instant::now();
        let max_attempts = self.max_attempts.max(1);
        let mut rng = SmallRng::from_entropy();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match call(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_transient() {
                debug!(operation, attempt, error = %err, "permanent provider failure");
                return Err(RetryError::Permanent(err));
            }

            if attempt >= max_attempts {
                warn!(operation, attempts = attempt, error = %err, "retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: err,
                });
            }

            let delay = self.delay_for(attempt, &mut rng);
            if let Some(limit) = self.max_elapsed_ms.map(Duration::from_millis) {
                if started.elapsed() + delay > limit {
                    warn!(operation, attempts = attempt, error = %err, "retry time budget exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last_error: err,
                    });
                }
            }

            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient provider failure, retrying"
            );
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
    }
}

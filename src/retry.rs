//! Retry policy for LocalRAG
//! Shared backoff schedule for runtime calls, model polling and readiness checks

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// `base * 2^attempt`
    Exponential,
    /// Always `base`
    Fixed,
}

/// Reusable retry/poll policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added as random jitter (0.0 disables)
    pub jitter: f64,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: 30_000,
            jitter: 0.0,
            backoff: Backoff::Exponential,
        }
    }

    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            base_delay_ms: interval.as_millis() as u64,
            max_delay_ms: interval.as_millis() as u64,
            jitter: 0.0,
            backoff: Backoff::Fixed,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// At least one attempt is always made
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after the given zero-based failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = match self.backoff {
            Backoff::Fixed => self.base_delay_ms,
            Backoff::Exponential => {
                let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
                self.base_delay_ms.saturating_mul(factor)
            }
        };
        let capped = if self.max_delay_ms > 0 {
            base.min(self.max_delay_ms.max(self.base_delay_ms))
        } else {
            base
        };

        if self.jitter > 0.0 && capped > 0 {
            let spread = (capped as f64 * self.jitter) as u64;
            let extra = rand::thread_rng().gen_range(0..=spread);
            Duration::from_millis(capped + extra)
        } else {
            Duration::from_millis(capped)
        }
    }

    /// Run `op` until it succeeds, returns a non-retryable error, or attempts run out.
    /// `op` receives the zero-based attempt number.
    pub async fn run<T, E, F, Fut, R>(&self, mut op: F, is_retryable: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let attempts = self.attempts();
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < attempts && is_retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        "Attempt {}/{} failed: {} (retrying in {:?})",
                        attempt + 1,
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Poll `check` until it reports `true` or attempts run out
    pub async fn poll<F, Fut>(&self, mut check: F) -> bool
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = bool>,
    {
        let attempts = self.attempts();
        for attempt in 0..attempts {
            if check(attempt).await {
                return true;
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.delay_for(attempt)).await;
            }
        }
        false
    }
}

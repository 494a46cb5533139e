//! Retry policy with exponential backoff, shared by both samplers.

use crate::error::{FeedError, Result};
use digfeed_proto::config::RetryConfig;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts allowed after the first failure.
    pub max_attempts: u32,
    /// Base delay for `RateLimited`.
    pub rate_limit_base: Duration,
    /// Base delay for `Transient`.
    pub transient_base: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            rate_limit_base: Duration::from_millis(config.rate_limit_base_ms),
            transient_base: Duration::from_millis(config.transient_base_ms),
            multiplier: config.multiplier,
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), or `None` when the
    /// error is terminal or attempts are used up.
    ///
    /// `base * multiplier^attempt`, capped at `max_backoff`. A server
    /// supplied `Retry-After` acts as a floor.
    pub fn backoff(&self, error: &FeedError, attempt: u32) -> Option<Duration> {
        if !error.is_retryable() || attempt >= self.max_attempts {
            return None;
        }
        let (base, floor) = match error {
            FeedError::RateLimited { retry_after } => (self.rate_limit_base, *retry_after),
            _ => (self.transient_base, None),
        };
        let scaled = base.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let delay = Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()));
        Some(floor.map_or(delay, |f| delay.max(f)))
    }

    /// Run `op` until it succeeds, fails terminally or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => match self.backoff(&e, attempt) {
                    Some(delay) => {
                        warn!(
                            "[retry] {} failed ({}), retry {}/{} in {:?}",
                            label,
                            e,
                            attempt + 1,
                            self.max_attempts,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::error::{ErrorClass, ServiceError};
use crate::rate_limit::{MAX_SUPPRESSION, RateLimiter, ServiceId};

/// Retry behaviour for calls to one upstream service.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total calls allowed, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt, before jitter.
    pub base_delay: Duration,
    /// Upper bound on the backoff delay, before jitter.
    pub max_delay: Duration,
    /// Extra random delay as a fraction of the backoff delay, in `[0, 1]`.
    pub jitter: f64,
    /// Maps a failure to its retry class.
    pub classifier: fn(&ServiceError) -> ErrorClass,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
            classifier: ServiceError::classify,
        }
    }
}

impl RetryPolicy {
    /// Backoff before jitter after the given failed attempt (1-indexed):
    /// `min(max_delay, base_delay * 2^(attempt - 1))`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let fraction = self.jitter.clamp(0.0, 1.0) * fastrand::f64();
        delay + delay.mul_f64(fraction)
    }
}

/// Last classified failure once retries are exhausted, or the first
/// permanent one.
#[derive(Debug, Clone, Error)]
#[error("{service} call failed after {attempts} attempt(s): {last}")]
pub struct RetryError {
    pub service: ServiceId,
    pub attempts: u32,
    pub class: ErrorClass,
    pub last: ServiceError,
}

/// Runs an operation under a [`RetryPolicy`].
///
/// When a limiter is attached, a rate-limited failure carrying a suggested
/// delay suppresses admissions for the executor's service for that long.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    service: ServiceId,
    limiter: Option<Arc<RateLimiter>>,
}

impl RetryExecutor {
    pub fn new(service: ServiceId) -> Self {
        Self {
            service,
            limiter: None,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Call `operation` until it succeeds, fails permanently, or
    /// `policy.max_attempts` calls have been made. The closure receives the
    /// 1-indexed attempt number.
    pub async fn run<T, F, Fut>(&self, policy: &RetryPolicy, mut operation: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let class = (policy.classifier)(&err);
            if class == ErrorClass::Permanent || attempt >= max_attempts {
                return Err(RetryError {
                    service: self.service,
                    attempts: attempt,
                    class,
                    last: err,
                });
            }

            let delay = match class {
                ErrorClass::RateLimited {
                    retry_after: Some(after),
                } => {
                    let after = after.min(MAX_SUPPRESSION);
                    if let Some(limiter) = &self.limiter {
                        limiter.suppress(self.service, after);
                    }
                    after
                }
                _ => policy.jittered(policy.delay_for_attempt(attempt)),
            };

            warn!(
                service = %self.service,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying"
            );
            sleep(delay).await;
        }
    }
}

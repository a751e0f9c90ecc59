//! Per-service token buckets.
//!
//! Refill is computed lazily from elapsed monotonic time on every
//! [`RateLimiter::acquire`] call; there is no background timer. Buckets sit
//! behind a `std::sync::Mutex` which is never held across an await.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::debug;

/// Longest admission pause an upstream "retry after" hint can impose.
pub const MAX_SUPPRESSION: Duration = Duration::from_secs(60 * 60);

/// Upstream services that are rate limited independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ServiceId {
    SourceControl,
    Analysis,
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceId::SourceControl => f.pad("source-control"),
            ServiceId::Analysis => f.pad("analysis"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("no {service} token within {timeout:?}")]
    Timeout { service: ServiceId, timeout: Duration },
    #[error("no bucket configured for {0}")]
    UnknownService(ServiceId),
}

/// Proof that a token was taken. Tokens are not returned.
#[derive(Debug, Clone, Copy)]
pub struct Permit {
    pub service: ServiceId,
    pub granted_at: Instant,
    pub waited: Duration,
}

/// Bucket parameters for one service.
#[derive(Debug, Clone, Copy)]
pub struct BucketConfig {
    pub capacity: u32,
    pub per_minute: u32,
}

/// Admission statistics for one service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LimiterStats {
    pub granted: u64,
    pub waited: u64,
    pub total_wait: Duration,
    pub timeouts: u64,
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
    suppressed_until: Option<Instant>,
    stats: LimiterStats,
}

impl TokenBucket {
    fn new(config: BucketConfig, now: Instant) -> Self {
        let capacity = f64::from(config.capacity.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: f64::from(config.per_minute) / 60.0,
            last_refill: now,
            suppressed_until: None,
            stats: LimiterStats::default(),
        }
    }

    fn refill(&mut self, now: Instant) {
        if let Some(until) = self.suppressed_until {
            if now < until {
                self.tokens = 0.0;
                self.last_refill = now;
                return;
            }
            // Refill restarts from the end of the suppression window.
            self.suppressed_until = None;
            self.tokens = 0.0;
            self.last_refill = until;
        }
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take a token, or report how long until one could be available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if let Some(until) = self.suppressed_until {
            return Err(until.saturating_duration_since(now));
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        if self.refill_per_sec <= 0.0 {
            return Err(Duration::MAX);
        }
        let missing = 1.0 - self.tokens;
        Err(Duration::from_secs_f64(missing / self.refill_per_sec))
    }
}

/// Token-bucket admission control shared by all workers of a run.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: HashMap<ServiceId, Mutex<TokenBucket>>,
}

impl RateLimiter {
    pub fn new(configs: impl IntoIterator<Item = (ServiceId, BucketConfig)>) -> Self {
        let now = Instant::now();
        let buckets = configs
            .into_iter()
            .map(|(service, config)| (service, Mutex::new(TokenBucket::new(config, now))))
            .collect();
        Self { buckets }
    }

    /// Limiter with one bucket per upstream service.
    pub fn for_services(source_control: BucketConfig, analysis: BucketConfig) -> Self {
        Self::new([
            (ServiceId::SourceControl, source_control),
            (ServiceId::Analysis, analysis),
        ])
    }

    fn bucket(&self, service: ServiceId) -> Result<&Mutex<TokenBucket>, AcquireError> {
        self.buckets
            .get(&service)
            .ok_or(AcquireError::UnknownService(service))
    }

    /// Wait for a token of `service`, giving up after `timeout`.
    pub async fn acquire(&self, service: ServiceId, timeout: Duration) -> Result<Permit, AcquireError> {
        let bucket = self.bucket(service)?;
        let started = Instant::now();
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + MAX_SUPPRESSION * 24);

        loop {
            let now = Instant::now();
            let outcome = {
                let mut b = lock(bucket);
                let outcome = b.try_take(now);
                if outcome.is_ok() {
                    let waited = now.saturating_duration_since(started);
                    b.stats.granted += 1;
                    if !waited.is_zero() {
                        b.stats.waited += 1;
                        b.stats.total_wait += waited;
                    }
                } else if now >= deadline {
                    b.stats.timeouts += 1;
                }
                outcome
            };

            match outcome {
                Ok(()) => {
                    return Ok(Permit {
                        service,
                        granted_at: now,
                        waited: now.saturating_duration_since(started),
                    });
                }
                Err(_) if now >= deadline => {
                    return Err(AcquireError::Timeout { service, timeout });
                }
                Err(wait) => {
                    let remaining = deadline.saturating_duration_since(now);
                    let nap = wait.min(remaining).max(Duration::from_millis(1));
                    debug!(%service, wait_ms = nap.as_millis() as u64, "waiting for rate-limit token");
                    sleep(nap).await;
                }
            }
        }
    }

    /// Hold `service`'s bucket at zero for `duration`.
    ///
    /// Used when the upstream answered with an explicit "retry after" signal.
    /// An earlier suppression that ends later is kept. `duration` is capped
    /// at [`MAX_SUPPRESSION`].
    pub fn suppress(&self, service: ServiceId, duration: Duration) {
        let Ok(bucket) = self.bucket(service) else {
            return;
        };
        let duration = duration.min(MAX_SUPPRESSION);
        let now = Instant::now();
        let until = now + duration;
        let mut b = lock(bucket);
        b.refill(now);
        b.tokens = 0.0;
        b.suppressed_until = Some(match b.suppressed_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        debug!(%service, suppress_ms = duration.as_millis() as u64, "suppressing admissions");
    }

    pub fn stats(&self, service: ServiceId) -> Option<LimiterStats> {
        self.buckets.get(&service).map(|b| lock(b).stats)
    }
}

// A poisoned bucket only means another worker panicked mid-update; the
// numeric state is still usable.
fn lock(bucket: &Mutex<TokenBucket>) -> std::sync::MutexGuard<'_, TokenBucket> {
    bucket.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(capacity: u32, per_minute: u32) -> RateLimiter {
        RateLimiter::new([(
            ServiceId::SourceControl,
            BucketConfig { capacity, per_minute },
        )])
    }

    #[tokio::test(start_paused = true)]
    async fn first_token_is_immediate() {
        let l = limiter(1, 30);
        let permit = l
            .acquire(ServiceId::SourceControl, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(permit.waited.is_zero());
    }

    #[tokio::test(start_paused = true)]
    async fn second_token_waits_one_interval() {
        let l = limiter(1, 30);
        l.acquire(ServiceId::SourceControl, Duration::from_secs(5)).await.unwrap();
        let start = Instant::now();
        l.acquire(ServiceId::SourceControl, Duration::from_secs(5)).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(1990), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(2100), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_no_token_arrives() {
        let l = limiter(1, 1);
        l.acquire(ServiceId::SourceControl, Duration::from_secs(1)).await.unwrap();
        let err = l
            .acquire(ServiceId::SourceControl, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::Timeout { .. }));
        assert_eq!(l.stats(ServiceId::SourceControl).unwrap().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_service_is_rejected() {
        let l = limiter(1, 30);
        let err = l
            .acquire(ServiceId::Analysis, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, AcquireError::UnknownService(ServiceId::Analysis));
    }

    #[tokio::test(start_paused = true)]
    async fn permits_in_a_minute_never_exceed_rate_plus_burst() {
        let capacity = 3;
        let per_minute = 10;
        let l = Arc::new(limiter(capacity, per_minute));
        let grants = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let l = Arc::clone(&l);
            let grants = Arc::clone(&grants);
            tasks.push(tokio::spawn(async move {
                while start.elapsed() < Duration::from_secs(180) {
                    if let Ok(p) = l.acquire(ServiceId::SourceControl, Duration::from_secs(30)).await {
                        grants.lock().unwrap().push(p.granted_at);
                    }
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let mut grants = grants.lock().unwrap().clone();
        grants.sort();
        assert!(!grants.is_empty());
        for (i, first) in grants.iter().enumerate() {
            let in_window = grants[i..]
                .iter()
                .filter(|g| g.saturating_duration_since(*first) < Duration::from_secs(60))
                .count();
            assert!(
                in_window <= (per_minute + capacity) as usize,
                "{in_window} permits in one window"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn suppression_holds_bucket_at_zero() {
        let l = limiter(5, 60);
        l.suppress(ServiceId::SourceControl, Duration::from_secs(10));
        let start = Instant::now();
        l.acquire(ServiceId::SourceControl, Duration::from_secs(30)).await.unwrap();
        // Suppression window plus one refill interval.
        assert!(start.elapsed() >= Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_suppression_does_not_shorten_longer_one() {
        let l = limiter(1, 60);
        l.suppress(ServiceId::SourceControl, Duration::from_secs(20));
        l.suppress(ServiceId::SourceControl, Duration::from_secs(2));
        let start = Instant::now();
        l.acquire(ServiceId::SourceControl, Duration::from_secs(60)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_suppression_is_capped() {
        let l = limiter(1, 60);
        l.suppress(ServiceId::SourceControl, Duration::from_secs(u64::MAX));
        let start = Instant::now();
        l.acquire(ServiceId::SourceControl, MAX_SUPPRESSION * 2).await.unwrap();
        assert!(start.elapsed() >= MAX_SUPPRESSION);
        assert!(start.elapsed() <= MAX_SUPPRESSION + Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn huge_acquire_timeout_does_not_overflow() {
        let l = limiter(1, 60);
        l.acquire(ServiceId::SourceControl, Duration::MAX).await.unwrap();
        l.acquire(ServiceId::SourceControl, Duration::MAX).await.unwrap();
        assert_eq!(l.stats(ServiceId::SourceControl).unwrap().granted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_count_waits() {
        let l = limiter(1, 60);
        l.acquire(ServiceId::SourceControl, Duration::from_secs(5)).await.unwrap();
        l.acquire(ServiceId::SourceControl, Duration::from_secs(5)).await.unwrap();
        let stats = l.stats(ServiceId::SourceControl).unwrap();
        assert_eq!(stats.granted, 2);
        assert_eq!(stats.waited, 1);
        assert!(stats.total_wait >= Duration::from_millis(990));
    }
}

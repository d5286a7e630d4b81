//! Token-bucket rate limiter (spec §4.6).
//!
//! Lazy refill: tokens are topped up at each request based on elapsed time
//! rather than on a ticking background task. `wait` never holds the internal
//! mutex across the await — it releases the lock, sleeps until the next
//! token is projected to be available, then re-checks.

use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Classic token bucket: rate (tokens/sec), burst capacity.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
    created_at: Instant,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, burst: u64) -> Self {
        let now = Instant::now();
        Self {
            rate: rate_per_sec,
            burst: burst as f64,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: now,
            }),
            created_at: now,
        }
    }

    /// ~100/s, burst 10.
    pub fn production() -> Self {
        Self::new(100.0, 10)
    }

    /// 10,000/s, burst 1,000 — fast enough that tests never block on it.
    pub fn test_preset() -> Self {
        Self::new(10_000.0, 1_000)
    }

    /// Effectively unlimited.
    pub fn unlimited() -> Self {
        Self::new(f64::MAX, 1_000_000)
    }

    fn refill_locked(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;
    }

    /// Non-blocking: consume one token if available, return whether it did.
    pub fn allow(&self) -> bool {
        let mut bucket = self.bucket.lock().expect("limiter mutex poisoned");
        self.refill_locked(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// How long until at least one token would be available, given the
    /// current snapshot. `None` means a token is available now.
    fn time_to_next_token(&self) -> Option<Duration> {
        let mut bucket = self.bucket.lock().expect("limiter mutex poisoned");
        self.refill_locked(&mut bucket);
        if bucket.tokens >= 1.0 {
            None
        } else {
            let deficit = 1.0 - bucket.tokens;
            Some(Duration::from_secs_f64(deficit / self.rate))
        }
    }

    /// Block until a token is available or `cancel` resolves first.
    ///
    /// The mutex is never held across `.await` — each iteration takes a
    /// snapshot, drops the lock, sleeps the projected gap, and loops. This
    /// keeps `Wait` honoring cancellation within roughly one sleep quantum
    /// as required by §4.6.
    pub async fn wait(&self, cancel: &tokio_util::sync::CancellationToken) -> bool {
        loop {
            if self.allow() {
                return true;
            }
            let Some(gap) = self.time_to_next_token() else {
                continue;
            };
            // Never sleep for zero or pathologically long waits.
            let gap = gap.clamp(Duration::from_millis(1), Duration::from_secs(5));
            tokio::select! {
                _ = tokio::time::sleep(gap) => continue,
                _ = cancel.cancelled() => return false,
            }
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// `true` once tokens have refilled back to full burst capacity — used
    /// by the admission layer's cleanup sweep as an "idle since last window"
    /// proxy (§4.7, §9 Decision 2).
    pub fn is_at_burst_capacity(&self) -> bool {
        let mut bucket = self.bucket.lock().expect("limiter mutex poisoned");
        self.refill_locked(&mut bucket);
        bucket.tokens >= self.burst
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_consumes_burst_then_blocks() {
        let limiter = RateLimiter::new(1.0, 3);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[tokio::test]
    async fn wait_unblocks_after_refill() {
        let limiter = RateLimiter::new(1000.0, 1);
        assert!(limiter.allow());
        let cancel = tokio_util::sync::CancellationToken::new();
        let got = tokio::time::timeout(Duration::from_secs(1), limiter.wait(&cancel))
            .await
            .expect("wait should unblock within 1s at 1000 tokens/sec");
        assert!(got);
    }

    #[tokio::test]
    async fn wait_honors_cancellation() {
        let limiter = RateLimiter::new(0.001, 1);
        assert!(limiter.allow());
        let cancel = tokio_util::sync::CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel2.cancel();
        });
        let got = limiter.wait(&cancel).await;
        assert!(!got);
    }

    #[test]
    fn unlimited_preset_never_blocks() {
        let limiter = RateLimiter::unlimited();
        for _ in 0..10_000 {
            assert!(limiter.allow());
        }
    }

    #[test]
    fn is_at_burst_capacity_reflects_full_refill() {
        let limiter = RateLimiter::new(1_000_000.0, 5);
        assert!(limiter.is_at_burst_capacity());
        limiter.allow();
        assert!(!limiter.is_at_burst_capacity());
    }
}

//! # Rate Limiters
//!
//! Decide how long an item has to wait before it is handed out again after
//! a failed or explicitly requeued reconcile.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Computes retry delays for queue items.
pub trait RateLimiter: Send + Sync {
    /// Delay before `item` may be processed again. Every call counts as a failure.
    fn when(&self, item: &str) -> Duration;

    /// Drop any failure history kept for `item`.
    fn forget(&self, item: &str);

    /// Number of failures recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &str) -> u32;
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemExponentialFailureRateLimiter {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, item: &str) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(item.to_string()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        // 2^31 * base already overflows any sane cap
        if exp >= 31 {
            return self.max;
        }
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn forget(&self, item: &str) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &str) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by every item. Reserves a token per call and
/// returns how long the caller must wait for it.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    #[must_use]
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _item: &str) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &str) {}

    fn num_requeues(&self, _item: &str) -> u32 {
        0
    }
}

/// Combines limiters by taking the longest delay any of them asks for.
pub struct MaxOfRateLimiter {
    limiters: Vec<Arc<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    #[must_use]
    pub fn new(limiters: Vec<Arc<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, item: &str) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &str) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &str) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Limiter used by reconcilers that do not bring their own: exponential
/// per-item backoff (5ms up to 1000s) combined with a 10 qps / 100 burst bucket.
#[must_use]
pub fn default_controller_rate_limiter() -> Arc<dyn RateLimiter> {
    Arc::new(MaxOfRateLimiter::new(vec![
        Arc::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Arc::new(BucketRateLimiter::new(10.0, 100)),
    ]))
}

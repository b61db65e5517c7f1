//! Keyed token-bucket throttling with an in-memory store.
//! Buckets are created lazily, one per key, and evicted by a background
//! task once they have been idle for longer than the bucket TTL.
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_BUCKET_TTL: Duration = Duration::from_secs(60 * 60);

/// Per-key token bucket map. `allow` consumes one token from the bucket
/// associated with the key, creating the bucket (filled to `burst`) on
/// first use.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, BucketEntry>>,
    rate: f64,
    burst: f64,
    cleanup_interval: Duration,
    bucket_ttl: Duration,
}

struct BucketEntry {
    bucket: TokenBucket,
    last_access: Instant,
}

struct TokenBucket {
    tokens: f64,
    refreshed: Instant,
}

impl TokenBucket {
    fn new(burst: f64) -> Self {
        Self {
            tokens: burst,
            refreshed: Instant::now(),
        }
    }

    fn allow(&mut self, rate: f64, burst: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.refreshed);
        self.tokens = burst.min(self.tokens + elapsed.as_secs_f64() * rate);
        self.refreshed = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl RateLimiter {
    /// `rate` is the sustained number of events per second; `burst` is
    /// the bucket capacity.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self::with_tuning(rate, burst, DEFAULT_CLEANUP_INTERVAL, DEFAULT_BUCKET_TTL)
    }

    pub fn with_tuning(
        rate: f64,
        burst: u32,
        cleanup_interval: Duration,
        bucket_ttl: Duration,
    ) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate,
            burst: burst as f64,
            cleanup_interval,
            bucket_ttl,
        }
    }

    /// Attempt to consume one token for `key`.
    /// Returns false when the bucket is empty.
    pub fn allow(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock();
        let entry = buckets
            .entry(key.to_string())
            .or_insert_with(|| BucketEntry {
                bucket: TokenBucket::new(self.burst),
                last_access: Instant::now(),
            });
        entry.last_access = Instant::now();
        entry.bucket.allow(self.rate, self.burst)
    }

    /// Kick off the background eviction task. It runs until `shutdown`
    /// changes state.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let limiter = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                Instant::now() + limiter.cleanup_interval,
                limiter.cleanup_interval,
            );
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => limiter.cleanup(),
                    _ = shutdown.changed() => {
                        tracing::debug!("rate limiter cleanup task stopping");
                        return;
                    }
                }
            }
        });
    }

    fn cleanup(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets
            .retain(|_, entry| now.saturating_duration_since(entry.last_access) <= self.bucket_ttl);
        let evicted = before - buckets.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted idle rate limiter buckets");
        }
    }

    fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

//! Core rate limiter implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use super::backend::RateLimiter;
use super::bucket::Bucket;
use super::sweeper::{evict_idle, spawn_sweeper, BucketMap, SweeperHandle};
use crate::config::LimiterConfig;
use crate::error::{Result, TollgateError};

/// A per-key token bucket rate limiter.
///
/// Every key gets its own bucket holding up to `limit` tokens, refilled
/// continuously at `limit / interval` tokens per second. Refill happens
/// lazily when a key is checked. A background task started at construction
/// evicts buckets that have been idle for longer than the idle timeout; it
/// runs until [`TokenBucketLimiter::stop`] is awaited or the limiter is
/// dropped.
///
/// All buckets live behind a single lock, so admission checks for different
/// keys are serialized with each other and with the eviction sweep.
pub struct TokenBucketLimiter {
    /// Buckets indexed by key
    buckets: BucketMap,
    /// Tokens added per second
    rate: f64,
    /// Maximum tokens per bucket
    capacity: f64,
    /// Idle time after which a bucket is evicted
    idle_timeout: Duration,
    /// Running sweep task, `None` once stopped
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl TokenBucketLimiter {
    /// Create a limiter allowing `limit` checks per `interval` for each key,
    /// with the default eviction settings.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(limit: u64, interval: Duration) -> Result<Self> {
        Self::with_config(&LimiterConfig::new(limit, interval))
    }

    /// Create a limiter from a [`LimiterConfig`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_config(config: &LimiterConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| TollgateError::NoRuntime)?;

        let capacity = config.limit as f64;
        let rate = capacity / config.interval().as_secs_f64();
        let idle_timeout = config.idle_timeout();

        let buckets: BucketMap = Arc::new(Mutex::new(HashMap::new()));
        let sweeper = spawn_sweeper(
            &runtime,
            buckets.clone(),
            idle_timeout,
            config.sweep_interval(),
        );

        info!(
            limit = config.limit,
            interval = ?config.interval(),
            rate = rate,
            idle_timeout = ?idle_timeout,
            sweep_interval = ?config.sweep_interval(),
            "Token bucket limiter created"
        );

        Ok(Self {
            buckets,
            rate,
            capacity,
            idle_timeout,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Check whether one request for `key` is allowed, consuming a token if so.
    ///
    /// Any string is a valid key. A denial is a normal outcome and costs the
    /// same as an allowed check.
    pub fn allow(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock();
        let now = Instant::now();

        if let Some(bucket) = buckets.get_mut(key) {
            return self.admit(key, bucket, now);
        }

        trace!(key = %key, capacity = self.capacity, "Creating new bucket");
        let bucket = buckets
            .entry(key.to_owned())
            .or_insert(Bucket::full(self.capacity, now));
        self.admit(key, bucket, now)
    }

    /// Refill `bucket` up to `now` and try to take one token from it.
    fn admit(&self, key: &str, bucket: &mut Bucket, now: Instant) -> bool {
        bucket.refill(now, self.rate, self.capacity);

        let allowed = bucket.try_take();
        if !allowed {
            trace!(key = %key, tokens = bucket.tokens(), "Rate limit exceeded");
        }
        allowed
    }

    /// Run one eviction pass now, returning the number of evicted buckets.
    pub fn sweep(&self) -> usize {
        let mut buckets = self.buckets.lock();
        let evicted = evict_idle(&mut buckets, Instant::now(), self.idle_timeout);
        debug!(evicted = evicted, remaining = buckets.len(), "Manual eviction sweep");
        evicted
    }

    /// Stop the background eviction sweep and wait for it to exit.
    ///
    /// Calling this more than once is a no-op. Admission checks keep working
    /// after the limiter is stopped; idle buckets are simply no longer evicted.
    pub async fn stop(&self) {
        let sweeper = self.sweeper.lock().take();
        match sweeper {
            Some(sweeper) => sweeper.shutdown().await,
            None => debug!("Limiter already stopped"),
        }
    }

    /// Whether [`TokenBucketLimiter::stop`] has been called.
    pub fn is_stopped(&self) -> bool {
        self.sweeper.lock().is_none()
    }

    /// Tokens added per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Maximum tokens a bucket can hold.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Idle time after which a bucket is evicted.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Get the number of tracked buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Current tokens for `key`, as of its last check.
    #[cfg(test)]
    pub(crate) fn tokens(&self, key: &str) -> Option<f64> {
        self.buckets.lock().get(key).map(Bucket::tokens)
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn allow(&self, key: &str) -> bool {
        TokenBucketLimiter::allow(self, key)
    }
}

impl Drop for TokenBucketLimiter {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("rate", &self.rate)
            .field("capacity", &self.capacity)
            .field("idle_timeout", &self.idle_timeout)
            .field("buckets", &self.bucket_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: u64, interval: Duration) -> TokenBucketLimiter {
        TokenBucketLimiter::new(limit, interval).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_creation() {
        let limiter = limiter(10, Duration::from_secs(2));
        assert_eq!(limiter.capacity(), 10.0);
        assert_eq!(limiter.rate(), 5.0);
        assert_eq!(limiter.idle_timeout(), Duration::from_secs(600));
        assert_eq!(limiter.bucket_count(), 0);
        limiter.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        assert!(matches!(
            TokenBucketLimiter::new(0, Duration::from_secs(1)),
            Err(TollgateError::InvalidLimit(0))
        ));
        assert!(matches!(
            TokenBucketLimiter::new(1, Duration::ZERO),
            Err(TollgateError::InvalidInterval)
        ));
    }

    #[test]
    fn test_requires_runtime() {
        assert!(matches!(
            TokenBucketLimiter::new(1, Duration::from_secs(1)),
            Err(TollgateError::NoRuntime)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sub_millisecond_interval() {
        let precise = limiter(3, Duration::from_micros(1500));
        assert!((precise.rate() - 2000.0).abs() < 1e-6, "rate = {}", precise.rate());
        precise.stop().await;

        let fast = limiter(1, Duration::from_micros(500));
        assert!((fast.rate() - 2000.0).abs() < 1e-6, "rate = {}", fast.rate());
        assert!(fast.allow("fast"));
        assert!(!fast.allow("fast"));

        tokio::time::advance(Duration::from_micros(600)).await;
        assert!(fast.allow("fast"));
        fast.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_bucket_is_reused() {
        let limiter = limiter(3, Duration::from_secs(1));

        assert!(limiter.allow("repeat"));
        assert!(limiter.allow("repeat"));
        assert_eq!(limiter.bucket_count(), 1);
        assert_eq!(limiter.tokens("repeat"), Some(1.0));

        assert!(limiter.allow("other"));
        assert_eq!(limiter.bucket_count(), 2);
        assert_eq!(limiter.tokens("repeat"), Some(1.0));

        limiter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_up_to_capacity() {
        let limiter = limiter(5, Duration::from_secs(1));

        for i in 0..5 {
            assert!(limiter.allow("test-client"), "request {} should be allowed", i);
        }
        assert!(!limiter.allow("test-client"));

        limiter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_bucket_starts_full() {
        let limiter = limiter(3, Duration::from_secs(1));

        assert!(limiter.allow("fresh"));
        assert_eq!(limiter.tokens("fresh"), Some(2.0));
        assert_eq!(limiter.bucket_count(), 1);

        limiter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_after_interval() {
        let limiter = limiter(1, Duration::from_millis(100));

        assert!(limiter.allow("test-client-refill"));
        assert!(!limiter.allow("test-client-refill"));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(limiter.allow("test-client-refill"));

        limiter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_refill_is_not_enough() {
        let limiter = limiter(2, Duration::from_secs(1));

        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));

        // 2 tokens/s for 300ms leaves 0.6 tokens
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(!limiter.allow("k"));
        let tokens = limiter.tokens("k").unwrap();
        assert!((tokens - 0.6).abs() < 1e-6, "tokens = {}", tokens);

        // Denied checks still bank elapsed time
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(limiter.allow("k"));

        limiter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_over_refill_after_idle() {
        let limiter = limiter(3, Duration::from_secs(1));

        assert!(limiter.allow("idle"));
        tokio::time::advance(Duration::from_secs(300)).await;

        for _ in 0..3 {
            assert!(limiter.allow("idle"));
        }
        assert!(!limiter.allow("idle"));

        limiter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = limiter(2, Duration::from_secs(1));

        assert!(limiter.allow("a"));
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));

        assert!(limiter.allow("b"));
        assert_eq!(limiter.tokens("b"), Some(1.0));
        assert_eq!(limiter.tokens("a"), Some(0.0));

        limiter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_key_is_valid() {
        let limiter = limiter(1, Duration::from_secs(1));

        assert!(limiter.allow(""));
        assert!(!limiter.allow(""));
        assert!(limiter.allow("other"));

        limiter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_stay_within_bounds() {
        let limiter = limiter(4, Duration::from_millis(400));

        for step in 0..200u64 {
            limiter.allow("bounded");
            let tokens = limiter.tokens("bounded").unwrap();
            assert!(tokens >= 0.0, "negative tokens at step {}", step);
            assert!(tokens <= 4.0, "overfull bucket at step {}", step);
            tokio::time::advance(Duration::from_millis(step % 7 * 15)).await;
        }

        limiter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_evicts_idle_buckets() {
        let config = LimiterConfig::new(1, Duration::from_secs(1))
            .with_idle_timeout(Duration::from_millis(200))
            .with_sweep_interval(Duration::from_millis(50));
        let limiter = TokenBucketLimiter::with_config(&config).unwrap();

        assert!(limiter.allow("cleanup-client"));
        assert_eq!(limiter.bucket_count(), 1);
        assert!(limiter.tokens("cleanup-client").is_some());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(limiter.bucket_count(), 0);

        // Recreated as a brand new bucket
        assert!(limiter.allow("cleanup-client"));

        limiter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_buckets_survive_sweep() {
        let config = LimiterConfig::new(100, Duration::from_secs(1))
            .with_idle_timeout(Duration::from_millis(200))
            .with_sweep_interval(Duration::from_millis(50));
        let limiter = TokenBucketLimiter::with_config(&config).unwrap();

        for _ in 0..10 {
            limiter.allow("busy");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(limiter.bucket_count(), 1);
        limiter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_sweep() {
        let config = LimiterConfig::new(1, Duration::from_secs(1))
            .with_idle_timeout(Duration::from_secs(10));
        let limiter = TokenBucketLimiter::with_config(&config).unwrap();

        limiter.allow("old");
        tokio::time::advance(Duration::from_secs(8)).await;
        limiter.allow("new");
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(limiter.sweep(), 1);
        assert!(limiter.tokens("old").is_none());
        assert!(limiter.tokens("new").is_some());

        limiter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_twice_is_noop() {
        let limiter = limiter(1, Duration::from_secs(1));
        assert!(!limiter.is_stopped());

        limiter.stop().await;
        assert!(limiter.is_stopped());

        limiter.stop().await;
        assert!(limiter.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_allow_after_stop_keeps_working() {
        let config = LimiterConfig::new(1, Duration::from_millis(100))
            .with_idle_timeout(Duration::from_millis(200))
            .with_sweep_interval(Duration::from_millis(50));
        let limiter = TokenBucketLimiter::with_config(&config).unwrap();
        limiter.stop().await;

        assert!(limiter.allow("after-stop"));
        assert!(!limiter.allow("after-stop"));

        tokio::time::sleep(Duration::from_secs(1)).await;

        // No sweep ran, but lazy refill still applies
        assert_eq!(limiter.bucket_count(), 1);
        assert!(limiter.allow("after-stop"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trait_object_dispatch() {
        let limiter = limiter(1, Duration::from_secs(1));
        {
            let dyn_limiter: &dyn RateLimiter = &limiter;
            assert!(dyn_limiter.allow("trait"));
            assert!(!dyn_limiter.allow("trait"));
        }
        limiter.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_are_not_lost() {
        let limiter = Arc::new(limiter(1000, Duration::from_secs(1)));
        let workers = 10;
        let requests_per_worker = 50;

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                (0..requests_per_worker)
                    .filter(|_| limiter.allow("concurrent-client"))
                    .count()
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            allowed += handle.await.unwrap();
        }

        assert_eq!(allowed, workers * requests_per_worker);
        limiter.stop().await;
    }
}

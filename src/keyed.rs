//! Per-identifier limiting.
//!
//! A [`KeyedRateLimiter`] applies one configuration to many independent
//! buckets, one per identifier (client IP, API key, route...). Buckets are
//! created full on first use.
//!
//! Memory stays bounded through [`KeyedRateLimiter::evict_idle`]: a bucket
//! that has refilled to capacity carries no information a fresh bucket would
//! not, so dropping it never changes a later admission decision.

use crate::error::AcquireError;
use crate::limiter::{Engine, RateLimiter, RateLimiterBuilder};
use crate::store::{InMemoryTokenStore, TokenStore};
use crate::telemetry::{NullSink, TelemetrySink};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Token buckets keyed by caller identity.
pub struct KeyedRateLimiter<S = InMemoryTokenStore, T = NullSink> {
    engine: Engine<S, T>,
}

impl<S, T> std::fmt::Debug for KeyedRateLimiter<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedRateLimiter").field("config", self.engine.config()).finish()
    }
}

impl KeyedRateLimiter {
    /// Same builder as [`TokenBucketLimiter`](crate::TokenBucketLimiter); finish with `build_keyed`.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::new()
    }
}

impl<S, T> KeyedRateLimiter<S, T> {
    pub(crate) fn from_engine(engine: Engine<S, T>) -> Self {
        Self { engine }
    }
}

impl<S, T> KeyedRateLimiter<S, T>
where
    S: TokenStore + 'static,
    T: TelemetrySink,
    T::Future: Send,
{
    /// Spend a token from `key`'s bucket, waiting at most `max_retries` times.
    pub async fn acquire(&self, key: &str) -> Result<(), AcquireError> {
        self.engine.acquire(key, self.engine.config().max_retries()).await
    }

    /// Spend a token from `key`'s bucket only if one is available now.
    pub async fn try_acquire(&self, key: &str) -> Result<(), AcquireError> {
        self.engine.acquire(key, 0).await
    }

    /// Refill and return the tokens in `key`'s bucket.
    pub async fn tokens(&self, key: &str) -> Result<f64, AcquireError> {
        self.engine.tokens(key).await
    }

    /// Number of buckets currently stored.
    pub async fn len(&self) -> Result<usize, AcquireError> {
        self.engine.store().len().await.map_err(|e| AcquireError::Store(Box::new(e)))
    }

    /// Drop every bucket that has refilled to capacity. Returns how many were removed.
    pub async fn evict_idle(&self) -> Result<usize, AcquireError> {
        let now = self.engine.now();
        let rate = self.engine.config().requests_per_second();
        let capacity = self.engine.config().burst_size();
        let removed = self
            .engine
            .store()
            .retain(&|_, state| !state.is_full_at(now, rate, capacity))
            .await
            .map_err(|e| AcquireError::Store(Box::new(e)))?;
        if removed > 0 {
            tracing::debug!(target: "bucketeer::keyed", removed, "evicted idle buckets");
        }
        Ok(removed)
    }

    /// Bind `key` to this limiter, yielding a single-bucket [`RateLimiter`].
    pub fn bucket(self: &Arc<Self>, key: impl Into<String>) -> KeyedBucket<S, T> {
        KeyedBucket { limiter: self.clone(), key: key.into() }
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval` on the tokio runtime.
    ///
    /// The task stops once every other handle to the limiter is dropped.
    pub fn spawn_evictor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else { break };
                if let Err(err) = limiter.evict_idle().await {
                    tracing::warn!(target: "bucketeer::keyed", error = %err, "idle bucket eviction failed");
                }
            }
        })
    }
}

/// One identifier's bucket inside a [`KeyedRateLimiter`].
pub struct KeyedBucket<S = InMemoryTokenStore, T = NullSink> {
    limiter: Arc<KeyedRateLimiter<S, T>>,
    key: String,
}

impl<S, T> KeyedBucket<S, T> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait::async_trait]
impl<S, T> RateLimiter for KeyedBucket<S, T>
where
    S: TokenStore + 'static,
    T: TelemetrySink,
    T::Future: Send,
{
    async fn acquire(&self) -> Result<(), AcquireError> {
        self.limiter.acquire(&self.key).await
    }

    async fn tokens(&self) -> Result<f64, AcquireError> {
        self.limiter.tokens(&self.key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sleeper::ClockSleeper;

    fn keyed(rate: f64, capacity: f64) -> (Arc<KeyedRateLimiter>, ManualClock) {
        let clock = ManualClock::new();
        let limiter = KeyedRateLimiter::builder()
            .requests_per_second(rate)
            .burst_size(capacity)
            .max_retries(0)
            .with_clock(clock.clone())
            .with_sleeper(ClockSleeper::advancing(clock.clone()))
            .build_keyed()
            .unwrap();
        (Arc::new(limiter), clock)
    }

    #[tokio::test]
    async fn buckets_are_independent() {
        let (limiter, _) = keyed(1.0, 2.0);
        limiter.acquire("10.0.0.1").await.unwrap();
        limiter.acquire("10.0.0.1").await.unwrap();
        assert!(limiter.acquire("10.0.0.1").await.unwrap_err().is_exceeded());

        limiter.acquire("10.0.0.2").await.unwrap();
        assert_eq!(limiter.tokens("10.0.0.2").await.unwrap(), 1.0);
        assert_eq!(limiter.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn evicts_only_refilled_buckets() {
        let (limiter, clock) = keyed(1.0, 2.0);
        limiter.acquire("a").await.unwrap();
        limiter.acquire("b").await.unwrap();
        limiter.acquire("b").await.unwrap();

        // "a" is back to 2 tokens, "b" only to 1.
        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.evict_idle().await.unwrap(), 1);
        assert_eq!(limiter.len().await.unwrap(), 1);
        assert_eq!(limiter.tokens("b").await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn eviction_is_lossless() {
        let (limiter, clock) = keyed(1.0, 1.0);
        limiter.acquire("a").await.unwrap();
        clock.advance(Duration::from_secs(5));
        limiter.evict_idle().await.unwrap();
        assert_eq!(limiter.len().await.unwrap(), 0);
        // A recreated bucket behaves exactly like the refilled one would have.
        assert_eq!(limiter.tokens("a").await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn bucket_handle_implements_rate_limiter() {
        let (limiter, _) = keyed(1.0, 1.0);
        let bucket = limiter.bucket("search");
        assert_eq!(bucket.key(), "search");
        RateLimiter::acquire(&bucket).await.unwrap();
        assert!(RateLimiter::acquire(&bucket).await.is_err());
        assert!(limiter.try_acquire("search").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn evictor_runs_periodically_and_stops_when_dropped() {
        let (limiter, clock) = keyed(1.0, 1.0);
        limiter.acquire("a").await.unwrap();
        clock.advance(Duration::from_secs(2));

        let handle = limiter.spawn_evictor(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(limiter.len().await.unwrap(), 0);

        drop(limiter);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(handle.is_finished());
    }
}

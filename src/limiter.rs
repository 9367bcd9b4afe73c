//! Token bucket limiter with bounded wait-and-retry.
//!
//! Semantics:
//! - The bucket starts full and refills at `requests_per_second`, capped at
//!   `burst_size`.
//! - `acquire` refills, then spends one token if a whole one is available.
//!   Otherwise it sleeps for exactly the time until one token has accrued
//!   and tries again, at most `max_retries` times.
//! - Once the retry budget is spent the caller gets
//!   [`RateLimitExceeded`](crate::RateLimitExceeded).
//!
//! Invariants:
//! - `0 <= tokens <= burst_size` in every stored state.
//! - Refill, check and decrement commit as one compare-and-set on the stored
//!   `(tokens, timestamp)` pair; concurrent callers cannot spend one token twice.
//! - No lock is held across a sleep. A dropped `acquire` future leaves
//!   nothing behind.
//!
//! Example
//! ```rust
//! use bucketeer::{RateLimiter, TokenBucketLimiter};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let limiter = TokenBucketLimiter::builder()
//!     .requests_per_second(10.0)
//!     .burst_size(100.0)
//!     .max_retries(5)
//!     .build()
//!     .unwrap();
//!
//! limiter.acquire().await.unwrap();
//! assert!(limiter.tokens().await.unwrap() < 100.0);
//! # });
//! ```

use crate::bucket::{BucketState, Take};
use crate::clock::{Clock, MonotonicClock};
use crate::config::RateLimiterConfig;
use crate::error::{AcquireError, ConfigError, RateLimitExceeded, StoreContention};
use crate::keyed::KeyedRateLimiter;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::{InMemoryTokenStore, TokenStore};
use crate::telemetry::{emit_best_effort, NullSink, RateLimitEvent, TelemetrySink};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Store key used by a limiter that was not given one.
pub const DEFAULT_BUCKET_KEY: &str = "global";

/// Lost compare-and-set races tolerated per admission check before the store
/// is reported as failing.
pub const MAX_STORE_CONFLICTS: u32 = 1024;

/// Core interface for admission control.
///
/// Middleware only depends on this trait, so limiters with different stores
/// or wrappers are interchangeable.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait (bounded) for a token and spend it.
    async fn acquire(&self) -> Result<(), AcquireError>;

    /// Refill and report the available tokens.
    async fn tokens(&self) -> Result<f64, AcquireError>;
}

#[async_trait]
impl<L> RateLimiter for Arc<L>
where
    L: RateLimiter + ?Sized,
{
    async fn acquire(&self) -> Result<(), AcquireError> {
        (**self).acquire().await
    }

    async fn tokens(&self) -> Result<f64, AcquireError> {
        (**self).tokens().await
    }
}

/// Bucket parameters plus the collaborators every bucket needs. Shared by the
/// single-bucket and keyed limiters.
pub(crate) struct Engine<S, T> {
    config: RateLimiterConfig,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: T,
}

impl<S, T> Engine<S, T> {
    pub(crate) fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_nanos()
    }
}

impl<S, T> Engine<S, T>
where
    S: TokenStore + 'static,
    T: TelemetrySink,
    T::Future: Send,
{
    pub(crate) async fn acquire(&self, key: &str, max_retries: u32) -> Result<(), AcquireError> {
        let mut retries = 0;
        loop {
            match self.take(key).await? {
                Take::Taken { remaining } => {
                    tracing::trace!(target: "bucketeer::limiter", key, remaining, retries, "token acquired");
                    self.emit(RateLimitEvent::Admitted { key: key.to_string(), remaining, retries })
                        .await;
                    return Ok(());
                }
                Take::Short { wait } if retries >= max_retries => {
                    tracing::warn!(target: "bucketeer::limiter", key, retries, ?wait, "rate limit exceeded");
                    self.emit(RateLimitEvent::Rejected { key: key.to_string(), retries, wait }).await;
                    return Err(RateLimitExceeded { retries, wait }.into());
                }
                Take::Short { wait } => {
                    retries += 1;
                    tracing::debug!(target: "bucketeer::limiter", key, retry = retries, ?wait, "bucket empty, waiting");
                    self.emit(RateLimitEvent::Waiting { key: key.to_string(), retry: retries, wait })
                        .await;
                    self.sleeper.sleep(wait).await;
                }
            }
        }
    }

    pub(crate) async fn tokens(&self, key: &str) -> Result<f64, AcquireError> {
        self.commit(key, |_| ()).await.map(|(state, ())| state.tokens)
    }

    async fn take(&self, key: &str) -> Result<Take, AcquireError> {
        let rate = self.config.requests_per_second();
        self.commit(key, |state| state.try_take(rate)).await.map(|(_, take)| take)
    }

    /// Refill the bucket under `key`, apply `step` and store the result.
    ///
    /// Read, refill, `step` and write form one transaction: if the stored
    /// state changed since it was read, the whole sequence is redone with a
    /// fresh clock reading.
    async fn commit<R: Send>(
        &self,
        key: &str,
        mut step: impl FnMut(&mut BucketState) -> R + Send,
    ) -> Result<(BucketState, R), AcquireError> {
        let rate = self.config.requests_per_second();
        let capacity = self.config.burst_size();
        for _ in 0..MAX_STORE_CONFLICTS {
            let current = self.store.get(key).await.map_err(store_error)?;
            let now = self.clock.now_nanos();
            let mut next =
                current.unwrap_or_else(|| BucketState::full(capacity, now)).refill(now, rate, capacity);
            let outcome = step(&mut next);
            if self.store.compare_and_set(key, current, next).await.map_err(store_error)? {
                return Ok((next, outcome));
            }
        }
        tracing::warn!(target: "bucketeer::limiter", key, attempts = MAX_STORE_CONFLICTS, "token store contention");
        Err(AcquireError::Store(Box::new(StoreContention { attempts: MAX_STORE_CONFLICTS })))
    }

    async fn emit(&self, event: RateLimitEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}

fn store_error<E>(err: E) -> AcquireError
where
    E: std::error::Error + Send + Sync + 'static,
{
    AcquireError::Store(Box::new(err))
}

/// A single token bucket.
pub struct TokenBucketLimiter<S = InMemoryTokenStore, T = NullSink> {
    engine: Engine<S, T>,
    key: String,
}

impl<S, T> std::fmt::Debug for TokenBucketLimiter<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("key", &self.key)
            .field("config", &self.engine.config)
            .field("clock", &self.engine.clock)
            .field("sleeper", &self.engine.sleeper)
            .field("store", &"<store>")
            .finish()
    }
}

impl TokenBucketLimiter {
    /// Construct a new builder with defaults.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::new()
    }

    /// In-memory limiter from a validated config, using the real clock and tokio timers.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            engine: Engine {
                config,
                store: Arc::new(InMemoryTokenStore::new()),
                clock: Arc::new(MonotonicClock::default()),
                sleeper: Arc::new(TokioSleeper),
                sink: NullSink,
            },
            key: DEFAULT_BUCKET_KEY.to_string(),
        }
    }
}

impl<S, T> TokenBucketLimiter<S, T>
where
    S: TokenStore + 'static,
    T: TelemetrySink,
    T::Future: Send,
{
    /// Spend a token, waiting at most `max_retries` times.
    pub async fn acquire(&self) -> Result<(), AcquireError> {
        self.engine.acquire(&self.key, self.engine.config().max_retries()).await
    }

    /// Spend a token only if one is available right now.
    pub async fn try_acquire(&self) -> Result<(), AcquireError> {
        self.engine.acquire(&self.key, 0).await
    }

    /// Refill and return the available tokens. Advances the stored timestamp.
    pub async fn tokens(&self) -> Result<f64, AcquireError> {
        self.engine.tokens(&self.key).await
    }

    /// Store key of this bucket.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &RateLimiterConfig {
        self.engine.config()
    }

    /// Worst-case time `acquire` spends sleeping before it resolves.
    pub fn max_wait(&self) -> Duration {
        self.engine.config().max_wait()
    }
}

#[async_trait]
impl<S, T> RateLimiter for TokenBucketLimiter<S, T>
where
    S: TokenStore + 'static,
    T: TelemetrySink,
    T::Future: Send,
{
    async fn acquire(&self) -> Result<(), AcquireError> {
        self.engine.acquire(&self.key, self.engine.config().max_retries()).await
    }

    async fn tokens(&self) -> Result<f64, AcquireError> {
        self.engine.tokens(&self.key).await
    }
}

/// Builder for [`TokenBucketLimiter`] and [`KeyedRateLimiter`].
pub struct RateLimiterBuilder<S = InMemoryTokenStore, T = NullSink> {
    requests_per_second: f64,
    burst_size: f64,
    max_retries: u32,
    key: String,
    store: S,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    sink: T,
}

impl RateLimiterBuilder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        let defaults = RateLimiterConfig::default();
        Self {
            requests_per_second: defaults.requests_per_second(),
            burst_size: defaults.burst_size(),
            max_retries: defaults.max_retries(),
            key: DEFAULT_BUCKET_KEY.to_string(),
            store: InMemoryTokenStore::new(),
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            sink: NullSink,
        }
    }
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, T> RateLimiterBuilder<S, T> {
    /// Steady-state tokens per second. Must be > 0.
    pub fn requests_per_second(mut self, rate: f64) -> Self {
        self.requests_per_second = rate;
        self
    }

    /// Alias of [`requests_per_second`](Self::requests_per_second).
    pub fn refill_rate(self, rate: f64) -> Self {
        self.requests_per_second(rate)
    }

    /// Capacity and initial token count. Must be > 0.
    pub fn burst_size(mut self, capacity: f64) -> Self {
        self.burst_size = capacity;
        self
    }

    /// Alias of [`burst_size`](Self::burst_size).
    pub fn max_tokens(self, capacity: f64) -> Self {
        self.burst_size(capacity)
    }

    /// Wait-and-retry cycles before rejecting.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Take all three parameters from an already validated config.
    pub fn config(self, config: RateLimiterConfig) -> Self {
        self.requests_per_second(config.requests_per_second())
            .burst_size(config.burst_size())
            .max_retries(config.max_retries())
    }

    /// Store key of a single-bucket limiter. Ignored by keyed limiters.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Keep bucket state in `store` instead of a private in-memory map.
    pub fn with_store<S2>(self, store: S2) -> RateLimiterBuilder<S2, T> {
        RateLimiterBuilder {
            requests_per_second: self.requests_per_second,
            burst_size: self.burst_size,
            max_retries: self.max_retries,
            key: self.key,
            store,
            clock: self.clock,
            sleeper: self.sleeper,
            sink: self.sink,
        }
    }

    /// Provide a custom clock implementation.
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<Z>(mut self, sleeper: Z) -> Self
    where
        Z: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Emit [`RateLimitEvent`]s to `sink`.
    pub fn with_sink<T2>(self, sink: T2) -> RateLimiterBuilder<S, T2> {
        RateLimiterBuilder {
            requests_per_second: self.requests_per_second,
            burst_size: self.burst_size,
            max_retries: self.max_retries,
            key: self.key,
            store: self.store,
            clock: self.clock,
            sleeper: self.sleeper,
            sink,
        }
    }

    fn into_engine(self) -> Result<(Engine<S, T>, String), ConfigError> {
        let config =
            RateLimiterConfig::new(self.requests_per_second, self.burst_size, self.max_retries)?;
        let engine = Engine {
            config,
            store: Arc::new(self.store),
            clock: self.clock,
            sleeper: self.sleeper,
            sink: self.sink,
        };
        Ok((engine, self.key))
    }

    /// Build a single-bucket limiter, validating inputs.
    pub fn build(self) -> Result<TokenBucketLimiter<S, T>, ConfigError> {
        let (engine, key) = self.into_engine()?;
        Ok(TokenBucketLimiter { engine, key })
    }

    /// Build a limiter holding one bucket per identifier, validating inputs.
    pub fn build_keyed(self) -> Result<KeyedRateLimiter<S, T>, ConfigError> {
        let (engine, _) = self.into_engine()?;
        Ok(KeyedRateLimiter::from_engine(engine))
    }
}

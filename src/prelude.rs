//! Convenient re-exports for common bucketeer types.
pub use crate::{
    error::{AcquireError, ConfigError, RateLimitExceeded, ResilienceError},
    keyed::KeyedRateLimiter,
    limiter::{RateLimiter, TokenBucketLimiter},
    middleware::{HttpRateLimitLayer, RateLimitLayer},
    store::{InMemoryTokenStore, TokenStore},
    telemetry::{LogSink, MemorySink, TelemetrySink},
    RateLimiterConfig,
};

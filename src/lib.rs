#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # bucketeer
//!
//! Token-bucket admission control for async Rust services.
//!
//! ## Features
//!
//! - **Token bucket** with exact fractional refill, bursts up to capacity
//! - **Bounded wait-and-retry**: callers sleep until a token accrues, at most `max_retries` times
//! - **Pluggable state** behind a compare-and-set [`TokenStore`]
//! - **Per-identifier limiting** with lossless idle eviction
//! - **Tower middleware**, including an HTTP layer answering `429 Too Many Requests`
//! - **Deterministic tests** through injectable clocks and sleepers
//!
//! ## Quick Start
//!
//! ```rust
//! use bucketeer::{HttpRateLimitLayer, TokenBucketLimiter};
//! use std::sync::Arc;
//! use tower::{service_fn, Layer, ServiceExt};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let limiter = Arc::new(
//!     TokenBucketLimiter::builder()
//!         .requests_per_second(10.0)
//!         .burst_size(100.0)
//!         .max_retries(5)
//!         .build()
//!         .unwrap(),
//! );
//!
//! let handler = service_fn(|_req: http::Request<()>| async {
//!     Ok::<_, std::convert::Infallible>(http::Response::new(String::from("hello")))
//! });
//! let svc = HttpRateLimitLayer::new(limiter).layer(handler);
//!
//! let response = svc.oneshot(http::Request::new(())).await.unwrap();
//! assert_eq!(response.status(), http::StatusCode::OK);
//! # });
//! ```

pub mod bucket;
pub mod clock;
pub mod config;
pub mod error;
pub mod keyed;
pub mod limiter;
pub mod middleware;
pub mod prelude;
pub mod sleeper;
pub mod store;
pub mod telemetry;

// Re-exports
pub use bucket::BucketState;
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::RateLimiterConfig;
pub use error::{AcquireError, BoxError, ConfigError, RateLimitExceeded, ResilienceError};
pub use keyed::{KeyedBucket, KeyedRateLimiter};
pub use limiter::{RateLimiter, RateLimiterBuilder, TokenBucketLimiter};
pub use middleware::{HttpRateLimitLayer, RateLimitLayer};
pub use sleeper::{ClockSleeper, InstantSleeper, Sleeper, TokioSleeper};
pub use store::{InMemoryTokenStore, TokenStore};

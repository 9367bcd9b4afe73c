//! Validated limiter configuration.
//!
//! A [`RateLimiterConfig`] can only be obtained through validation, so any
//! limiter built from one has a positive refill rate and capacity.
//!
//! With the `config` feature (on by default) a configuration can also be
//! read from JSON. Both snake_case and camelCase keys are accepted, as are
//! the `refill_rate`/`max_tokens` aliases:
//!
//! ```rust
//! # #[cfg(feature = "config")] {
//! use bucketeer::RateLimiterConfig;
//!
//! let cfg = RateLimiterConfig::from_json_str(
//!     r#"{ "requestsPerSecond": 10, "burstSize": 100, "maxRetries": 5 }"#,
//! )
//! .unwrap();
//! assert_eq!(cfg.burst_size(), 100.0);
//! # }
//! ```

use crate::error::ConfigError;
use std::time::Duration;

/// Steady-state refill used when none is configured.
pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 10.0;
/// Capacity used when none is configured.
pub const DEFAULT_BURST_SIZE: f64 = 100.0;
/// Retry budget used when none is configured.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Immutable, validated token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    requests_per_second: f64,
    burst_size: f64,
    max_retries: u32,
}

impl RateLimiterConfig {
    /// Create a config with validation.
    pub fn new(
        requests_per_second: f64,
        burst_size: f64,
        max_retries: u32,
    ) -> Result<Self, ConfigError> {
        if !(requests_per_second.is_finite() && requests_per_second > 0.0) {
            return Err(ConfigError::InvalidRefillRate(requests_per_second));
        }
        if !(burst_size.is_finite() && burst_size > 0.0) {
            return Err(ConfigError::InvalidMaxTokens(burst_size));
        }
        Ok(Self { requests_per_second, burst_size, max_retries })
    }

    /// Tokens replenished per second.
    pub fn requests_per_second(&self) -> f64 {
        self.requests_per_second
    }

    /// Bucket capacity and starting token count.
    pub fn burst_size(&self) -> f64 {
        self.burst_size
    }

    /// Wait-and-retry cycles before a caller is rejected.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Upper bound on the total time `acquire` spends sleeping.
    ///
    /// Each wait lasts at most the time needed to accrue one whole token, so
    /// the bound is `max_retries / requests_per_second`, saturating at
    /// `Duration::MAX` for rates too slow to represent.
    pub fn max_wait(&self) -> Duration {
        let secs = f64::from(self.max_retries) / self.requests_per_second;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            burst_size: DEFAULT_BURST_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[cfg(feature = "config")]
#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(
        default = "default_rps",
        alias = "refill_rate",
        alias = "requestsPerSecond",
        alias = "refillRate"
    )]
    requests_per_second: f64,
    #[serde(default = "default_burst", alias = "max_tokens", alias = "burstSize", alias = "maxTokens")]
    burst_size: f64,
    // Signed so a negative value is reported as a config error, not a type error.
    #[serde(default = "default_retries", alias = "maxRetries")]
    max_retries: i64,
}

#[cfg(feature = "config")]
fn default_rps() -> f64 {
    DEFAULT_REQUESTS_PER_SECOND
}

#[cfg(feature = "config")]
fn default_burst() -> f64 {
    DEFAULT_BURST_SIZE
}

#[cfg(feature = "config")]
fn default_retries() -> i64 {
    i64::from(DEFAULT_MAX_RETRIES)
}

#[cfg(feature = "config")]
impl RateLimiterConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let max_retries = u32::try_from(raw.max_retries)
            .map_err(|_| ConfigError::InvalidMaxRetries(raw.max_retries))?;
        Self::new(raw.requests_per_second, raw.burst_size, max_retries)
    }
}

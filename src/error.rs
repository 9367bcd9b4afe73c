//! Error types for the limiter and its middleware
use std::fmt;
use std::time::Duration;

/// Boxed error produced by a [`TokenStore`](crate::store::TokenStore) backend.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Invalid limiter configuration. No limiter is built when this is returned.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// `requests_per_second` must be finite and > 0.
    #[error("requests_per_second must be finite and > 0 (got {0})")]
    InvalidRefillRate(f64),
    /// `burst_size` must be finite and > 0.
    #[error("burst_size must be finite and > 0 (got {0})")]
    InvalidMaxTokens(f64),
    /// `max_retries` must be >= 0.
    #[error("max_retries must be >= 0 (got {0})")]
    InvalidMaxRetries(i64),
    /// The configuration document could not be parsed.
    #[error("malformed rate limiter configuration: {0}")]
    Parse(String),
}

/// The retry budget ran out before a token became available.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("rate limit exceeded after {retries} retries (next token in {wait:?})")]
pub struct RateLimitExceeded {
    /// Wait-and-retry cycles performed before giving up.
    pub retries: u32,
    /// Time until the bucket would have held a whole token.
    pub wait: Duration,
}

/// Every compare-and-set against the store lost a race.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("token store contention: {attempts} conflicting writes")]
pub struct StoreContention {
    pub attempts: u32,
}

/// Failure of [`acquire`](crate::RateLimiter::acquire).
#[derive(thiserror::Error, Debug)]
pub enum AcquireError {
    /// The caller is throttled.
    #[error(transparent)]
    Exceeded(#[from] RateLimitExceeded),
    /// The state store failed. The in-memory store only produces this through
    /// [`StoreContention`].
    #[error("token store failure: {0}")]
    Store(#[source] BoxError),
}

impl AcquireError {
    /// Throttling details, if this is a rejection.
    pub fn exceeded(&self) -> Option<&RateLimitExceeded> {
        match self {
            Self::Exceeded(e) => Some(e),
            Self::Store(_) => None,
        }
    }

    /// Check if this error is a rejection rather than a backend failure.
    pub fn is_exceeded(&self) -> bool {
        matches!(self, Self::Exceeded(_))
    }
}

/// Error returned by services wrapped in [`RateLimitLayer`](crate::RateLimitLayer).
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The limiter rejected the request; the inner service was not called.
    RateLimited { wait: Duration },
    /// The limiter could not reach its state store.
    Infrastructure(String),
    /// The inner service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { wait } => {
                write!(f, "rate limited (retry after {:?})", wait)
            }
            Self::Infrastructure(msg) => write!(f, "rate limiter unavailable: {}", msg),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Check if the request was rejected by the limiter.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Suggested wait before retrying, if rate limited.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { wait } => Some(*wait),
            _ => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<AcquireError> for ResilienceError<E> {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::Exceeded(e) => Self::RateLimited { wait: e.wait },
            AcquireError::Store(e) => Self::Infrastructure(e.to_string()),
        }
    }
}
